use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use super::{format_utc, parse_utc};
use crate::soap::Element;

/// Topic expression dialect for concrete topic paths (`tns1:VideoSource/MotionAlarm`).
pub const CONCRETE_SET_DIALECT: &str = "http://www.onvif.org/ver10/tev/topicExpression/ConcreteSet";

/// What happened to the property a message describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyOperation {
    /// First report of a property's state (also re-sent after a synchronization point).
    Initialized,
    Changed,
    Deleted,
}

impl PropertyOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::Changed => "Changed",
            Self::Deleted => "Deleted",
        }
    }
}

impl FromStr for PropertyOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Initialized" => Ok(Self::Initialized),
            "Changed" => Ok(Self::Changed),
            "Deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown PropertyOperation {other:?}")),
        }
    }
}

impl fmt::Display for PropertyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered `Name → Value` pairs from a `tt:Source`, `tt:Key` or `tt:Data` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemSet {
    items: Vec<(String, String)>,
}

impl ItemSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item (builder style).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.items.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Read `tt:SimpleItem` children. Other item kinds are skipped.
    fn from_element(element: &Element) -> Self {
        let items = element
            .children_named("SimpleItem")
            .filter_map(|item| {
                Some((item.attr("Name")?.to_string(), item.attr("Value")?.to_string()))
            })
            .collect();
        ItemSet { items }
    }

    fn to_element(&self, name: &str) -> Element {
        let mut element = Element::new(name);
        for (n, v) in &self.items {
            element.push(
                Element::new("tt:SimpleItem")
                    .with_attr("Name", n)
                    .with_attr("Value", v),
            );
        }
        element
    }
}

/// One event delivered through a pull point. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    topic: String,
    producer: Option<String>,
    property_operation: Option<PropertyOperation>,
    utc_time: DateTime<Utc>,
    source: ItemSet,
    key: ItemSet,
    data: ItemSet,
}

impl NotificationMessage {
    pub fn new(topic: impl Into<String>, utc_time: DateTime<Utc>) -> Self {
        NotificationMessage {
            topic: topic.into(),
            producer: None,
            property_operation: None,
            utc_time,
            source: ItemSet::default(),
            key: ItemSet::default(),
            data: ItemSet::default(),
        }
    }

    pub fn with_producer(mut self, producer: impl Into<String>) -> Self {
        self.producer = Some(producer.into());
        self
    }

    pub fn with_operation(mut self, operation: PropertyOperation) -> Self {
        self.property_operation = Some(operation);
        self
    }

    pub fn with_source(mut self, source: ItemSet) -> Self {
        self.source = source;
        self
    }

    pub fn with_key(mut self, key: ItemSet) -> Self {
        self.key = key;
        self
    }

    pub fn with_data(mut self, data: ItemSet) -> Self {
        self.data = data;
        self
    }

    /// Hierarchical topic, e.g. `tns1:VideoSource/MotionAlarm`.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Address of the producing entity.
    pub fn producer(&self) -> Option<&str> {
        self.producer.as_deref()
    }

    pub fn property_operation(&self) -> Option<PropertyOperation> {
        self.property_operation
    }

    pub fn utc_time(&self) -> DateTime<Utc> {
        self.utc_time
    }

    pub fn source(&self) -> &ItemSet {
        &self.source
    }

    pub fn key(&self) -> &ItemSet {
        &self.key
    }

    pub fn data(&self) -> &ItemSet {
        &self.data
    }

    /// Read a `wsnt:NotificationMessage` element.
    ///
    /// ```text
    /// <wsnt:NotificationMessage>
    ///   <wsnt:Topic Dialect="...ConcreteSet">tns1:VideoSource/MotionAlarm</wsnt:Topic>
    ///   <wsnt:ProducerReference><wsa:Address>...</wsa:Address></wsnt:ProducerReference>
    ///   <wsnt:Message>
    ///     <tt:Message UtcTime="..." PropertyOperation="Changed">
    ///       <tt:Source>/<tt:Key>/<tt:Data> with tt:SimpleItem Name/Value
    ///     </tt:Message>
    ///   </wsnt:Message>
    /// </wsnt:NotificationMessage>
    /// ```
    pub fn from_element(element: &Element) -> Result<Self, String> {
        let topic = element
            .child_text("Topic")
            .filter(|t| !t.is_empty())
            .ok_or("NotificationMessage has no Topic")?
            .to_string();

        let producer = element
            .path(&["ProducerReference", "Address"])
            .map(|a| a.text().to_string());

        let message = element
            .path(&["Message", "Message"])
            .ok_or("NotificationMessage has no tt:Message")?;

        let utc_time = message
            .attr("UtcTime")
            .ok_or("tt:Message has no UtcTime")
            .map_err(str::to_string)
            .and_then(parse_utc)?;

        // Values outside the known set are treated as absent.
        let property_operation = message
            .attr("PropertyOperation")
            .and_then(|op| op.parse::<PropertyOperation>().ok());

        let items = |name: &str| message.child(name).map(ItemSet::from_element).unwrap_or_default();

        Ok(NotificationMessage {
            topic,
            producer,
            property_operation,
            utc_time,
            source: items("Source"),
            key: items("Key"),
            data: items("Data"),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut message = Element::new("tt:Message").with_attr("UtcTime", format_utc(self.utc_time));
        if let Some(op) = self.property_operation {
            message = message.with_attr("PropertyOperation", op.as_str());
        }
        message = message
            .with_child(self.source.to_element("tt:Source"))
            .with_child(self.key.to_element("tt:Key"))
            .with_child(self.data.to_element("tt:Data"));

        let mut element = Element::new("wsnt:NotificationMessage").with_child(
            Element::new("wsnt:Topic")
                .with_attr("Dialect", CONCRETE_SET_DIALECT)
                .with_text(&self.topic),
        );
        if let Some(producer) = &self.producer {
            element.push(
                Element::new("wsnt:ProducerReference")
                    .with_child(Element::new("wsa:Address").with_text(producer)),
            );
        }
        element.with_child(Element::new("wsnt:Message").with_child(message))
    }
}
