//! Request and response types for the pull-point operations.
//!
//! | Operation | Sent to | Body |
//! |-----------|---------|------|
//! | CreatePullPointSubscription | event service | `tev:` |
//! | PullMessages | subscription reference | `tev:` |
//! | Seek | subscription reference | `tev:` |
//! | SetSynchronizationPoint | subscription reference | `tev:` |
//! | Renew | subscription reference | `wsnt:` |
//! | Unsubscribe | subscription reference | `wsnt:` |

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::message::{CONCRETE_SET_DIALECT, NotificationMessage};
use super::{format_utc, parse_utc};
use crate::client::Operation;
use crate::duration;
use crate::soap::{Element, Namespaces, Response};

const WSN_SUBSCRIPTION_MANAGER: &str = "http://docs.oasis-open.org/wsn/bw-2/SubscriptionManager";

/// Options sent in `tev:SubscriptionPolicy`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionPolicy {
    /// Ask the device to deliver only `Changed` messages, skipping the
    /// initial `Initialized` burst.
    pub changed_only: bool,
}

fn read_time(element: &Element, name: &str) -> Result<DateTime<Utc>, String> {
    let text = element
        .child_text(name)
        .ok_or_else(|| format!("{} has no {name}", element.local_name()))?;
    parse_utc(text)
}

#[derive(Debug, Clone)]
pub struct CreatePullPointSubscription {
    /// Topic expression in the ConcreteSet dialect; empty means all topics.
    pub filter: String,
    pub initial_termination: Duration,
    pub policy: SubscriptionPolicy,
}

/// Result of `CreatePullPointSubscription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSubscription {
    pub reference: String,
    pub current_time: DateTime<Utc>,
    pub termination_time: DateTime<Utc>,
}

impl Operation for CreatePullPointSubscription {
    type Response = CreatedSubscription;

    fn name(&self) -> &str {
        "CreatePullPointSubscription"
    }

    fn action(&self, ns: &Namespaces) -> String {
        format!("{}/EventPortType/CreatePullPointSubscriptionRequest", ns.events)
    }

    fn to_element(&self, _: &Namespaces) -> Element {
        let mut request = Element::new("tev:CreatePullPointSubscription");
        if !self.filter.is_empty() {
            request.push(
                Element::new("tev:Filter").with_child(
                    Element::new("wsnt:TopicExpression")
                        .with_attr("Dialect", CONCRETE_SET_DIALECT)
                        .with_text(&self.filter),
                ),
            );
        }
        request.push(
            Element::new("tev:InitialTerminationTime")
                .with_text(duration::format(self.initial_termination)),
        );
        if self.policy.changed_only {
            request.push(
                Element::new("tev:SubscriptionPolicy")
                    .with_child(Element::new("tt:ChangedOnly").with_text("true")),
            );
        }
        request
    }
}

impl Response for CreatedSubscription {
    fn from_element(element: &Element) -> Result<Self, String> {
        let reference = element
            .path(&["SubscriptionReference", "Address"])
            .map(|a| a.text().to_string())
            .filter(|a| !a.is_empty())
            .ok_or("response has no SubscriptionReference address")?;

        Ok(CreatedSubscription {
            reference,
            current_time: read_time(element, "CurrentTime")?,
            termination_time: read_time(element, "TerminationTime")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PullMessages {
    pub timeout: Duration,
    pub message_limit: u32,
}

/// One batch returned by `PullMessages`. May be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullBatch {
    pub current_time: DateTime<Utc>,
    pub termination_time: DateTime<Utc>,
    pub messages: Vec<NotificationMessage>,
}

impl Operation for PullMessages {
    type Response = PullBatch;

    fn name(&self) -> &str {
        "PullMessages"
    }

    fn action(&self, ns: &Namespaces) -> String {
        format!("{}/PullPointSubscription/PullMessagesRequest", ns.events)
    }

    fn to_element(&self, _: &Namespaces) -> Element {
        Element::new("tev:PullMessages")
            .with_child(Element::new("tev:Timeout").with_text(duration::format(self.timeout)))
            .with_child(Element::new("tev:MessageLimit").with_text(self.message_limit.to_string()))
    }
}

impl Response for PullBatch {
    fn from_element(element: &Element) -> Result<Self, String> {
        // The peer has already dequeued these, so one unreadable message
        // must not cost the rest of the batch.
        let messages = element
            .children_named("NotificationMessage")
            .filter_map(|el| match NotificationMessage::from_element(el) {
                Ok(message) => Some(message),
                Err(reason) => {
                    tracing::warn!(%reason, "skipping unreadable notification message");
                    None
                }
            })
            .collect();

        Ok(PullBatch {
            current_time: read_time(element, "CurrentTime")?,
            termination_time: read_time(element, "TerminationTime")?,
            messages,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Renew {
    pub extension: Duration,
}

/// Result of `Renew`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Renewal {
    /// Peer clock when the renewal was applied.
    pub current_time: DateTime<Utc>,
    pub termination_time: DateTime<Utc>,
}

impl Operation for Renew {
    type Response = Renewal;

    fn name(&self) -> &str {
        "Renew"
    }

    fn action(&self, _: &Namespaces) -> String {
        format!("{WSN_SUBSCRIPTION_MANAGER}/RenewRequest")
    }

    fn to_element(&self, _: &Namespaces) -> Element {
        Element::new("wsnt:Renew").with_child(
            Element::new("wsnt:TerminationTime").with_text(duration::format(self.extension)),
        )
    }
}

impl Response for Renewal {
    fn from_element(element: &Element) -> Result<Self, String> {
        Ok(Renewal {
            current_time: read_time(element, "CurrentTime")?,
            termination_time: read_time(element, "TerminationTime")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Seek {
    pub utc_time: DateTime<Utc>,
    pub reverse: bool,
}

impl Operation for Seek {
    type Response = ();

    fn name(&self) -> &str {
        "Seek"
    }

    fn action(&self, ns: &Namespaces) -> String {
        format!("{}/PullPointSubscription/SeekRequest", ns.events)
    }

    fn to_element(&self, _: &Namespaces) -> Element {
        let mut request = Element::new("tev:Seek")
            .with_child(Element::new("tev:UtcTime").with_text(format_utc(self.utc_time)));
        if self.reverse {
            request.push(Element::new("tev:Reverse").with_text("true"));
        }
        request
    }
}

#[derive(Debug, Clone, Default)]
pub struct SetSynchronizationPoint;

impl Operation for SetSynchronizationPoint {
    type Response = ();

    fn name(&self) -> &str {
        "SetSynchronizationPoint"
    }

    fn action(&self, ns: &Namespaces) -> String {
        format!("{}/PullPointSubscription/SetSynchronizationPointRequest", ns.events)
    }

    fn to_element(&self, _: &Namespaces) -> Element {
        Element::new("tev:SetSynchronizationPoint")
    }
}

#[derive(Debug, Clone, Default)]
pub struct Unsubscribe;

impl Operation for Unsubscribe {
    type Response = ();

    fn name(&self) -> &str {
        "Unsubscribe"
    }

    fn action(&self, _: &Namespaces) -> String {
        format!("{WSN_SUBSCRIPTION_MANAGER}/UnsubscribeRequest")
    }

    fn to_element(&self, _: &Namespaces) -> Element {
        Element::new("wsnt:Unsubscribe")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn create_request_omits_empty_filter_and_default_policy() {
        let op = CreatePullPointSubscription {
            filter: String::new(),
            initial_termination: Duration::from_secs(3600),
            policy: SubscriptionPolicy::default(),
        };
        let xml = op.to_element(&Namespaces::default()).to_xml();
        assert_eq!(
            xml,
            "<tev:CreatePullPointSubscription><tev:InitialTerminationTime>PT1H</tev:InitialTerminationTime></tev:CreatePullPointSubscription>"
        );
    }

    #[test]
    fn create_request_with_filter_and_policy() {
        let op = CreatePullPointSubscription {
            filter: "tns1:VideoSource/MotionAlarm".to_string(),
            initial_termination: Duration::from_secs(60),
            policy: SubscriptionPolicy { changed_only: true },
        };
        let el = op.to_element(&Namespaces::default());
        let expr = el.path(&["Filter", "TopicExpression"]).unwrap();
        assert_eq!(expr.text(), "tns1:VideoSource/MotionAlarm");
        assert_eq!(expr.attr("Dialect"), Some(CONCRETE_SET_DIALECT));
        assert_eq!(el.child_text("InitialTerminationTime"), Some("PT1M"));
        assert_eq!(
            el.path(&["SubscriptionPolicy", "ChangedOnly"]).map(Element::text),
            Some("true")
        );
    }

    #[test]
    fn created_subscription_requires_reference() {
        let ok = Element::parse(
            b"<CreatePullPointSubscriptionResponse>
                <SubscriptionReference><Address>http://host/subscription/1</Address></SubscriptionReference>
                <CurrentTime>2024-05-01T12:00:00Z</CurrentTime>
                <TerminationTime>2024-05-01T13:00:00Z</TerminationTime>
            </CreatePullPointSubscriptionResponse>",
        )
        .unwrap();
        let created = CreatedSubscription::from_element(&ok).unwrap();
        assert_eq!(created.reference, "http://host/subscription/1");
        assert_eq!(
            created.termination_time,
            Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap()
        );

        let missing = Element::parse(
            b"<R><CurrentTime>2024-05-01T12:00:00Z</CurrentTime><TerminationTime>2024-05-01T13:00:00Z</TerminationTime></R>",
        )
        .unwrap();
        assert!(CreatedSubscription::from_element(&missing).is_err());
    }

    #[test]
    fn pull_request_encodes_timeout_token() {
        let op = PullMessages {
            timeout: Duration::from_secs(30),
            message_limit: 10,
        };
        let el = op.to_element(&Namespaces::default());
        assert_eq!(el.child_text("Timeout"), Some("PT30S"));
        assert_eq!(el.child_text("MessageLimit"), Some("10"));
    }

    #[test]
    fn empty_pull_batch_is_valid() {
        let el = Element::parse(
            b"<PullMessagesResponse><CurrentTime>2024-05-01T12:00:30Z</CurrentTime><TerminationTime>2024-05-01T13:00:00Z</TerminationTime></PullMessagesResponse>",
        )
        .unwrap();
        let batch = PullBatch::from_element(&el).unwrap();
        assert!(batch.messages.is_empty());
    }

    #[test]
    fn pull_batch_skips_unreadable_messages() {
        let el = Element::parse(
            br#"<PullMessagesResponse>
                <CurrentTime>2024-05-01T12:00:30Z</CurrentTime>
                <TerminationTime>2024-05-01T13:00:00Z</TerminationTime>
                <NotificationMessage>
                    <Topic>tns1:VideoSource/MotionAlarm</Topic>
                    <Message><Message UtcTime="2024-05-01T12:00:01Z" PropertyOperation="Changed"/></Message>
                </NotificationMessage>
                <NotificationMessage>
                    <Topic>tns1:VideoSource/MotionAlarm</Topic>
                    <Message><Message PropertyOperation="Changed"/></Message>
                </NotificationMessage>
                <NotificationMessage>
                    <Topic>tns1:Device/Trigger/Relay</Topic>
                    <Message><Message UtcTime="2024-05-01T12:00:02Z" PropertyOperation="Toggled"/></Message>
                </NotificationMessage>
            </PullMessagesResponse>"#,
        )
        .unwrap();
        let batch = PullBatch::from_element(&el).unwrap();
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.messages[0].topic(), "tns1:VideoSource/MotionAlarm");
        assert_eq!(batch.messages[1].topic(), "tns1:Device/Trigger/Relay");
        assert_eq!(batch.messages[1].property_operation(), None);
    }

    #[test]
    fn seek_only_sends_reverse_when_set() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let forward = Seek {
            utc_time: at,
            reverse: false,
        }
        .to_element(&Namespaces::default());
        assert_eq!(forward.child_text("UtcTime"), Some("2024-05-01T12:00:00Z"));
        assert!(forward.child("Reverse").is_none());

        let backward = Seek {
            utc_time: at,
            reverse: true,
        }
        .to_element(&Namespaces::default());
        assert_eq!(backward.child_text("Reverse"), Some("true"));
    }

    #[test]
    fn actions_follow_port_types() {
        let ns = Namespaces::default();
        assert_eq!(
            PullMessages {
                timeout: Duration::from_secs(1),
                message_limit: 1
            }
            .action(&ns),
            "http://www.onvif.org/ver10/events/wsdl/PullPointSubscription/PullMessagesRequest"
        );
        assert_eq!(
            Unsubscribe.action(&ns),
            "http://docs.oasis-open.org/wsn/bw-2/SubscriptionManager/UnsubscribeRequest"
        );
    }
}
