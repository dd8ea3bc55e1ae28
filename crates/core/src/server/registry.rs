//! Server-side pull points.
//!
//! Each subscription owns a bounded message queue. [`publish`] fans a message
//! out to every live pull point whose filter accepts it and wakes any pull
//! blocked on that queue.
//!
//! ## Pull point lifecycle
//!
//! ```text
//! create        -> live (queue seeded with an Initialized snapshot)
//! renew         -> live, termination moved
//! unsubscribe   -> removed, blocked pulls woken and faulted
//! clock passes termination -> removed on next lookup or publish
//! ```
//!
//! [`publish`]: SubscriptionRegistry::publish

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::events::{NotificationMessage, PropertyOperation};

/// ConcreteSet topic filter: `|`-separated topic paths.
///
/// A path matches itself and every topic below it. A trailing `//.`
/// (the ONVIF subtree marker) is accepted and means the same thing.
/// An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicFilter {
    alternatives: Vec<String>,
}

impl TopicFilter {
    pub fn parse(expression: &str) -> Self {
        let alternatives = expression
            .split('|')
            .map(|alt| alt.trim().trim_end_matches("//.").trim_end_matches('/'))
            .filter(|alt| !alt.is_empty())
            .map(str::to_string)
            .collect();
        TopicFilter { alternatives }
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.alternatives.is_empty()
            || self.alternatives.iter().any(|alt| {
                topic == alt
                    || topic
                        .strip_prefix(alt.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
    }
}

/// One subscription as the server sees it.
#[derive(Debug)]
pub struct PullPoint {
    id: u64,
    filter: TopicFilter,
    changed_only: bool,
    termination: Mutex<DateTime<Utc>>,
    queue: Mutex<VecDeque<NotificationMessage>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl PullPoint {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    pub fn termination_time(&self) -> DateTime<Utc> {
        *self.termination.lock()
    }

    pub fn set_termination_time(&self, termination: DateTime<Utc>) {
        *self.termination.lock() = termination;
        tracing::debug!(subscription = self.id, %termination, "termination moved");
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.termination_time()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn accepts(&self, message: &NotificationMessage) -> bool {
        if self.changed_only
            && message.property_operation() == Some(PropertyOperation::Initialized)
        {
            return false;
        }
        self.filter.matches(message.topic())
    }

    fn enqueue(&self, messages: impl IntoIterator<Item = NotificationMessage>, capacity: usize) {
        let mut queue = self.queue.lock();
        let mut dropped = 0;
        for message in messages {
            if queue.len() >= capacity {
                queue.pop_front();
                dropped += 1;
            }
            queue.push_back(message);
        }
        if dropped > 0 {
            tracing::warn!(subscription = self.id, dropped, "queue full, dropped oldest");
        }
        self.ready.notify_all();
    }

    fn replace_queue(&self, messages: Vec<NotificationMessage>) {
        let mut queue = self.queue.lock();
        *queue = messages.into();
        self.ready.notify_all();
    }

    /// Take up to `limit` messages, blocking up to `timeout` for the first.
    ///
    /// Returns `None` if the pull point is closed while waiting.
    pub fn wait_messages(&self, timeout: Duration, limit: usize) -> Option<Vec<NotificationMessage>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut queue = self.queue.lock();
        while queue.is_empty() && !self.is_closed() {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut queue, deadline).timed_out() {
                        break;
                    }
                }
                None => self.ready.wait(&mut queue),
            }
        }
        if self.is_closed() {
            return None;
        }
        let n = limit.min(queue.len());
        Some(queue.drain(..n).collect())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _queue = self.queue.lock();
        self.ready.notify_all();
    }
}

/// Thread-safe table of live pull points plus the published-event history
/// used by seek and synchronization points.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    pull_points: Arc<RwLock<HashMap<u64, Arc<PullPoint>>>>,
    /// Last message per property (topic + source), replayed as `Initialized`.
    properties: Arc<Mutex<Vec<NotificationMessage>>>,
    /// Recently published messages in publish order, for seek.
    history: Arc<Mutex<VecDeque<NotificationMessage>>>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
    history_capacity: usize,
}

impl SubscriptionRegistry {
    pub fn new(queue_capacity: usize, history_capacity: usize) -> Self {
        SubscriptionRegistry {
            pull_points: Arc::new(RwLock::new(HashMap::new())),
            properties: Arc::new(Mutex::new(Vec::new())),
            history: Arc::new(Mutex::new(VecDeque::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            queue_capacity: queue_capacity.max(1),
            history_capacity,
        }
    }

    /// Register a pull point. Unless `changed_only`, its queue starts with
    /// the current state of every matching property.
    pub fn create(
        &self,
        filter: TopicFilter,
        changed_only: bool,
        termination: DateTime<Utc>,
    ) -> Arc<PullPoint> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pull_point = Arc::new(PullPoint {
            id,
            filter,
            changed_only,
            termination: Mutex::new(termination),
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        if !changed_only {
            self.synchronize(&pull_point);
        }

        self.pull_points.write().insert(id, pull_point.clone());
        let total = self.pull_points.read().len();
        tracing::debug!(subscription = id, %termination, total_subscriptions = total, "pull point created");
        pull_point
    }

    /// Look up a live pull point. Expired ones are removed and reported missing.
    pub fn get(&self, id: u64, now: DateTime<Utc>) -> Option<Arc<PullPoint>> {
        let pull_point = self.pull_points.read().get(&id).cloned()?;
        if pull_point.is_expired(now) {
            tracing::info!(subscription = id, "subscription expired");
            self.remove(id);
            return None;
        }
        Some(pull_point)
    }

    /// Remove a pull point and wake any pull blocked on it.
    pub fn remove(&self, id: u64) -> Option<Arc<PullPoint>> {
        let removed = self.pull_points.write().remove(&id);
        if let Some(pull_point) = &removed {
            pull_point.close();
            let total = self.pull_points.read().len();
            tracing::debug!(subscription = id, total_subscriptions = total, "pull point removed");
        }
        removed
    }

    /// Drop every pull point whose termination time has passed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<u64> = self
            .pull_points
            .read()
            .values()
            .filter(|p| p.is_expired(now))
            .map(|p| p.id)
            .collect();
        for id in &expired {
            self.remove(*id);
        }
        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "expired subscriptions purged");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.pull_points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `message` to every matching live pull point. Returns how many
    /// queues received it.
    pub fn publish(&self, message: NotificationMessage, now: DateTime<Utc>) -> usize {
        self.purge_expired(now);
        self.record(&message);

        let targets: Vec<Arc<PullPoint>> = self
            .pull_points
            .read()
            .values()
            .filter(|p| p.accepts(&message))
            .cloned()
            .collect();

        for pull_point in &targets {
            pull_point.enqueue([message.clone()], self.queue_capacity);
        }

        tracing::trace!(topic = message.topic(), delivered = targets.len(), "published");
        targets.len()
    }

    /// Queue the current state of every matching property as `Initialized`.
    pub fn synchronize(&self, pull_point: &PullPoint) {
        let snapshot: Vec<NotificationMessage> = self
            .properties
            .lock()
            .iter()
            .filter(|m| pull_point.filter.matches(m.topic()))
            .map(|m| m.clone().with_operation(PropertyOperation::Initialized))
            .collect();
        tracing::debug!(subscription = pull_point.id, properties = snapshot.len(), "synchronization point");
        pull_point.enqueue(snapshot, self.queue_capacity);
    }

    /// Reposition a pull point in the history.
    ///
    /// Forward: queue every retained message at or after `utc_time`, oldest
    /// first. Reverse: every message at or before `utc_time`, newest first.
    pub fn seek(&self, pull_point: &PullPoint, utc_time: DateTime<Utc>, reverse: bool) {
        let history = self.history.lock();
        let matching = history.iter().filter(|m| pull_point.accepts(m));
        let mut replay: Vec<NotificationMessage> = if reverse {
            matching.filter(|m| m.utc_time() <= utc_time).cloned().collect()
        } else {
            matching.filter(|m| m.utc_time() >= utc_time).cloned().collect()
        };
        drop(history);

        replay.sort_by_key(|m| m.utc_time());
        if reverse {
            replay.reverse();
        }
        replay.truncate(self.queue_capacity);

        tracing::debug!(subscription = pull_point.id, %utc_time, reverse, queued = replay.len(), "seek");
        pull_point.replace_queue(replay);
    }

    fn record(&self, message: &NotificationMessage) {
        if self.history_capacity > 0 {
            let mut history = self.history.lock();
            if history.len() >= self.history_capacity {
                history.pop_front();
            }
            history.push_back(message.clone());
        }

        let Some(operation) = message.property_operation() else {
            return;
        };
        let mut properties = self.properties.lock();
        let existing = properties
            .iter()
            .position(|m| m.topic() == message.topic() && m.source() == message.source());
        match (operation, existing) {
            (PropertyOperation::Deleted, Some(i)) => {
                properties.remove(i);
            }
            (PropertyOperation::Deleted, None) => {}
            (_, Some(i)) => properties[i] = message.clone(),
            (_, None) => properties.push(message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::TimeZone;

    use super::*;
    use crate::events::ItemSet;

    fn at(m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, m, s).unwrap()
    }

    fn motion(state: &str, time: DateTime<Utc>) -> NotificationMessage {
        NotificationMessage::new("tns1:VideoSource/MotionAlarm", time)
            .with_operation(PropertyOperation::Changed)
            .with_source(ItemSet::new().with("Source", "VideoSource_1"))
            .with_data(ItemSet::new().with("State", state))
    }

    #[test]
    fn topic_filter_matches_subtrees() {
        let f = TopicFilter::parse("tns1:VideoSource | tns1:Device/Trigger//.");
        assert!(f.matches("tns1:VideoSource"));
        assert!(f.matches("tns1:VideoSource/MotionAlarm"));
        assert!(f.matches("tns1:Device/Trigger/DigitalInput"));
        assert!(!f.matches("tns1:VideoSourceX"));
        assert!(!f.matches("tns1:RuleEngine/CellMotionDetector/Motion"));
        assert!(TopicFilter::parse("").matches("anything"));
    }

    #[test]
    fn publish_reaches_matching_pull_points_only() {
        let registry = SubscriptionRegistry::new(16, 16);
        let all = registry.create(TopicFilter::default(), false, at(30, 0));
        let device = registry.create(TopicFilter::parse("tns1:Device"), false, at(30, 0));

        assert_eq!(registry.publish(motion("true", at(0, 1)), at(0, 1)), 1);
        assert_eq!(all.pending(), 1);
        assert_eq!(device.pending(), 0);
    }

    #[test]
    fn expired_pull_points_are_removed() {
        let registry = SubscriptionRegistry::new(16, 16);
        let p = registry.create(TopicFilter::default(), false, at(1, 0));
        assert!(registry.get(p.id(), at(0, 59)).is_some());
        assert!(registry.get(p.id(), at(1, 0)).is_none());
        assert!(registry.is_empty());
        assert!(p.is_closed());
    }

    #[test]
    fn new_pull_point_gets_initialized_snapshot() {
        let registry = SubscriptionRegistry::new(16, 16);
        registry.publish(motion("false", at(0, 1)), at(0, 1));
        registry.publish(motion("true", at(0, 2)), at(0, 2));

        let p = registry.create(TopicFilter::default(), false, at(30, 0));
        let queued = p.wait_messages(Duration::ZERO, 10).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].property_operation(), Some(PropertyOperation::Initialized));
        assert_eq!(queued[0].data().get("State"), Some("true"));

        let quiet = registry.create(TopicFilter::default(), true, at(30, 0));
        assert_eq!(quiet.pending(), 0);
    }

    #[test]
    fn deleted_property_leaves_snapshot() {
        let registry = SubscriptionRegistry::new(16, 16);
        registry.publish(motion("true", at(0, 1)), at(0, 1));
        registry.publish(
            motion("true", at(0, 2)).with_operation(PropertyOperation::Deleted),
            at(0, 2),
        );
        let p = registry.create(TopicFilter::default(), false, at(30, 0));
        assert_eq!(p.pending(), 0);
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let registry = SubscriptionRegistry::new(2, 0);
        let p = registry.create(TopicFilter::default(), true, at(30, 0));
        for s in 1..=3 {
            registry.publish(motion(&s.to_string(), at(0, s)), at(0, s));
        }
        let queued = p.wait_messages(Duration::ZERO, 10).unwrap();
        let states: Vec<_> = queued.iter().map(|m| m.data().get("State").unwrap()).collect();
        assert_eq!(states, ["2", "3"]);
    }

    #[test]
    fn seek_replays_history_in_both_directions() {
        let registry = SubscriptionRegistry::new(16, 16);
        for s in 1..=4 {
            registry.publish(motion(&s.to_string(), at(0, s)), at(0, s));
        }
        let p = registry.create(TopicFilter::default(), true, at(30, 0));

        registry.seek(&p, at(0, 3), false);
        let forward = p.wait_messages(Duration::ZERO, 10).unwrap();
        assert_eq!(forward.iter().map(|m| m.utc_time()).collect::<Vec<_>>(), [at(0, 3), at(0, 4)]);

        registry.seek(&p, at(0, 2), true);
        let backward = p.wait_messages(Duration::ZERO, 10).unwrap();
        assert_eq!(backward.iter().map(|m| m.utc_time()).collect::<Vec<_>>(), [at(0, 2), at(0, 1)]);
    }

    #[test]
    fn wait_returns_when_message_arrives() {
        let registry = SubscriptionRegistry::new(16, 0);
        let p = registry.create(TopicFilter::default(), true, at(30, 0));

        let publisher = {
            let registry = registry.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                registry.publish(motion("true", at(0, 1)), at(0, 1));
            })
        };

        let started = Instant::now();
        let got = p.wait_messages(Duration::from_secs(5), 10).unwrap();
        assert_eq!(got.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        publisher.join().unwrap();
    }

    #[test]
    fn wait_times_out_empty_and_wakes_on_remove() {
        let registry = SubscriptionRegistry::new(16, 0);
        let p = registry.create(TopicFilter::default(), true, at(30, 0));
        assert_eq!(p.wait_messages(Duration::from_millis(20), 10), Some(Vec::new()));

        let remover = {
            let registry = registry.clone();
            let id = p.id();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                registry.remove(id);
            })
        };
        assert_eq!(p.wait_messages(Duration::from_secs(5), 10), None);
        remover.join().unwrap();
    }
}
