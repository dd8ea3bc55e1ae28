use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::message::NotificationMessage;
use super::operations::{
    CreatePullPointSubscription, PullBatch, PullMessages, Renew, Renewal, Seek,
    SetSynchronizationPoint, SubscriptionPolicy, Unsubscribe,
};
use crate::client::Client;
use crate::error::{Error, Result};
use crate::transport::CallContext;

/// Extra HTTP time granted on top of a pull timeout when the caller's
/// context has no deadline, so the transport never cuts off a long poll.
pub const PULL_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a pull-point subscription.
///
/// ```text
/// create()      -> Active
/// renew()       -> Renewing -> Active   (back to Active on failure too)
/// unsubscribe() -> Unsubscribed
/// clock passes termination_time -> Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Active,
    /// A renew call is in flight.
    Renewing,
    Expired,
}

/// Client-side record of one subscription.
///
/// All fields are peer-reported; only [`SubscriptionManager`] writes them.
/// Times are on the peer's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    reference: String,
    filter: Option<String>,
    created_at: DateTime<Utc>,
    current_time: DateTime<Utc>,
    termination_time: DateTime<Utc>,
    state: SubscriptionState,
}

impl Subscription {
    /// Opaque subscription-manager URL; the endpoint for every later call.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Peer clock at creation.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Peer clock at the last exchange.
    pub fn current_time(&self) -> DateTime<Utc> {
        self.current_time
    }

    pub fn termination_time(&self) -> DateTime<Utc> {
        self.termination_time
    }

    /// Recorded state, ignoring the clock.
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// State as of `now` (peer clock): a live subscription whose termination
    /// time has passed reports [`SubscriptionState::Expired`].
    pub fn state_at(&self, now: DateTime<Utc>) -> SubscriptionState {
        match self.state {
            SubscriptionState::Active | SubscriptionState::Renewing
                if now >= self.termination_time =>
            {
                SubscriptionState::Expired
            }
            state => state,
        }
    }

    /// Time left before expiry as of `now`, zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.termination_time - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Drives pull-point subscriptions over a [`Client`].
///
/// Arguments are validated before any network I/O. Remote faults (unknown or
/// expired reference, refused renewal, ...) surface as [`Error::Fault`].
/// Nothing is retried.
///
/// The reference-based methods ([`pull`](Self::pull), [`renew`](Self::renew),
/// ...) are stateless. The `*_subscription` variants additionally apply the
/// result to a caller-owned [`Subscription`] record.
#[derive(Clone)]
pub struct SubscriptionManager {
    client: Client,
    events_url: String,
}

impl SubscriptionManager {
    /// `events_url` is the device's event service endpoint.
    pub fn new(client: Client, events_url: impl Into<String>) -> Self {
        Self {
            client,
            events_url: events_url.into(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn events_url(&self) -> &str {
        &self.events_url
    }

    /// Create a pull-point subscription.
    ///
    /// `filter` is a ConcreteSet topic expression; empty subscribes to
    /// everything. Fails without I/O if `requested_termination` is zero.
    pub fn create(
        &self,
        ctx: &CallContext,
        filter: &str,
        requested_termination: Duration,
        policy: &SubscriptionPolicy,
    ) -> Result<Subscription> {
        const OP: &str = "CreatePullPointSubscription";
        if requested_termination.is_zero() {
            return Err(Error::validation(OP, "termination time must be positive"));
        }

        let created = self.client.call(
            ctx,
            &self.events_url,
            &CreatePullPointSubscription {
                filter: filter.to_string(),
                initial_termination: requested_termination,
                policy: policy.clone(),
            },
        )?;

        tracing::info!(
            reference = %created.reference,
            termination_time = %created.termination_time,
            filter,
            "subscription created"
        );

        Ok(Subscription {
            reference: created.reference,
            filter: (!filter.is_empty()).then(|| filter.to_string()),
            created_at: created.current_time,
            current_time: created.current_time,
            termination_time: created.termination_time,
            state: SubscriptionState::Active,
        })
    }

    /// Pull up to `message_limit` messages, waiting at most `timeout` on the
    /// peer for the first one. An empty batch is a normal outcome.
    pub fn pull(
        &self,
        ctx: &CallContext,
        reference: &str,
        timeout: Duration,
        message_limit: u32,
    ) -> Result<PullBatch> {
        const OP: &str = "PullMessages";
        require_reference(OP, reference)?;
        if timeout.is_zero() {
            return Err(Error::validation(OP, "timeout must be positive"));
        }
        if message_limit == 0 {
            return Err(Error::validation(OP, "message limit must be positive"));
        }

        let long_poll;
        let ctx = if ctx.deadline().is_none() {
            let deadline = timeout
                .checked_add(PULL_GRACE)
                .and_then(|t| Instant::now().checked_add(t))
                .ok_or_else(|| Error::validation(OP, "timeout too large"))?;
            long_poll = CallContext::new()
                .deadline_at(deadline)
                .with_cancel(ctx.cancel_token().clone());
            &long_poll
        } else {
            ctx
        };

        let batch = self.client.call(
            ctx,
            reference,
            &PullMessages {
                timeout,
                message_limit,
            },
        )?;

        tracing::debug!(reference, messages = batch.messages.len(), "pulled");
        Ok(batch)
    }

    /// Extend a subscription by `extension` from the peer's current time.
    pub fn renew(&self, ctx: &CallContext, reference: &str, extension: Duration) -> Result<Renewal> {
        const OP: &str = "Renew";
        require_reference(OP, reference)?;
        if extension.is_zero() {
            return Err(Error::validation(OP, "extension must be positive"));
        }

        let renewal = self.client.call(ctx, reference, &Renew { extension })?;
        tracing::debug!(reference, termination_time = %renewal.termination_time, "renewed");
        Ok(renewal)
    }

    /// Move the delivery cursor to `utc_time`, forward or (with `reverse`) backward.
    pub fn seek(
        &self,
        ctx: &CallContext,
        reference: &str,
        utc_time: DateTime<Utc>,
        reverse: bool,
    ) -> Result<()> {
        require_reference("Seek", reference)?;
        self.client
            .call(ctx, reference, &Seek { utc_time, reverse })
    }

    /// Ask the peer to re-send the current state of every property, bounding
    /// how stale subsequently pulled data can be.
    pub fn set_synchronization_point(&self, ctx: &CallContext, reference: &str) -> Result<()> {
        require_reference("SetSynchronizationPoint", reference)?;
        self.client.call(ctx, reference, &SetSynchronizationPoint)
    }

    /// Terminate a subscription early. Later pulls on `reference` fault.
    pub fn unsubscribe(&self, ctx: &CallContext, reference: &str) -> Result<()> {
        require_reference("Unsubscribe", reference)?;
        self.client.call(ctx, reference, &Unsubscribe)?;
        tracing::info!(reference, "unsubscribed");
        Ok(())
    }

    /// [`pull`](Self::pull) on a record, refreshing its peer clock.
    pub fn pull_subscription(
        &self,
        ctx: &CallContext,
        subscription: &mut Subscription,
        timeout: Duration,
        message_limit: u32,
    ) -> Result<Vec<NotificationMessage>> {
        let batch = self.pull(ctx, &subscription.reference, timeout, message_limit)?;
        subscription.current_time = batch.current_time;
        Ok(batch.messages)
    }

    /// [`renew`](Self::renew) on a record.
    ///
    /// The record is `Renewing` while the call is in flight. On success its
    /// termination and current times are replaced; on failure (including
    /// cancellation) they are left untouched. Either way it returns to
    /// `Active` afterwards.
    pub fn renew_subscription(
        &self,
        ctx: &CallContext,
        subscription: &mut Subscription,
        extension: Duration,
    ) -> Result<Renewal> {
        subscription.state = SubscriptionState::Renewing;
        let result = self.renew(ctx, &subscription.reference, extension);
        subscription.state = SubscriptionState::Active;

        let renewal = result?;
        subscription.current_time = renewal.current_time;
        subscription.termination_time = renewal.termination_time;
        Ok(renewal)
    }

    /// [`unsubscribe`](Self::unsubscribe) on a record, marking it `Unsubscribed`.
    pub fn unsubscribe_subscription(
        &self,
        ctx: &CallContext,
        subscription: &mut Subscription,
    ) -> Result<()> {
        self.unsubscribe(ctx, &subscription.reference)?;
        subscription.state = SubscriptionState::Unsubscribed;
        Ok(())
    }
}

fn require_reference(operation: &'static str, reference: &str) -> Result<()> {
    if reference.trim().is_empty() {
        return Err(Error::validation(operation, "subscription reference is empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::client::ClientConfig;
    use crate::error::ErrorCategory;
    use crate::transport::CancelToken;
    use crate::transport::stub::{ScriptedTransport, envelope};

    const REF: &str = "http://host/subscription/1";

    fn manager(transport: &Arc<ScriptedTransport>) -> SubscriptionManager {
        let client = Client::with_transport(transport.clone(), ClientConfig::default());
        SubscriptionManager::new(client, "http://host/onvif/events")
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn created_reply(current: &str, termination: &str) -> String {
        envelope(&format!(
            "<tev:CreatePullPointSubscriptionResponse>\
             <tev:SubscriptionReference><wsa:Address>{REF}</wsa:Address></tev:SubscriptionReference>\
             <wsnt:CurrentTime>{current}</wsnt:CurrentTime>\
             <wsnt:TerminationTime>{termination}</wsnt:TerminationTime>\
             </tev:CreatePullPointSubscriptionResponse>"
        ))
    }

    fn renew_reply(current: &str, termination: &str) -> String {
        envelope(&format!(
            "<wsnt:RenewResponse><wsnt:TerminationTime>{termination}</wsnt:TerminationTime>\
             <wsnt:CurrentTime>{current}</wsnt:CurrentTime></wsnt:RenewResponse>"
        ))
    }

    fn no_subscription_fault() -> String {
        envelope(
            "<env:Fault><env:Code><env:Value>env:Sender</env:Value>\
             <env:Subcode><env:Value>ter:InvalidArgVal</env:Value></env:Subcode></env:Code>\
             <env:Reason><env:Text>unknown subscription</env:Text></env:Reason></env:Fault>",
        )
    }

    fn create(m: &SubscriptionManager) -> Subscription {
        m.create(
            &CallContext::new(),
            "",
            Duration::from_secs(3600),
            &SubscriptionPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn create_with_zero_termination_makes_no_call() {
        let transport = Arc::new(ScriptedTransport::new());
        let err = manager(&transport)
            .create(
                &CallContext::new(),
                "",
                Duration::ZERO,
                &SubscriptionPolicy::default(),
            )
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn create_then_renew_updates_record() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(200, created_reply("2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z"));
        transport.reply(200, renew_reply("2024-05-01T12:10:00Z", "2024-05-01T14:10:00Z"));

        let m = manager(&transport);
        let mut sub = create(&m);
        assert_eq!(sub.reference(), REF);
        assert_eq!(sub.filter(), None);
        assert_eq!(sub.termination_time(), at(13, 0, 0));
        assert_eq!(sub.state(), SubscriptionState::Active);
        assert_eq!(transport.request(0).url, "http://host/onvif/events");
        assert!(transport.request_body(0).contains("PT1H"));

        let renewal = m
            .renew_subscription(&CallContext::new(), &mut sub, Duration::from_secs(7200))
            .unwrap();
        assert_eq!(renewal.termination_time, at(14, 10, 0));
        assert_eq!(sub.termination_time(), at(14, 10, 0));
        assert_eq!(sub.current_time(), at(12, 10, 0));
        assert_eq!(sub.created_at(), at(12, 0, 0));
        assert_eq!(sub.reference(), REF);
        assert_eq!(sub.state(), SubscriptionState::Active);
        assert_eq!(transport.request(1).url, REF);
        assert!(transport.request_body(1).contains("PT2H"));
    }

    #[test]
    fn failed_renew_leaves_termination_untouched() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(200, created_reply("2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z"));
        transport.reply(200, no_subscription_fault());

        let m = manager(&transport);
        let mut sub = create(&m);
        let err = m
            .renew_subscription(&CallContext::new(), &mut sub, Duration::from_secs(60))
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Fault);
        assert_eq!(sub.termination_time(), at(13, 0, 0));
        assert_eq!(sub.state(), SubscriptionState::Active);
    }

    #[test]
    fn cancelled_create_records_nothing() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(200, created_reply("2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z"));
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = manager(&transport)
            .create(
                &CallContext::new().with_cancel(cancel),
                "",
                Duration::from_secs(60),
                &SubscriptionPolicy::default(),
            )
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn pull_validation_happens_before_io() {
        let transport = Arc::new(ScriptedTransport::new());
        let m = manager(&transport);
        let ctx = CallContext::new();

        for err in [
            m.pull(&ctx, "", Duration::from_secs(30), 10).unwrap_err(),
            m.pull(&ctx, "  ", Duration::from_secs(30), 10).unwrap_err(),
            m.pull(&ctx, REF, Duration::ZERO, 10).unwrap_err(),
            m.pull(&ctx, REF, Duration::from_secs(30), 0).unwrap_err(),
            m.renew(&ctx, REF, Duration::ZERO).unwrap_err(),
            m.renew(&ctx, "", Duration::from_secs(1)).unwrap_err(),
            m.seek(&ctx, "", at(12, 0, 0), false).unwrap_err(),
            m.set_synchronization_point(&ctx, "").unwrap_err(),
            m.unsubscribe(&ctx, "").unwrap_err(),
        ] {
            assert_eq!(err.category(), ErrorCategory::Validation, "{err}");
        }
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn oversized_pull_timeout_is_rejected_without_panic() {
        let transport = Arc::new(ScriptedTransport::new());
        let m = manager(&transport);

        let err = m
            .pull(&CallContext::new(), REF, Duration::MAX, 1)
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation, "{err}");
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn pull_returns_messages_and_refreshes_clock() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(200, created_reply("2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z"));
        transport.reply(
            200,
            envelope(
                "<tev:PullMessagesResponse>\
                 <tev:CurrentTime>2024-05-01T12:00:05Z</tev:CurrentTime>\
                 <tev:TerminationTime>2024-05-01T13:00:00Z</tev:TerminationTime>\
                 <wsnt:NotificationMessage><wsnt:Topic>tns1:VideoSource/MotionAlarm</wsnt:Topic>\
                 <wsnt:Message><tt:Message UtcTime=\"2024-05-01T12:00:04Z\" PropertyOperation=\"Changed\">\
                 <tt:Data><tt:SimpleItem Name=\"State\" Value=\"true\"/></tt:Data>\
                 </tt:Message></wsnt:Message></wsnt:NotificationMessage>\
                 </tev:PullMessagesResponse>",
            ),
        );

        let m = manager(&transport);
        let mut sub = create(&m);
        let messages = m
            .pull_subscription(&CallContext::new(), &mut sub, Duration::from_secs(30), 10)
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic(), "tns1:VideoSource/MotionAlarm");
        assert!(messages[0].utc_time() >= sub.created_at());
        assert_eq!(sub.current_time(), at(12, 0, 5));
        assert_eq!(sub.termination_time(), at(13, 0, 0));
    }

    #[test]
    fn unsubscribe_then_pull_faults() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(200, created_reply("2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z"));
        transport.reply(200, envelope("<wsnt:UnsubscribeResponse/>"));
        transport.reply(200, no_subscription_fault());

        let m = manager(&transport);
        let mut sub = create(&m);
        m.unsubscribe_subscription(&CallContext::new(), &mut sub)
            .unwrap();
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);

        let err = m
            .pull(&CallContext::new(), sub.reference(), Duration::from_secs(1), 1)
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Fault);
        assert!(err.fault().unwrap().is_subcode("InvalidArgVal"));
    }

    #[test]
    fn void_operations_accept_empty_body() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(200, envelope(""));
        transport.reply(200, envelope("<tev:SetSynchronizationPointResponse/>"));

        let m = manager(&transport);
        m.seek(&CallContext::new(), REF, at(11, 0, 0), true).unwrap();
        m.set_synchronization_point(&CallContext::new(), REF).unwrap();
        assert!(transport.request_body(0).contains("<tev:Reverse>true</tev:Reverse>"));
    }

    #[test]
    fn state_reports_expiry_from_clock() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(200, created_reply("2024-05-01T12:00:00Z", "2024-05-01T13:00:00Z"));
        let sub = create(&manager(&transport));

        assert_eq!(sub.state_at(at(12, 59, 59)), SubscriptionState::Active);
        assert_eq!(sub.remaining_at(at(12, 59, 0)), Duration::from_secs(60));
        assert_eq!(sub.state_at(at(13, 0, 0)), SubscriptionState::Expired);
        assert_eq!(sub.remaining_at(at(14, 0, 0)), Duration::ZERO);
    }
}
