//! Pull-point event subscriptions.
//!
//! A client creates a subscription on the device's event service and gets
//! back a reference URL. Every later call (pull, renew, seek, sync point,
//! unsubscribe) goes to that reference:
//!
//! ```text
//!                 CreatePullPointSubscription
//!   events_url  ────────────────────────────────▶  reference
//!                                                      │
//!         PullMessages / Renew / Seek / SetSynchronizationPoint / Unsubscribe
//! ```
//!
//! Subscriptions expire at their termination time unless renewed.

pub mod message;
pub mod operations;
pub mod subscription;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

pub use message::{ItemSet, NotificationMessage, PropertyOperation};
pub use operations::{CreatedSubscription, PullBatch, Renewal, SubscriptionPolicy};
pub use subscription::{Subscription, SubscriptionManager, SubscriptionState};

/// Parse an `xs:dateTime`. Values without a zone designator are taken as UTC.
pub fn parse_utc(text: &str) -> Result<DateTime<Utc>, String> {
    let text = text.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|t| t.and_utc())
        .map_err(|e| format!("invalid dateTime {text:?}: {e}"))
}

/// Format as `xs:dateTime` in UTC with whole seconds (`2024-05-01T12:00:00Z`).
pub fn format_utc(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}
