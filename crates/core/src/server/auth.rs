//! UsernameToken verification for incoming requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::security::{Credentials, UsernameToken};
use crate::soap::Envelope;

/// Checks the `wsse:Security` header of each request against one account.
///
/// A token is accepted only if its digest matches, its `Created` time lies
/// within `max_skew` of the server clock, and its nonce has not been seen
/// inside that window. Nonces are remembered for twice the skew so a
/// replay is caught for as long as the original could still be fresh.
#[derive(Clone)]
pub struct Authenticator {
    credentials: Credentials,
    max_skew: chrono::Duration,
    seen: Arc<Mutex<HashMap<Vec<u8>, DateTime<Utc>>>>,
}

impl Authenticator {
    pub fn new(credentials: Credentials, max_skew: Duration) -> Self {
        Authenticator {
            credentials,
            max_skew: chrono::Duration::from_std(max_skew).unwrap_or_else(|_| chrono::Duration::days(1)),
            seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `Ok` if the envelope carries a valid, fresh, unused token.
    /// The error text is for logs only; clients get a generic fault.
    pub fn verify(&self, envelope: &Envelope, now: DateTime<Utc>) -> Result<(), String> {
        let security = envelope
            .header_block("Security")
            .ok_or("no Security header")?;
        let token = UsernameToken::from_security_header(security)?;

        if token.username() != self.credentials.username {
            return Err(format!("unknown user {:?}", token.username()));
        }

        let created = token
            .created_at()
            .ok_or_else(|| format!("unparseable Created {:?}", token.created()))?;
        if (now - created).abs() > self.max_skew {
            return Err(format!("Created {created} outside clock skew window"));
        }

        if !token.verify(self.credentials.password()) {
            return Err("digest mismatch".to_string());
        }

        let mut seen = self.seen.lock();
        let horizon = self.max_skew * 2;
        seen.retain(|_, at| now - *at <= horizon);
        if seen.contains_key(token.nonce()) {
            return Err("nonce replayed".to_string());
        }
        seen.insert(token.nonce().to_vec(), now);
        Ok(())
    }
}
