use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::auth::Authenticator;
use super::http::{Request, Response};
use super::registry::{PullPoint, SubscriptionRegistry, TopicFilter};
use super::ServerConfig;
use crate::duration;
use crate::events::{format_utc, parse_utc};
use crate::soap::{Element, Envelope, Fault};

/// Path prefix of subscription references: `http://{host}/subscription/{id}`.
pub const SUBSCRIPTION_PATH: &str = "/subscription/";

const SENDER: &str = "env:Sender";

/// Answers SOAP requests for the event service and its pull points.
///
/// Stateless apart from the shared registry and nonce cache, so one
/// instance is shared by every connection thread.
pub struct EventService {
    registry: SubscriptionRegistry,
    config: Arc<ServerConfig>,
    auth: Option<Authenticator>,
}

/// A fault together with the HTTP status it is sent with.
struct Failure {
    status: u16,
    fault: Fault,
}

impl Failure {
    fn sender(subcode: &str, reason: impl Into<String>) -> Self {
        Failure {
            status: 400,
            fault: Fault::new(SENDER, reason).with_subcode(subcode),
        }
    }

    fn invalid_arg(reason: impl Into<String>) -> Self {
        Self::sender("ter:InvalidArgVal", reason)
    }

    fn unknown_subscription(id: &str) -> Self {
        Self::invalid_arg(format!("no such subscription: {id}"))
    }
}

type Outcome = Result<Element, Failure>;

impl EventService {
    pub fn new(registry: SubscriptionRegistry, config: Arc<ServerConfig>) -> Self {
        let auth = config
            .credentials
            .clone()
            .filter(|c| !c.is_anonymous())
            .map(|c| Authenticator::new(c, config.max_clock_skew));
        EventService {
            registry,
            config,
            auth,
        }
    }

    pub fn handle(&self, request: &Request, local_addr: SocketAddr) -> Response {
        if request.method != "POST" {
            tracing::warn!(method = %request.method, path = %request.path, "non-POST request");
            return Response::new(405).add_header("Allow", "POST");
        }

        let now = Utc::now();
        let envelope = match Envelope::parse(&request.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(path = %request.path, error = %e, "unparseable envelope");
                return self.fault_response(Failure::sender("ter:WellFormed", e.to_string()));
            }
        };

        if let Some(auth) = &self.auth {
            if let Err(reason) = auth.verify(&envelope, now) {
                tracing::warn!(path = %request.path, %reason, "authentication failed");
                return self.fault_response(Failure::sender(
                    "ter:NotAuthorized",
                    "sender not authorized",
                ));
            }
        }

        let Some(body) = envelope.body.as_ref() else {
            return self.fault_response(Failure::sender("ter:InvalidArgs", "empty Body"));
        };

        let operation = body.local_name();
        tracing::debug!(path = %request.path, operation, "dispatch");

        let outcome = match operation {
            "CreatePullPointSubscription" => {
                let host = self.advertised_host(request, local_addr);
                self.create(body, &host, now)
            }
            "PullMessages" => self.with_pull_point(request, now, |p| self.pull(p, body)),
            "Renew" => self.with_pull_point(request, now, |p| self.renew(p, body, now)),
            "Unsubscribe" => self.with_pull_point(request, now, |p| self.unsubscribe(p)),
            "Seek" => self.with_pull_point(request, now, |p| self.seek(p, body)),
            "SetSynchronizationPoint" => {
                self.with_pull_point(request, now, |p| self.synchronize(p))
            }
            other => Err(Failure::sender(
                "ter:ActionNotSupported",
                format!("operation {other} is not supported"),
            )),
        };

        match outcome {
            Ok(element) => {
                Response::soap(200, Envelope::new(element).encode(&self.config.namespaces))
            }
            Err(failure) => {
                tracing::debug!(operation, fault = %failure.fault, "fault");
                self.fault_response(failure)
            }
        }
    }

    fn fault_response(&self, failure: Failure) -> Response {
        Response::soap(
            failure.status,
            Envelope::for_fault(&failure.fault).encode(&self.config.namespaces),
        )
    }

    /// Host (and port) written into subscription references.
    fn advertised_host(&self, request: &Request, local_addr: SocketAddr) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }
        request
            .header("Host")
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| local_addr.to_string())
    }

    fn with_pull_point(
        &self,
        request: &Request,
        now: DateTime<Utc>,
        op: impl FnOnce(&PullPoint) -> Outcome,
    ) -> Outcome {
        let id = request
            .path
            .strip_prefix(SUBSCRIPTION_PATH)
            .ok_or_else(|| Failure::invalid_arg(format!("{} is not a subscription", request.path)))?;
        let pull_point = id
            .parse::<u64>()
            .ok()
            .and_then(|n| self.registry.get(n, now))
            .ok_or_else(|| Failure::unknown_subscription(id))?;
        op(&pull_point)
    }

    fn create(&self, body: &Element, host: &str, now: DateTime<Utc>) -> Outcome {
        let filter = body
            .path(&["Filter", "TopicExpression"])
            .map(|e| TopicFilter::parse(e.text()))
            .unwrap_or_default();

        let requested = body.child_text("InitialTerminationTime");
        let termination = match requested {
            Some(token) => self.termination_from(token, now)?,
            None => now + to_chrono(self.config.default_termination),
        };

        let changed_only = body
            .path(&["SubscriptionPolicy", "ChangedOnly"])
            .is_some_and(|e| parse_bool(e.text()));

        let pull_point = self.registry.create(filter, changed_only, termination);
        let reference = format!("http://{host}{SUBSCRIPTION_PATH}{}", pull_point.id());
        tracing::info!(%reference, %termination, "subscription created");

        Ok(Element::new("tev:CreatePullPointSubscriptionResponse")
            .with_child(
                Element::new("tev:SubscriptionReference")
                    .with_child(Element::new("wsa:Address").with_text(reference)),
            )
            .with_child(Element::new("wsnt:CurrentTime").with_text(format_utc(now)))
            .with_child(Element::new("wsnt:TerminationTime").with_text(format_utc(termination))))
    }

    fn pull(&self, pull_point: &PullPoint, body: &Element) -> Outcome {
        let timeout = body
            .child_text("Timeout")
            .ok_or_else(|| Failure::invalid_arg("PullMessages has no Timeout"))
            .and_then(|t| duration::parse(t).map_err(|e| Failure::invalid_arg(e.to_string())))?
            .min(self.config.max_pull_timeout);

        let limit = body
            .child_text("MessageLimit")
            .and_then(|l| l.parse::<usize>().ok())
            .filter(|&l| l > 0)
            .ok_or_else(|| Failure::invalid_arg("MessageLimit must be a positive integer"))?;

        let messages = pull_point
            .wait_messages(timeout, limit)
            .ok_or_else(|| Failure::unknown_subscription(&pull_point.id().to_string()))?;

        tracing::debug!(subscription = pull_point.id(), messages = messages.len(), "pull");

        let mut response = Element::new("tev:PullMessagesResponse")
            .with_child(Element::new("tev:CurrentTime").with_text(format_utc(Utc::now())))
            .with_child(
                Element::new("tev:TerminationTime")
                    .with_text(format_utc(pull_point.termination_time())),
            );
        for message in &messages {
            response.push(message.to_element());
        }
        Ok(response)
    }

    fn renew(&self, pull_point: &PullPoint, body: &Element, now: DateTime<Utc>) -> Outcome {
        let token = body
            .child_text("TerminationTime")
            .ok_or_else(|| Failure::invalid_arg("Renew has no TerminationTime"))?;
        let termination = self.termination_from(token, now)?;
        pull_point.set_termination_time(termination);

        Ok(Element::new("wsnt:RenewResponse")
            .with_child(Element::new("wsnt:TerminationTime").with_text(format_utc(termination)))
            .with_child(Element::new("wsnt:CurrentTime").with_text(format_utc(now))))
    }

    fn unsubscribe(&self, pull_point: &PullPoint) -> Outcome {
        self.registry.remove(pull_point.id());
        tracing::info!(subscription = pull_point.id(), "unsubscribed");
        Ok(Element::new("wsnt:UnsubscribeResponse"))
    }

    fn seek(&self, pull_point: &PullPoint, body: &Element) -> Outcome {
        let utc_time = body
            .child_text("UtcTime")
            .ok_or_else(|| Failure::invalid_arg("Seek has no UtcTime"))
            .and_then(|t| parse_utc(t).map_err(Failure::invalid_arg))?;
        let reverse = body.child_text("Reverse").is_some_and(parse_bool);
        self.registry.seek(pull_point, utc_time, reverse);
        Ok(Element::new("tev:SeekResponse"))
    }

    fn synchronize(&self, pull_point: &PullPoint) -> Outcome {
        self.registry.synchronize(pull_point);
        Ok(Element::new("tev:SetSynchronizationPointResponse"))
    }

    /// Resolve a requested termination: a duration relative to `now` or an
    /// absolute `xs:dateTime`. Clamped to the configured maximum.
    fn termination_from(&self, token: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, Failure> {
        let max = to_chrono(self.config.max_termination);
        let termination = if token.trim_start().starts_with('P') {
            let extension =
                duration::parse(token).map_err(|e| Failure::invalid_arg(e.to_string()))?;
            now.checked_add_signed(to_chrono(extension).min(max))
                .ok_or_else(|| Failure::invalid_arg(format!("termination out of range: {token}")))?
        } else {
            parse_utc(token).map_err(Failure::invalid_arg)?
        };

        if termination <= now {
            return Err(Failure::sender(
                "wsnt:UnacceptableTerminationTimeFault",
                "termination time must lie in the future",
            ));
        }
        Ok(match now.checked_add_signed(max) {
            Some(limit) => termination.min(limit),
            None => termination,
        })
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn parse_bool(text: &str) -> bool {
    matches!(text.trim(), "true" | "1")
}
