//! Reference event source.
//!
//! A blocking HTTP/1.1 server that answers the pull-point operations the
//! client side speaks, backed by an in-memory subscription registry.
//! Applications feed it with [`EventServer::publish`].
//!
//! ```text
//! POST /onvif/events        CreatePullPointSubscription
//! POST /subscription/{id}   PullMessages | Renew | Unsubscribe | Seek | SetSynchronizationPoint
//! ```
//!
//! One thread accepts connections and sweeps expired subscriptions; each
//! connection gets its own thread.
//! A `PullMessages` with no queued messages parks its connection thread on
//! the subscription's condition variable until a message is published or
//! the requested timeout elapses.

pub mod auth;
pub mod connection;
pub mod http;
pub mod registry;
pub mod service;

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::{Error, Result};
use crate::events::NotificationMessage;
use crate::security::Credentials;
use crate::soap::Namespaces;

pub use registry::{PullPoint, SubscriptionRegistry, TopicFilter};
pub use service::EventService;

/// Path of the event service endpoint.
pub const EVENTS_PATH: &str = "/onvif/events";

/// Sleep between accept attempts while no client is connecting.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// How often the listener thread drops expired subscriptions.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host (and port) advertised in subscription references.
    /// When `None`, the request's `Host` header is used.
    pub public_host: Option<String>,
    /// When set, every request must carry a valid UsernameToken for this account.
    pub credentials: Option<Credentials>,
    /// Accepted distance between a token's `Created` time and the server clock.
    pub max_clock_skew: Duration,
    /// Lifetime of a subscription created without `InitialTerminationTime`.
    pub default_termination: Duration,
    /// Upper bound on any requested termination.
    pub max_termination: Duration,
    /// Upper bound on how long one `PullMessages` may block.
    pub max_pull_timeout: Duration,
    /// Messages held per subscription before the oldest are dropped.
    pub queue_capacity: usize,
    /// Published messages retained for `Seek`.
    pub history_capacity: usize,
    pub namespaces: Namespaces,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            credentials: None,
            max_clock_skew: Duration::from_secs(300),
            default_termination: Duration::from_secs(60),
            max_termination: Duration::from_secs(24 * 3600),
            max_pull_timeout: Duration::from_secs(60),
            queue_capacity: 1000,
            history_capacity: 1000,
            namespaces: Namespaces::default(),
        }
    }
}

/// Event server: owns the listener thread and the subscription registry.
pub struct EventServer {
    registry: SubscriptionRegistry,
    running: Arc<AtomicBool>,
    bind_addr: String,
    local_addr: Option<SocketAddr>,
    config: Arc<ServerConfig>,
}

impl EventServer {
    pub fn new(bind_addr: &str) -> Self {
        Self::with_config(bind_addr, ServerConfig::default())
    }

    pub fn with_config(bind_addr: &str, config: ServerConfig) -> Self {
        Self {
            registry: SubscriptionRegistry::new(config.queue_capacity, config.history_capacity),
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
            local_addr: None,
            config: Arc::new(config),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let service = Arc::new(EventService::new(self.registry.clone(), self.config.clone()));

        tracing::info!(addr = %local_addr, auth = self.config.credentials.is_some(), "event server listening");

        let registry = self.registry.clone();
        let spawned = thread::Builder::new()
            .name("onvif-accept".to_string())
            .spawn(move || serve(listener, service, registry, running));
        if let Err(e) = spawned {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(Error::NotStarted)
    }

    /// URL of the event service endpoint, for clients.
    pub fn events_url(&self) -> Result<String> {
        let host = match &self.config.public_host {
            Some(host) => host.clone(),
            None => self.local_addr()?.to_string(),
        };
        Ok(format!("http://{host}{EVENTS_PATH}"))
    }

    /// Deliver a message to every matching subscription. Returns the number
    /// of subscriptions that received it.
    pub fn publish(&self, message: NotificationMessage) -> usize {
        self.registry.publish(message, Utc::now())
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

/// Accept connections until `running` clears, sweeping expired
/// subscriptions every [`SWEEP_INTERVAL`].
fn serve(
    listener: TcpListener,
    service: Arc<EventService>,
    registry: SubscriptionRegistry,
    running: Arc<AtomicBool>,
) {
    let mut last_sweep = Instant::now();
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => connection::spawn(stream, service.clone(), running.clone()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
        if last_sweep.elapsed() >= SWEEP_INTERVAL {
            registry.purge_expired(Utc::now());
            last_sweep = Instant::now();
        }
    }
    tracing::debug!("listener closed");
}

impl Drop for EventServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
