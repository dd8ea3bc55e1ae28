//! ONVIF-style SOAP RPC engine with WS-Security authentication and
//! pull-point event subscriptions.
//!
//! - [`client::Client`] performs one authenticated SOAP call per operation.
//! - [`events::SubscriptionManager`] drives the pull-point lifecycle.
//! - [`server::EventServer`] is an in-process event source speaking the
//!   same protocol, used for testing and demos.

pub mod client;
pub mod duration;
pub mod error;
pub mod events;
pub mod security;
pub mod server;
pub mod soap;
pub mod transport;

pub use client::{Client, ClientConfig, Operation};
pub use error::{Error, ErrorCategory, Result};
pub use events::{NotificationMessage, Subscription, SubscriptionManager, SubscriptionState};
pub use security::Credentials;
pub use server::{EventServer, ServerConfig};
pub use transport::{CallContext, CancelToken};
