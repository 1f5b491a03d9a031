//! # questline-client
//!
//! The real-time sync core.
//!
//! - [`ConnectionClient`]: owns the single transport session, fetches a fresh
//!   credential for every attempt, reconnects on drops, and refreshes the
//!   token on a timer
//! - [`GroupConnectionManager`]: per-channel join state machines with
//!   exponential backoff, gated on the base connection
//! - [`ContentService`]: maps a selected content file to its channel and
//!   delivers typed [`ContentUpdate`](questline_core::ContentUpdate)s
//! - [`WebPubSubTransport`]: the concrete transport
//! - [`SyncContext`]: explicitly constructed owner of all of the above

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod content;
pub mod context;
pub mod credential;
pub mod errors;
pub mod groups;
pub mod mock;
pub mod webpubsub;

pub use config::{ClientConfig, ConnectionConfig, GroupConfig};
pub use connection::{ConnectionClient, ConnectionState};
pub use content::ContentService;
pub use context::SyncContext;
pub use credential::HttpCredentialSource;
pub use errors::{ConnectCause, ConnectionError, ContentError, GroupError};
pub use groups::{GroupConnectionManager, GroupSnapshot, GroupStatusChange, backoff_delay};
pub use webpubsub::WebPubSubTransport;
