//! # questline-core
//!
//! Shared vocabulary for the Questline sync crates.
//!
//! - **IDs**: [`ConnectionId`] and [`UserId`] newtypes
//! - **Groups**: [`GroupStatus`], well-known channel names, and the
//!   file-to-channel naming policy ([`channel_for_file`])
//! - **Transport**: the [`Transport`] capability the sync core is written
//!   against, plus its events and send options
//! - **Credentials**: [`AccessToken`] and the [`CredentialSource`] trait
//! - **Messages**: wire-level [`ContentMessage`] and the typed
//!   [`ContentUpdate`] delivered to consumers
//! - **Errors**: [`CredentialError`] and [`TransportError`]

#![deny(unsafe_code)]

pub mod credentials;
pub mod errors;
pub mod groups;
pub mod ids;
pub mod messages;
pub mod transport;

pub use credentials::{AccessToken, CredentialSource};
pub use errors::{CredentialError, TransportError};
pub use groups::{GroupStatus, channel_for_file};
pub use ids::{ConnectionId, UserId};
pub use messages::{ContentMessage, ContentUpdate, EventEntry, Profile, Summary};
pub use transport::{DataType, SendOptions, Transport, TransportEvent};
