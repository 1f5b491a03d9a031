//! Server side of Questline.
//!
//! - [`negotiate`]: parses the Web PubSub connection string and mints client
//!   access URLs.
//! - [`server`]: the HTTP surface (`/api/negotiate`, `/health`).
//! - [`store`]: where content files come from.
//! - [`responder`]: answers `content_request` messages on content channels.

#![deny(unsafe_code)]

pub mod error;
pub mod negotiate;
pub mod responder;
pub mod server;
pub mod store;

pub use error::{NegotiateError, ServerError, StoreError};
pub use negotiate::{ConnectionString, Negotiator, NegotiatorCredentialSource};
pub use responder::{ContentResponder, ResponderConfig, ResponderHandle, start_responder};
pub use server::{AppState, ServerConfig, ServerHandle, build_router, start};
pub use store::{ContentStore, DirectoryContentStore, render_index};
