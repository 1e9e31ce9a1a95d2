//! Client-side session and messaging engine over a text-frame socket.
//!
//! A raw bidirectional socket only moves frames around. This crate layers a
//! request/response and publish/subscribe protocol on top of it: outbound calls
//! are correlated with their responses by sequence number, an authenticated
//! session is re-established after every reconnection, and server pushes are
//! routed to local listeners by subject.
//!
//! - [`codec`] encodes and decodes the JSON envelope exchanged with the server.
//! - [`correlation`] tracks in-flight calls waiting for a response.
//! - [`broadcast`] keeps per-subject listener lists for server pushes.
//! - [`auth`] owns the session and gates outbound traffic on it.
//! - [`engine`] is the connection state machine. It performs no I/O itself;
//!   it queues [`engine::TransportCommand`]s for whoever drives it.
//! - [`runtime`] drives the engine on a Tokio task and exposes an async
//!   [`runtime::SessionHandle`].
//! - [`transport`] defines the socket collaborator and a WebSocket
//!   implementation of it.
//! - [`presence`] builds the directory and peer-relay calls.
//! - [`endpoint`] normalizes user supplied server addresses.
//! - [`config`] and [`error`] hold options and error types.
//! - [`cli`] parses arguments for the demo binary.

pub mod auth;
pub mod broadcast;
pub mod cli;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod presence;
pub mod runtime;
pub mod transport;

pub use config::SessionOptions;
pub use engine::{ConnectionState, SessionEngine};
pub use error::{CallError, EngineError, ServerError};
pub use runtime::{SessionHandle, spawn_session, spawn_session_with};
