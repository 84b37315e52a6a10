//! Broker side of a single client connection
//!
//! [`Endpoint::spawn`](facade::Endpoint::spawn) starts a
//! [`ClientHandler`](handler::ClientHandler) task for a byte stream and
//! returns the handle plus the event stream. [`router::serve`] wires both
//! to a [`Router`](router::Router) implementation.

pub mod config;
pub mod events;
pub mod facade;
pub mod handler;
pub mod router;
pub mod state;

pub use config::EndpointConfig;
pub use events::{CloseReason, EndpointEvent, EndpointEvents};
pub use facade::{Delivery, Endpoint};
pub use handler::ClientHandler;
pub use router::{serve, AcceptAllRouter, AuthDecision, Router};
pub use state::ConnectionState;
