//! Multi-client broadcast relay over TCP.
//!
//! Clients connect, send a display name, and then send text messages; the
//! relay stamps each one and fans it out to every connected participant,
//! the sender included. Join and leave notices travel the same way.
//!
//! - [`server`] owns the listener and spawns one task per connection.
//! - [`handler`] runs a single connection: handshake, read loop, teardown.
//! - [`registry`] is the shared set of joined clients and the only place
//!   broadcasts are serialized.
//! - [`message`] holds the client message type and the JSON line framing.
//! - [`client`] is a terminal client; [`cli`] parses both modes.

pub mod cli;
pub mod client;
pub mod error;
pub mod handler;
pub mod message;
pub mod registry;
pub mod server;

pub use error::{RelayError, SendError};
pub use message::{Announcement, Message};
pub use registry::{ClientHandle, ClientRegistry, HandlerState};
pub use server::{BroadcastServer, Listener, ServerConfig, ShutdownPolicy};
