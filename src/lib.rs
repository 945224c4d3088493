//! # ssntp
//!
//! The Simple and Secure Node Transfer Protocol: a mutually-authenticated,
//! role-scoped binary framing protocol coordinating a small compute
//! cluster (controllers, schedulers, compute-node agents, networking
//! agents, concentrator instances).
//!
//! ## Architecture
//!
//! - **Frame codec** ([`protocol`]): typed frames (COMMAND, STATUS, ERROR,
//!   EVENT) over a reliable, encrypted transport.
//! - **Identity store** ([`identity`]): a stable UUID per (prefix, role),
//!   guarded by a non-blocking advisory file lock so concurrent instances
//!   of a role coexist with distinct identities.
//! - **TLS binding**: mutual TLS over TCP or a Unix socket; peer roles
//!   are proved by certificate extended-key-usage OIDs.
//! - **Connection state machine** ([`Client`], [`Server`]): the
//!   CONNECT/CONNECTED handshake and the per-connection frame loop.
//! - **Forwarding engine** ([`forward`]): a hub relays frames between
//!   otherwise-unconnected peers by frame kind and role, bit-exact.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ssntp::{Client, Config, NullHandler, Role};
//!
//! #[tokio::main]
//! async fn main() -> ssntp::Result<()> {
//!     let config = Config {
//!         uri: String::from("scheduler.example"),
//!         role: Role::CONTROLLER,
//!         ..Config::default()
//!     };
//!     let client = Client::dial(config, Arc::new(NullHandler)).await?;
//!     client.send_command(ssntp::Command::Stats, b"stats: {}").await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod forward;
pub mod handler;
pub mod identity;
pub mod protocol;
pub mod role;
pub mod trace;

mod client;
mod server;
mod tls;
mod transport;
mod writer;

pub use client::Client;
pub use config::{Config, TransportKind};
pub use connection::ConnectionStatus;
pub use error::{Result, SsntpError};
pub use forward::{ForwardAction, ForwardRule, ForwardTable, FrameFilter, OverflowPolicy};
pub use handler::{DisconnectReason, EventHandler, NullHandler};
pub use identity::{IdentityStore, LockedUuid};
pub use protocol::{
    Command, ErrorKind, Event, Frame, FrameKind, FrameType, Status, DEFAULT_PORT,
};
pub use role::Role;
pub use server::Server;
pub use trace::{FrameTrace, TraceConfig};
