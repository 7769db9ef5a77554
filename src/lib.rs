//! NAT hole-punching peer-to-peer transport core.
//!
//! A [`Server`](server::Server) owns a shared-port TCP listener, UDP socket,
//! and TCP hole puncher, and dispatches everything through a single
//! [`Server::tick`](server::Server::tick) call that the embedder drives from
//! its own loop. See [`server`] for the entry point.

pub mod endpoint;
pub mod stun;
pub mod sockopt;
pub mod udp;
pub mod listener;
pub mod holepuncher;
pub mod connection;
pub mod registry;
pub mod server;

pub use connection::Connection;
pub use endpoint::{Endpoint, Family};
pub use server::{Server, ServerConfig};

/// Error type for the handful of constructor-time fallible operations
/// (binding the shared port). Routine failures (resolution, STUN, a single
/// failed send) are represented as sentinel return values per the
/// error-handling design, not as `Result`.
pub type Error = std::io::Error;
pub type Result<T> = std::result::Result<T, Error>;
