//! Delivery of queued samples to graphite.
//!
//! A `Flusher` owns a `ConnectionManager` and is the only thing that ever
//! touches the stream. Both live on one background thread.

pub mod connection;
pub mod flusher;

#[cfg(test)]
mod fake;

pub use self::connection::{Acquire, ConnectionManager, ConnectionState, Connector, TcpConnector,
                           Transition};
pub use self::flusher::{FlushStats, Flusher, FlusherHandle};
