//! NNTP client (RFC 3977, RFC 4643) and connection pooling.

pub mod connection;
pub mod error;
pub mod pool;
pub mod response;

#[cfg(test)]
pub(crate) mod testserver;

pub use connection::{format_message_id, Article, BodyReader, Connection, ConnectionConfig};
pub use error::{ErrorKind, NntpError};
pub use pool::{ConnectionPool, PoolConfig, PoolState, PoolStats, PooledConnection};
pub use response::*;
