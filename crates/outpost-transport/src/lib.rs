//! Connection management for agent links
//!
//! A [`Connection`] owns one physical byte stream and runs the framed send and
//! receive loops over it. Tunnels multiplex extra byte streams over the same
//! link, and [`dial`] opens links from transport addresses.

pub mod connection;
pub mod dial;
pub mod tls;
pub mod tunnel;

pub use connection::{CloseReason, Connection, ConnectionConfig, ConnectionError};
pub use dial::{dial, DialError, TransportAddress};
pub use tls::TlsError;
pub use tunnel::{Tunnel, TunnelError, TunnelTable};
