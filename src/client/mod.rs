//! Connection layer

pub mod connection;
pub mod node_client;
pub mod raw_connection;

pub use connection::{Conn, ConnFactory, NodeConnection, Wire};
pub use node_client::{tcp_factory, TcpNodeClient};
pub use raw_connection::RawConnection;
