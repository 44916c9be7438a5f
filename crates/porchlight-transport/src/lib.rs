//! # porchlight-transport
//!
//! Transport abstraction layer for the Porchlight notification broker.
//!
//! The server accepts connections through the `Transport` trait and talks to
//! each client through the `Connection` trait, so session handling does not
//! depend on the byte stream underneath.
//!
//! - **TCP** - MQTT 3.1.1 over plain TCP, what the button firmware speaks
//!
//! ## Transport Abstraction
//!
//! ```rust,ignore
//! use porchlight_transport::{Connection, Transport};
//!
//! async fn handle_connection(mut conn: Box<dyn Connection>) {
//!     let client = conn.handshake().await?;
//!     while let Ok(Some(packet)) = conn.recv().await {
//!         // Process packet
//!     }
//! }
//! ```

pub mod auth;
pub mod tcp;
pub mod traits;

pub use auth::{Authenticator, StaticCredentials};
pub use tcp::{ConnectionConfig, MqttConnection, TcpConfig, TcpTransport};
pub use traits::{ClientInfo, Connection, ConnectionId, Transport, TransportError};
