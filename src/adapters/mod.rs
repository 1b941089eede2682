//! Adapters for storage backends and agent transports

pub mod channel_transport;
pub mod file_store;
pub mod http_transport;
pub mod memory_store;
pub mod postgres;

pub use channel_transport::ChannelTransport;
pub use file_store::FileStore;
pub use http_transport::{HttpTransport, TransportConfig};
pub use memory_store::MemoryStore;
pub use postgres::PostgresStore;
