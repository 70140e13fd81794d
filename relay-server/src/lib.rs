pub mod connection;
pub mod gateway;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod router;
pub mod server;
pub mod subsystems;

pub use gateway::Gateway;
