pub mod config;
pub mod http;

pub use config::{ChainConfig, KeysConfig, NodeConfig, ServerConfig, StoreBackend, StoreConfig};
pub use http::server::{NodeServer, NodeServerState, NodeTxManager};
