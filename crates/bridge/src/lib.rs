pub mod batch;
pub mod bridge;
pub mod callbacks;
pub mod config;
pub mod engine;
pub mod error;
pub mod jwt;
pub mod lifecycle;
pub mod logger;
pub mod loopback;
pub mod pending;
pub mod protocol;
pub mod sandbox;
pub mod transport;
pub mod upload;

pub use bridge::{InitOptions, PdpBridge};
pub use callbacks::CallbackHandlers;
pub use config::BridgeConfig;
pub use error::{BridgeError, WireError};
pub use lifecycle::LifecycleState;
pub use transport::Transport;
