//! Client side of the validation pipeline: keeps the session's streaming
//! channel open, races the start request against streamed completion and
//! publishes a progress view.

pub mod api;
pub mod config;
pub mod connection;
pub mod logging;
pub mod monitor;
pub mod render;

pub use api::{ApiError, HttpPipelineApi, PipelineApi};
pub use config::{ConfigError, MonitorConfig, ReconnectPolicy};
pub use connection::{ChannelError, ConnectionManager, Connector, InboundFrame, WsConnector};
pub use monitor::{MonitorError, MonitorHandle};
