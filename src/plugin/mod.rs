//! Decoder plugin subsystem: lifecycle of subprocess decoders and the
//! length-prefixed RPC channel used to talk to them.

pub mod invoker;
pub mod manager;
pub mod rpc;
pub mod types;

pub use invoker::{DecodeRequest, InvokerError, PluginInvoker, RetryConfig};
pub use manager::{ManagerConfig, PluginError, PluginManager};
pub use rpc::{HandshakeConfig, RpcError};
pub use types::{DecodeResult, PluginRecord, PluginRecordSeed, PluginRecordSource, PluginStatus};
