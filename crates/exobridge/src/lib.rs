pub mod bridge;
pub mod builder;
pub mod cache;
pub mod callback;
pub mod config;
pub mod context;
pub mod duplex;
pub mod error;
pub mod frame;
pub mod options;
pub mod peer;
pub mod pool;
pub mod registry;
pub mod router;
pub mod session;
pub mod stream;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use bridge::Bridge;
pub use bridge::Call;
pub use builder::BridgeBuilder;
pub use callback::Invocation;
pub use config::BridgeConfig;
pub use config::WorkerConfig;
pub use context::CallerContext;
pub use context::SessionScope;
pub use duplex::DuplexChannelTransport;
pub use error::Error;
pub use error::Result;
pub use options::CallOptions;
pub use pool::WorkerId;
pub use router::Affinity;
pub use session::SessionOptions;
pub use stream::RefStream;
pub use stream::StreamItem;
pub use transport::Transport;
pub use worker::CallScope;
pub use worker::Interpreter;
pub use worker::Kwargs;
pub use worker::WorkerHandle;
pub use worker::WorkerServer;

pub use tagpack;

#[cfg(test)]
mod tests;
