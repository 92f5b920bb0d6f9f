pub mod config;
pub mod discovery;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod queue;
pub mod routing;
pub mod state;
pub mod telemetry;
pub mod types;

pub use error::{RouterError, RouterResult};
