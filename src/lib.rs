pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod providers;
pub mod routing;
pub mod server;
pub mod translate;
pub mod usage;

pub use client::{HttpProviderClient, ProviderClient};
pub use config::GatewayConfig;
pub use dispatch::{DispatchOutcome, Dispatcher, InboundCall};
pub use error::{GatewayError, Result};
pub use server::{build_router, AppState};
pub use usage::SharedUsageLog;
