pub use app_error::{AppError, AppResult};
pub use config::{ConnectionConfig, LogConfig, PacketwireConfig, ServerConfig};
pub use server::{ConnectedEvent, Server};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod server;
mod shutdown;
mod tracing_config;
