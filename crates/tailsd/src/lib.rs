pub mod api;
pub mod config;
pub mod console;
pub mod daemon;
pub mod device;
pub mod diagnostics;
pub mod discovery;
pub mod events;
pub mod fleet;
pub mod registry;
pub mod router;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use console::Console;
pub use daemon::Context;
pub use daemon::Daemon;
pub use daemon::ScanOutcome;
pub use device::Device;
pub use device::DeviceStatus;
pub use diagnostics::format_config_error;
pub use diagnostics::format_config_error_with;
pub use registry::Registry;
