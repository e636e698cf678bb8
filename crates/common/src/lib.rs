pub mod config;
pub mod logging;
pub mod signals;
pub mod wait;

pub use config::Environment;
pub use logging::setup_logging;
pub use signals::shutdown_flag;
pub use wait::wait_for_resource;
