use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Register SIGINT/SIGTERM handlers that raise a process-wide quit flag.
///
/// Blocking endpoint loops should sample the flag between samples; the
/// producer side reacts by dropping its sink, which drives the END
/// transition through every attached consumer.
pub fn shutdown_flag() -> io::Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));

    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;

    tracing::info!("Signal handlers registered (SIGTERM, SIGINT)");

    Ok(shutdown)
}
