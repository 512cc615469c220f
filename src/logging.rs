//! Logger initialization.

/// Initializes the process logger from `RUST_LOG` via `env_logger`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logger() {
    let _ = env_logger::Builder::from_default_env().try_init();
}
