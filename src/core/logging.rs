//! Logging initialization

/// Initialize the logging system
///
/// Uses env_logger with default filter level of `info`.
/// Override with RUST_LOG environment variable, e.g.
/// `RUST_LOG=raystream::streaming=trace` to follow every batch and commit.
///
/// Safe to call more than once; later calls are ignored.
///
/// # Example
/// ```
/// raystream::core::logging::init();
/// log::info!("Streaming started");
/// ```
pub fn init() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    )
    .format_timestamp_millis()
    .try_init();
}

/// Initialize logging for unit tests (captured by the test harness).
#[cfg(test)]
pub fn init_test() {
    let _ = env_logger::builder().is_test(true).try_init();
}
