use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Installs a global `tracing` subscriber that writes to stderr.
///
/// The filter is read from `RUST_LOG` and defaults to `info`. Stdout is left alone because the
/// CPI answers its caller there. Calling this more than once is a no-op.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
