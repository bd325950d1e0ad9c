use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber writing to the test output, `TEST_LOG` overrides
/// the filter. Safe to call from every test.
pub fn trace_init() {
    let level = std::env::var("TEST_LOG").unwrap_or_else(|_| "servergroup=debug".to_string());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_test_writer()
        .try_init();
}
