use rstest::*;
use tracing_subscriber::EnvFilter;

/// Install a test-friendly tracing subscriber once per test binary.
#[fixture]
#[once]
pub fn enable_tracing() -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .is_ok()
}
