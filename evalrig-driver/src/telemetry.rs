//! Tracing subscriber initialization: a plain fmt-only path, no exporter.
//! Structured result records carry the information this harness needs;
//! a tracing exporter is out of scope, not the ambient `tracing`
//! instrumentation itself.

/// Install a global `tracing` subscriber reading `RUST_LOG`, falling back to
/// `info` when unset. Call once, at process start.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
