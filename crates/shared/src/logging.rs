use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter from `RUST_LOG`, else `MESH_LOG`, else `default`.
fn mesh_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("MESH_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize logging with structured JSON output
pub fn init_logging() {
    let mesh_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .json()
        .with_current_span(false);

    // A second initialisation (tests, embedding apps) keeps the first subscriber
    let installed = tracing_subscriber::registry()
        .with(mesh_filter("info,ble_mesh=info"))
        .with(mesh_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Mesh logging initialized");
    }
}

/// Initialize logging with pretty output for development
pub fn init_logging_pretty() {
    let mesh_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .pretty();

    let installed = tracing_subscriber::registry()
        .with(mesh_filter("info,ble_mesh=debug"))
        .with(mesh_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Mesh logging initialized (pretty mode)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_init_twice_does_not_panic() {
        init_logging_pretty();
        init_logging();
    }
}
