use autometrics::prometheus_exporter::{self, PrometheusResponse};
use tracing_subscriber::EnvFilter;

/// Serves the autometrics counters for range fetches and batch commits on
/// `127.0.0.1:{port}/metrics` until the process exits.
pub async fn run_metrics_server(port: u16) {
    prometheus_exporter::init();

    async fn metrics() -> PrometheusResponse {
        prometheus_exporter::encode_http_response()
    }

    let app = axum::Router::new().route("/metrics", axum::routing::get(metrics));
    let listener = match tokio::net::TcpListener::bind(format!("127.0.0.1:{port}")).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(port, error = %e, "failed to bind metrics port, metrics disabled");
            return;
        }
    };
    tracing::info!(port, "serving metrics");
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "metrics server stopped");
    }
}

pub fn setup_tracing() {
    // RUST_LOG selects levels; info and above when unset
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("tracing already initialized: {e}");
        return;
    }
    tracing::info!("Tracing initialized");
}
