use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = tabflow_lib::run().await {
        tracing::error!("engine exited with error: {e}");
        std::process::exit(1);
    }
}
