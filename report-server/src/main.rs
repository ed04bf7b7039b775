use report_server::{db::ReportTable, ServerConfig};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "report_server=info";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = ServerConfig::from_env();
    let table = match ReportTable::open(&config.db_path) {
        Ok(table) => table,
        Err(err) => {
            tracing::error!(%err, path = %config.db_path, "failed to open reports table");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&config.addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, addr = %config.addr, "failed to bind");
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %config.addr, "report-server listening");
    if let Err(err) = report_server::serve(listener, table).await {
        tracing::error!(%err, "server stopped");
    }
}
