pub mod db;
pub mod routes;

/// Where the server listens and keeps its table.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub db_path: String,
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "server-reports.db".into(),
            addr: "0.0.0.0:3001".into(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("SATHI_SERVER_DB").unwrap_or(defaults.db_path),
            addr: std::env::var("SATHI_SERVER_ADDR").unwrap_or(defaults.addr),
        }
    }
}

/// Binds `listener` and serves the reports API until the task is dropped.
pub async fn serve(listener: tokio::net::TcpListener, table: db::ReportTable) -> std::io::Result<()> {
    axum::serve(listener, routes::reports_router(table)).await
}
