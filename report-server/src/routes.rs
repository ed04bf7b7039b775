use crate::db::{InsertOutcome, ReportTable};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use report_registry::{report_v1_schema, validate_report_v1, ReportV1, StoredReportV1};
use tower_http::cors::CorsLayer;

pub const HEALTH_MESSAGE: &str = "Samudra Sathi API is running!";

/// Any origin may call the API; the web build of the app runs on its own origin.
pub fn reports_router(table: ReportTable) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/reports", get(list_reports).post(create_report))
        .route("/api/reports/schema", get(report_schema))
        .layer(CorsLayer::permissive())
        .with_state(table)
}

/// Decodes and validates a `report.v1` body. Shape errors map to 400,
/// content errors to 422.
pub fn parse_report(payload: serde_json::Value) -> Result<ReportV1, (StatusCode, String)> {
    let report: ReportV1 = serde_json::from_value(payload)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("malformed report: {e}")))?;
    validate_report_v1(&report).map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e))?;
    Ok(report)
}

async fn health() -> &'static str {
    HEALTH_MESSAGE
}

async fn report_schema() -> Json<serde_json::Value> {
    Json(report_v1_schema())
}

async fn list_reports(
    State(table): State<ReportTable>,
) -> Result<Json<Vec<StoredReportV1>>, (StatusCode, Json<serde_json::Value>)> {
    let listed = tokio::task::spawn_blocking(move || table.list())
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(listed))
}

async fn create_report(
    State(table): State<ReportTable>,
    Json(payload): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    let report = match parse_report(payload) {
        Ok(report) => report,
        Err((status, message)) => {
            tracing::warn!(%status, %message, "rejected report");
            return (status, Json(serde_json::json!({ "error": message })));
        }
    };

    let id = report.id.clone();
    let outcome = tokio::task::spawn_blocking(move || table.insert(&report)).await;
    match outcome {
        Ok(Ok(InsertOutcome::Created)) => {
            tracing::info!(report_id = %id, "report stored");
            (
                StatusCode::CREATED,
                Json(serde_json::json!({ "id": id, "status": "created" })),
            )
        }
        Ok(Ok(InsertOutcome::AlreadyExists)) => {
            tracing::info!(report_id = %id, "duplicate report ignored");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "id": id, "status": "duplicate" })),
            )
        }
        Ok(Err(err)) => internal_error(err.to_string()),
        Err(err) => internal_error(err.to_string()),
    }
}

fn internal_error(message: String) -> (StatusCode, Json<serde_json::Value>) {
    tracing::error!(%message, "report storage failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "Server Error" })),
    )
}
