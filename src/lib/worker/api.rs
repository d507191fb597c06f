use std::future::Future;

use axum::{
    Json, Router,
    extract::{Path, Query, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;

use super::types::{Action, ActionQuery, StandServer, Worker};
use crate::engine::StatusReport;

impl StandServer {
    pub fn new(worker: Worker, address: &str, port: u16) -> Self {
        Self {
            worker,
            address: address.to_string(),
            port,
        }
    }

    async fn engine_status(AxumState(worker): AxumState<Worker>) -> Json<StatusReport> {
        Json(worker.engine.status_report().await)
    }

    async fn action(
        AxumState(worker): AxumState<Worker>,
        Path(action): Path<String>,
        Query(query): Query<ActionQuery>,
    ) -> Response {
        let parsed = match action.parse::<Action>() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "Unknown action");
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({"status": "not found", "error": "invalid action"})),
                )
                    .into_response();
            }
        };

        match parsed {
            Action::EngineStatus => Json(worker.engine.status_report().await).into_response(),
            Action::CheckApplication => {
                if worker.engine.check_application().await {
                    Json(json!({"status": "ok", "details": "Application is available"})).into_response()
                } else {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"status": "fail", "error": "Application is not available"})),
                    )
                        .into_response()
                }
            }
            Action::Run(workflow) if query.is_sync() => match worker.run_sync(workflow).await {
                Ok(Ok(())) => Json(json!({"status": "ok"})).into_response(),
                Ok(Err(e)) => fail(e.to_string()),
                Err(e) => fail(e.to_string()),
            },
            Action::Run(workflow) => match worker.submit(workflow) {
                Ok(_) => (
                    StatusCode::ACCEPTED,
                    Json(json!({"status": "queued", "action": action})),
                )
                    .into_response(),
                Err(e) => fail(e.to_string()),
            },
        }
    }

    pub fn router(worker: Worker) -> Router {
        Router::new()
            .route("/", get(StandServer::engine_status))
            .route("/{action}", get(StandServer::action))
            .with_state(worker)
    }

    /// Serve until `shutdown` resolves.
    pub async fn start_server<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = StandServer::router(self.worker);
        let listener = TcpListener::bind((self.address.as_str(), self.port)).await?;
        tracing::info!(address = %self.address, port = self.port, "Listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

fn fail(error: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"status": "fail", "error": error})),
    )
        .into_response()
}
