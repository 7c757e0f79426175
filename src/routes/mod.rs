mod diagnostics;
mod domains;
mod health;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;

use crate::response::json_error;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let mut app = Router::new();

    app = app.nest("/api/diagnostics", diagnostics::router());
    app = app.nest("/api/domains", domains::router());
    app = app.nest("/health", health::router());
    app = app.nest("/api/health", health::router());

    app.fallback(fallback_handler).with_state(state)
}

async fn fallback_handler() -> Response {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "El recurso solicitado no existe").into_response()
}
