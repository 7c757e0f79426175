use std::collections::HashSet;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sqlx::{PgPool, Row};

use crate::kst::graph::{self, NodeStatus};
use crate::response::{json_error, AppError};
use crate::state::AppState;

#[derive(Serialize)]
struct SuccessResponse<T> {
    success: bool,
    data: T,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphNodeDto {
    id: String,
    label: String,
    status: NodeStatus,
    is_fringe: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphEdgeDto {
    id: String,
    source: String,
    target: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FrontierGraphDto {
    domain_id: String,
    nodes: Vec<GraphNodeDto>,
    edges: Vec<GraphEdgeDto>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/:domainId/graph/:enrollmentId", get(get_frontier_graph))
}

/// Frontier visualization for one domain: every subtopic with its status
/// (completed, fringe or locked) derived from the durable mastery state.
async fn get_frontier_graph(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((domain_id, enrollment_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let (proxy, user) = require_user(&state, &headers).await?;
    let pool = proxy.pool();

    require_own_enrollment(pool, &enrollment_id, &user.id).await?;

    let graph = graph::load_domain_graph(pool, &domain_id).await.map_err(|err| {
        tracing::error!(error = %err, "failed to load domain graph");
        json_error(StatusCode::BAD_GATEWAY, "DB_ERROR", "Consulta de base de datos falló")
    })?;

    if graph.is_empty() {
        return Err(json_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "El dominio no existe o no tiene subtemas",
        ));
    }

    let mastered = select_mastered_set(pool, &enrollment_id).await?;

    let mut nodes = Vec::with_capacity(graph.len());
    let mut edges = Vec::new();

    for topic in graph.topics() {
        let status = graph.node_status(&topic.id, &mastered);
        nodes.push(GraphNodeDto {
            id: topic.id.clone(),
            label: topic.name.clone(),
            status,
            is_fringe: status == NodeStatus::Fringe,
        });

        for prerequisite in &topic.prerequisites {
            edges.push(GraphEdgeDto {
                id: format!("e{}-{}", prerequisite, topic.id),
                source: prerequisite.clone(),
                target: topic.id.clone(),
            });
        }
    }

    Ok(Json(SuccessResponse {
        success: true,
        data: FrontierGraphDto {
            domain_id,
            nodes,
            edges,
        },
    }))
}

async fn require_user(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<
    (
        std::sync::Arc<crate::db::DatabaseProxy>,
        crate::auth::AuthUser,
    ),
    AppError,
> {
    let token = crate::auth::extract_token(headers).ok_or_else(|| {
        json_error(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "No se proporcionó token de autenticación",
        )
    })?;

    let proxy = state.db_proxy().ok_or_else(|| {
        json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Servicio no disponible",
        )
    })?;

    let user = crate::auth::verify_request_token(proxy.as_ref(), &token)
        .await
        .map_err(|_| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Autenticación fallida, inicia sesión nuevamente",
            )
        })?;

    Ok((proxy, user))
}

async fn require_own_enrollment(
    pool: &PgPool,
    enrollment_id: &str,
    user_id: &str,
) -> Result<(), AppError> {
    let owner: Option<String> =
        sqlx::query(r#"SELECT "userId" FROM "enrollments" WHERE "id" = $1"#)
            .bind(enrollment_id)
            .fetch_optional(pool)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "failed to load enrollment");
                json_error(StatusCode::BAD_GATEWAY, "DB_ERROR", "Consulta de base de datos falló")
            })?
            .and_then(|row| row.try_get("userId").ok());

    match owner {
        None => Err(json_error(
            StatusCode::NOT_FOUND,
            "NOT_ENROLLED",
            "Estudiante no matriculado en esta instancia",
        )),
        Some(owner) if owner != user_id => Err(json_error(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "La matrícula pertenece a otro estudiante",
        )),
        Some(_) => Ok(()),
    }
}

async fn select_mastered_set(
    pool: &PgPool,
    enrollment_id: &str,
) -> Result<HashSet<String>, AppError> {
    let rows = sqlx::query(
        r#"
        SELECT "subtopicId"
        FROM "knowledge_states"
        WHERE "enrollmentId" = $1 AND "masteryLevel" = 'MASTERED'
        "#,
    )
    .bind(enrollment_id)
    .fetch_all(pool)
    .await
    .map_err(|err| {
        tracing::error!(error = %err, "failed to load mastered subtopics");
        json_error(StatusCode::BAD_GATEWAY, "DB_ERROR", "Consulta de base de datos falló")
    })?;

    Ok(rows
        .into_iter()
        .filter_map(|row| row.try_get::<String, _>("subtopicId").ok())
        .collect())
}
