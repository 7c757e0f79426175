use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::kst::selection::ExerciseRow;
use crate::kst::session::{
    self, AnswerInput, DiagnosticError, FinishSummary, NextQuestion, SessionRow, StartOutcome,
};
use crate::response::{json_error, AppError};
use crate::state::AppState;

#[derive(Serialize)]
struct SuccessResponse<T> {
    success: bool,
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    assessment_id: Option<String>,
    course_instance_id: Option<String>,
    max_questions: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartedResponse {
    message: &'static str,
    session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempt_id: Option<String>,
    enrollment_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatusDto {
    session_id: String,
    assessment_id: String,
    student_id: String,
    course_instance_id: String,
    status: String,
    max_questions: i32,
    current_question_count: i32,
    started_at: String,
    ended_at: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExerciseDto {
    id: String,
    subtopic_id: String,
    statement: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instruction: Option<String>,
    difficulty: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuestionDto {
    session_id: String,
    exercise: ExerciseDto,
    current_count: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[serde(untagged)]
enum NextQuestionDto {
    Question(QuestionDto),
    Finished { finished: bool },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitAnswerRequest {
    exercise_id: Option<String>,
    user_answer: Option<String>,
    dont_know: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitAnswerResponse {
    is_correct: bool,
    finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_question: Option<QuestionDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProbabilityDto {
    subtopic_id: String,
    subtopic_name: String,
    p_mastery: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishSummaryDto {
    score: f64,
    total_topics: usize,
    mastered: usize,
    learned: usize,
    remaining: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishResponse {
    message: &'static str,
    enrollment_progress: f64,
    summary: FinishSummaryDto,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DomainReportDto {
    domain_name: String,
    total: i64,
    mastered: i64,
    label: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckAccessResponse {
    can_access_content: bool,
    must_do_diagnostic: bool,
    progress: f64,
    status: String,
    message: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopicStatusDto {
    id: String,
    name: String,
    domain_name: String,
    status: String,
    is_locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_prerequisites: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteSubtopicRequest {
    subtopic_id: Option<String>,
    enrollment_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteSubtopicResponse {
    status: &'static str,
    message: &'static str,
    global_progress: f64,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start", post(start_diagnostic))
        .route("/session/:sessionId", get(get_session_status))
        .route("/session/:sessionId/probabilities", get(get_probabilities))
        .route("/session/:sessionId/next-question", get(get_next_question))
        .route("/session/:sessionId/submit-answer", post(submit_answer))
        .route("/session/:sessionId/finish", post(finish_diagnostic))
        .route("/session/:sessionId/progress-report", get(session_progress_report))
        .route("/enrollment/check-access/:courseInstanceId", get(check_course_access))
        .route("/course/topics-status/:courseInstanceId", get(course_topics_status))
        .route("/progress-report/:courseInstanceId", get(progress_report_by_instance))
        .route("/learning/complete-subtopic", post(complete_subtopic))
}

async fn start_diagnostic(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<StartRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (proxy, user) = require_user(&state, &headers).await?;

    let Some(assessment_id) = non_empty(payload.assessment_id) else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "assessmentId y courseInstanceId son requeridos",
        ));
    };
    let Some(course_instance_id) = non_empty(payload.course_instance_id) else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "assessmentId y courseInstanceId son requeridos",
        ));
    };
    if payload.max_questions.is_some_and(|value| value <= 0) {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "maxQuestions debe ser un entero positivo",
        ));
    }

    let mut tx = begin_tx(proxy.pool()).await?;
    let outcome = session::start(
        &mut tx,
        &user.id,
        &assessment_id,
        &course_instance_id,
        payload.max_questions,
    )
    .await
    .map_err(map_engine_error)?;
    commit_tx(tx).await?;

    match outcome {
        StartOutcome::Existing {
            session_id,
            enrollment_id,
        } => Ok((
            StatusCode::OK,
            Json(SuccessResponse {
                success: true,
                data: StartedResponse {
                    message: "Ya tienes una sesión en progreso",
                    session_id,
                    attempt_id: None,
                    enrollment_id,
                },
            }),
        )),
        StartOutcome::Created {
            session_id,
            attempt_id,
            enrollment_id,
        } => Ok((
            StatusCode::CREATED,
            Json(SuccessResponse {
                success: true,
                data: StartedResponse {
                    message: "Sesión e intento iniciados",
                    session_id,
                    attempt_id: Some(attempt_id),
                    enrollment_id,
                },
            }),
        )),
    }
}

async fn get_session_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let (proxy, user) = require_user(&state, &headers).await?;

    let mut tx = begin_tx(proxy.pool()).await?;
    let session = require_own_session(&mut tx, &session_id, &user.id).await?;
    commit_tx(tx).await?;

    Ok(Json(SuccessResponse {
        success: true,
        data: session_to_dto(&session),
    }))
}

async fn get_probabilities(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let (proxy, user) = require_user(&state, &headers).await?;

    let mut tx = begin_tx(proxy.pool()).await?;
    require_own_session(&mut tx, &session_id, &user.id).await?;
    commit_tx(tx).await?;

    let probabilities = select_probabilities_with_names(proxy.pool(), &session_id).await?;
    if probabilities.is_empty() {
        return Err(json_error(
            StatusCode::NOT_FOUND,
            "NO_PROGRESS_DATA",
            "No se encontraron probabilidades para esta sesión",
        ));
    }

    Ok(Json(SuccessResponse {
        success: true,
        data: probabilities,
    }))
}

async fn get_next_question(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let (proxy, user) = require_user(&state, &headers).await?;

    let mut tx = begin_tx(proxy.pool()).await?;
    let session = require_own_session(&mut tx, &session_id, &user.id).await?;
    let next = session::next_question(&mut tx, &session)
        .await
        .map_err(map_engine_error)?;
    commit_tx(tx).await?;

    Ok(Json(SuccessResponse {
        success: true,
        data: next_question_to_dto(&session.id, next),
    }))
}

async fn submit_answer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(payload): Json<SubmitAnswerRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (proxy, user) = require_user(&state, &headers).await?;

    let Some(exercise_id) = non_empty(payload.exercise_id) else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "exerciseId es requerido",
        ));
    };

    let input = AnswerInput {
        exercise_id,
        user_answer: payload.user_answer,
        dont_know: payload.dont_know.unwrap_or(false),
    };

    let mut tx = begin_tx(proxy.pool()).await?;
    let session = require_own_session(&mut tx, &session_id, &user.id).await?;
    let outcome = session::submit_answer(&mut tx, &session, &input)
        .await
        .map_err(map_engine_error)?;
    commit_tx(tx).await?;

    let response = match next_question_to_dto(&session.id, outcome.next) {
        NextQuestionDto::Question(question) => SubmitAnswerResponse {
            is_correct: outcome.is_correct,
            finished: false,
            next_question: Some(question),
        },
        NextQuestionDto::Finished { .. } => SubmitAnswerResponse {
            is_correct: outcome.is_correct,
            finished: true,
            next_question: None,
        },
    };

    Ok(Json(SuccessResponse {
        success: true,
        data: response,
    }))
}

async fn finish_diagnostic(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let (proxy, user) = require_user(&state, &headers).await?;

    let mut tx = begin_tx(proxy.pool()).await?;
    let session = require_own_session(&mut tx, &session_id, &user.id).await?;
    let summary = session::finish(&mut tx, &user.id, &session)
        .await
        .map_err(map_engine_error)?;
    commit_tx(tx).await?;

    Ok(Json(SuccessResponse {
        success: true,
        data: finish_to_response(summary),
    }))
}

async fn session_progress_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let (proxy, user) = require_user(&state, &headers).await?;

    let mut tx = begin_tx(proxy.pool()).await?;
    let session = require_own_session(&mut tx, &session_id, &user.id).await?;
    let enrollment = session::select_enrollment(&mut tx, &user.id, &session.course_instance_id)
        .await
        .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?
        .ok_or_else(not_enrolled_error)?;
    commit_tx(tx).await?;

    let report =
        select_domain_report(proxy.pool(), &session.course_instance_id, &enrollment.id).await?;

    Ok(Json(SuccessResponse {
        success: true,
        data: report,
    }))
}

async fn check_course_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(course_instance_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let (proxy, user) = require_user(&state, &headers).await?;

    let mut tx = begin_tx(proxy.pool()).await?;
    let enrollment = session::select_enrollment(&mut tx, &user.id, &course_instance_id)
        .await
        .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?
        .ok_or_else(not_enrolled_error)?;
    commit_tx(tx).await?;

    // Progress exactly 0 means the diagnostic was never completed; the finish
    // step writes at least 0.01.
    let must_do_diagnostic = enrollment.progress == 0.0;

    Ok(Json(SuccessResponse {
        success: true,
        data: CheckAccessResponse {
            can_access_content: !must_do_diagnostic,
            must_do_diagnostic,
            progress: enrollment.progress,
            status: enrollment.status,
            message: if must_do_diagnostic {
                "Redirigir a diagnóstico"
            } else {
                "Acceso permitido al contenido"
            },
        },
    }))
}

async fn course_topics_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(course_instance_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let (proxy, user) = require_user(&state, &headers).await?;

    let mut tx = begin_tx(proxy.pool()).await?;
    let enrollment = session::select_enrollment(&mut tx, &user.id, &course_instance_id)
        .await
        .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?
        .ok_or_else(not_enrolled_error)?;
    commit_tx(tx).await?;

    let topics = select_topics_status(proxy.pool(), &course_instance_id, &enrollment.id).await?;

    Ok(Json(SuccessResponse {
        success: true,
        data: serde_json::json!({ "topics": topics }),
    }))
}

async fn progress_report_by_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(course_instance_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let (proxy, user) = require_user(&state, &headers).await?;

    let mut tx = begin_tx(proxy.pool()).await?;
    let enrollment = session::select_enrollment(&mut tx, &user.id, &course_instance_id)
        .await
        .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?
        .ok_or_else(not_enrolled_error)?;
    commit_tx(tx).await?;

    let report = select_domain_report(proxy.pool(), &course_instance_id, &enrollment.id).await?;

    Ok(Json(SuccessResponse {
        success: true,
        data: serde_json::json!({ "report": report }),
    }))
}

async fn complete_subtopic(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CompleteSubtopicRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (proxy, user) = require_user(&state, &headers).await?;

    let Some(subtopic_id) = non_empty(payload.subtopic_id) else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "subtopicId y enrollmentId son requeridos",
        ));
    };
    let Some(enrollment_id) = non_empty(payload.enrollment_id) else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "subtopicId y enrollmentId son requeridos",
        ));
    };

    let global_progress =
        mark_subtopic_mastered(proxy.pool(), &user.id, &enrollment_id, &subtopic_id).await?;

    Ok(Json(SuccessResponse {
        success: true,
        data: CompleteSubtopicResponse {
            status: "success",
            message: "Progreso actualizado",
            global_progress,
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

async fn require_own_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    session_id: &str,
    user_id: &str,
) -> Result<SessionRow, AppError> {
    let session = session::select_session(tx, session_id)
        .await
        .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?
        .ok_or_else(|| {
            json_error(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("La sesión no existe: {session_id}"),
            )
        })?;

    if session.student_id != user_id {
        return Err(json_error(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "La sesión pertenece a otro estudiante",
        ));
    }

    Ok(session)
}

fn map_engine_error(err: DiagnosticError) -> AppError {
    match err {
        DiagnosticError::NotEnrolled => not_enrolled_error(),
        DiagnosticError::CourseNotAssessable => json_error(
            StatusCode::BAD_REQUEST,
            "COURSE_NOT_ASSESSABLE",
            "Este curso no tiene contenidos configurados para evaluar",
        ),
        DiagnosticError::SessionNotFound => json_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "La sesión no existe",
        ),
        DiagnosticError::EntityNotFound(entity) => {
            tracing::warn!(entity, "diagnostic entity lookup failed");
            json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "Recurso no encontrado")
        }
        DiagnosticError::NoPendingQuestion => json_error(
            StatusCode::NOT_FOUND,
            "NO_PENDING_QUESTION",
            "No hay una pregunta pendiente para este ejercicio",
        ),
        DiagnosticError::NoProgressData => json_error(
            StatusCode::BAD_REQUEST,
            "NO_PROGRESS_DATA",
            "No se encontraron datos de progreso",
        ),
        DiagnosticError::Sql(err) => {
            tracing::error!(error = %err, "diagnostic persistence failure");
            json_error(
                StatusCode::BAD_GATEWAY,
                "DB_ERROR",
                "Operación de base de datos falló",
            )
        }
    }
}

fn not_enrolled_error() -> AppError {
    json_error(
        StatusCode::NOT_FOUND,
        "NOT_ENROLLED",
        "Estudiante no matriculado en esta instancia",
    )
}

async fn begin_tx(pool: &PgPool) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, AppError> {
    pool.begin().await.map_err(|err| {
        tracing::error!(error = %err, "failed to open transaction");
        json_error(
            StatusCode::BAD_GATEWAY,
            "DB_ERROR",
            "Operación de base de datos falló",
        )
    })
}

async fn commit_tx(tx: sqlx::Transaction<'static, sqlx::Postgres>) -> Result<(), AppError> {
    tx.commit().await.map_err(|err| {
        tracing::error!(error = %err, "failed to commit transaction");
        json_error(
            StatusCode::BAD_GATEWAY,
            "DB_ERROR",
            "Operación de base de datos falló",
        )
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn session_to_dto(session: &SessionRow) -> SessionStatusDto {
    SessionStatusDto {
        session_id: session.id.clone(),
        assessment_id: session.assessment_id.clone(),
        student_id: session.student_id.clone(),
        course_instance_id: session.course_instance_id.clone(),
        status: session.status.clone(),
        max_questions: session.max_questions,
        current_question_count: session.current_question_count,
        started_at: format_naive(session.started_at),
        ended_at: session.ended_at.map(format_naive),
    }
}

fn next_question_to_dto(session_id: &str, next: NextQuestion) -> NextQuestionDto {
    match next {
        NextQuestion::Question {
            exercise,
            current_count,
        } => NextQuestionDto::Question(QuestionDto {
            session_id: session_id.to_string(),
            exercise: exercise_to_dto(exercise),
            current_count,
        }),
        NextQuestion::Finished => NextQuestionDto::Finished { finished: true },
    }
}

fn exercise_to_dto(exercise: ExerciseRow) -> ExerciseDto {
    ExerciseDto {
        id: exercise.id,
        subtopic_id: exercise.subtopic_id,
        statement: exercise.statement,
        expression: exercise.expression,
        instruction: exercise.instruction,
        difficulty: exercise.difficulty,
    }
}

fn finish_to_response(summary: FinishSummary) -> FinishResponse {
    FinishResponse {
        message: if summary.already_completed {
            "Esta sesión ya había sido finalizada previamente"
        } else {
            "Evaluación finalizada y progreso de matrícula actualizado"
        },
        enrollment_progress: summary.enrollment_progress,
        summary: FinishSummaryDto {
            score: summary.score,
            total_topics: summary.total_topics,
            mastered: summary.mastered,
            learned: summary.learned,
            remaining: summary.remaining,
        },
    }
}

fn format_naive(value: chrono::NaiveDateTime) -> String {
    chrono::DateTime::<Utc>::from_naive_utc_and_offset(value, Utc)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn select_probabilities_with_names(
    pool: &PgPool,
    session_id: &str,
) -> Result<Vec<ProbabilityDto>, AppError> {
    let rows = sqlx::query(
        r#"
        SELECT dp."subtopicId", s."name" as "subtopicName", (dp."pMastery")::float8 as "pMastery"
        FROM "diagnostic_probabilities" dp
        JOIN "subtopics" s ON dp."subtopicId" = s."id"
        WHERE dp."sessionId" = $1
        ORDER BY s."name"
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .map_err(|err| {
        tracing::error!(error = %err, "failed to load session probabilities");
        json_error(StatusCode::BAD_GATEWAY, "DB_ERROR", "Consulta de base de datos falló")
    })?;

    Ok(rows
        .into_iter()
        .map(|row| ProbabilityDto {
            subtopic_id: row.try_get("subtopicId").unwrap_or_default(),
            subtopic_name: row.try_get("subtopicName").unwrap_or_default(),
            p_mastery: row.try_get::<f64, _>("pMastery").unwrap_or(0.5),
        })
        .collect())
}

async fn select_domain_report(
    pool: &PgPool,
    course_instance_id: &str,
    enrollment_id: &str,
) -> Result<Vec<DomainReportDto>, AppError> {
    let rows = sqlx::query(
        r#"
        SELECT d."name" as "domainName",
               COUNT(s."id") as "total",
               COUNT(*) FILTER (WHERE ks."masteryLevel" = 'MASTERED') as "mastered"
        FROM "domains" d
        JOIN "subtopics" s ON s."domainId" = d."id"
        JOIN "course_instances" ci ON ci."courseId" = d."courseId"
        LEFT JOIN "knowledge_states" ks
               ON ks."subtopicId" = s."id" AND ks."enrollmentId" = $2
        WHERE ci."id" = $1
        GROUP BY d."id", d."name"
        ORDER BY d."name"
        "#,
    )
    .bind(course_instance_id)
    .bind(enrollment_id)
    .fetch_all(pool)
    .await
    .map_err(|err| {
        tracing::error!(error = %err, "failed to build domain report");
        json_error(StatusCode::BAD_GATEWAY, "DB_ERROR", "Consulta de base de datos falló")
    })?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let total = row.try_get::<i64, _>("total").unwrap_or(0);
            let mastered = row.try_get::<i64, _>("mastered").unwrap_or(0);
            DomainReportDto {
                domain_name: row.try_get("domainName").unwrap_or_default(),
                total,
                mastered,
                label: format!("{mastered}/{total}"),
            }
        })
        .collect())
}

async fn select_topics_status(
    pool: &PgPool,
    course_instance_id: &str,
    enrollment_id: &str,
) -> Result<Vec<TopicStatusDto>, AppError> {
    let rows = sqlx::query(
        r#"
        SELECT s."id",
               s."name",
               d."name" as "domainName",
               COALESCE(ks."masteryLevel", 'NOT_MASTERED') as "status",
               (
                 SELECT STRING_AGG(p."name", ', ')
                 FROM "subtopic_dependencies" sd
                 JOIN "subtopics" p ON sd."prerequisiteId" = p."id"
                 LEFT JOIN "knowledge_states" ksp
                        ON ksp."subtopicId" = p."id" AND ksp."enrollmentId" = $2
                 WHERE sd."subtopicId" = s."id"
                   AND (ksp."masteryLevel" IS NULL OR ksp."masteryLevel" != 'MASTERED')
               ) as "missingPrerequisites"
        FROM "subtopics" s
        JOIN "domains" d ON s."domainId" = d."id"
        JOIN "course_instances" ci ON d."courseId" = ci."courseId"
        LEFT JOIN "knowledge_states" ks
               ON s."id" = ks."subtopicId" AND ks."enrollmentId" = $2
        WHERE ci."id" = $1
        ORDER BY d."id", s."id"
        "#,
    )
    .bind(course_instance_id)
    .bind(enrollment_id)
    .fetch_all(pool)
    .await
    .map_err(|err| {
        tracing::error!(error = %err, "failed to load learning path");
        json_error(StatusCode::BAD_GATEWAY, "DB_ERROR", "Consulta de base de datos falló")
    })?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let missing: Option<String> = row
                .try_get::<Option<String>, _>("missingPrerequisites")
                .ok()
                .flatten();
            TopicStatusDto {
                id: row.try_get("id").unwrap_or_default(),
                name: row.try_get("name").unwrap_or_default(),
                domain_name: row.try_get("domainName").unwrap_or_default(),
                status: row
                    .try_get("status")
                    .unwrap_or_else(|_| "NOT_MASTERED".to_string()),
                is_locked: missing.is_some(),
                missing_prerequisites: missing,
            }
        })
        .collect())
}

async fn mark_subtopic_mastered(
    pool: &PgPool,
    user_id: &str,
    enrollment_id: &str,
    subtopic_id: &str,
) -> Result<f64, AppError> {
    let mut tx = begin_tx(pool).await?;

    let enrollment_row = sqlx::query(
        r#"SELECT "userId","courseInstanceId" FROM "enrollments" WHERE "id" = $1"#,
    )
    .bind(enrollment_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?
    .ok_or_else(not_enrolled_error)?;

    let owner: String = enrollment_row.try_get("userId").unwrap_or_default();
    if owner != user_id {
        return Err(json_error(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "La matrícula pertenece a otro estudiante",
        ));
    }
    let course_instance_id: String = enrollment_row
        .try_get("courseInstanceId")
        .unwrap_or_default();

    let domain_id: Option<String> =
        sqlx::query(r#"SELECT "domainId" FROM "subtopics" WHERE "id" = $1"#)
            .bind(subtopic_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?
            .and_then(|row| row.try_get("domainId").ok());

    let Some(domain_id) = domain_id else {
        return Err(json_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Subtema no encontrado",
        ));
    };

    let now = Utc::now().naive_utc();

    sqlx::query(
        r#"
        INSERT INTO "knowledge_states" ("id","enrollmentId","subtopicId","masteryLevel","lastUpdated")
        VALUES ($1,$2,$3,'MASTERED',$4)
        ON CONFLICT ("enrollmentId","subtopicId")
        DO UPDATE SET "masteryLevel" = 'MASTERED', "lastUpdated" = $4
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(enrollment_id)
    .bind(subtopic_id)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?;

    let total_in_domain: i64 =
        sqlx::query_scalar(r#"SELECT COUNT(*) FROM "subtopics" WHERE "domainId" = $1"#)
            .bind(&domain_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?;

    let mastered_in_domain: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM "knowledge_states" ks
        JOIN "subtopics" s ON ks."subtopicId" = s."id"
        WHERE ks."enrollmentId" = $1 AND s."domainId" = $2 AND ks."masteryLevel" = 'MASTERED'
        "#,
    )
    .bind(enrollment_id)
    .bind(&domain_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?;

    let domain_status = if mastered_in_domain >= total_in_domain {
        "MASTERED"
    } else if mastered_in_domain > 0 {
        "LEARNED"
    } else {
        "NOT_MASTERED"
    };

    sqlx::query(
        r#"
        INSERT INTO "domain_progress" ("id","enrollmentId","domainId","progressStatus","lastUpdated")
        VALUES ($1,$2,$3,$4,$5)
        ON CONFLICT ("enrollmentId","domainId")
        DO UPDATE SET "progressStatus" = $4, "lastUpdated" = $5
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(enrollment_id)
    .bind(&domain_id)
    .bind(domain_status)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?;

    let total_course: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM "subtopics" s
        JOIN "domains" d ON s."domainId" = d."id"
        JOIN "course_instances" ci ON d."courseId" = ci."courseId"
        WHERE ci."id" = $1
        "#,
    )
    .bind(&course_instance_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?;

    let mastered_course: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM "knowledge_states" ks
        JOIN "subtopics" s ON ks."subtopicId" = s."id"
        JOIN "domains" d ON s."domainId" = d."id"
        JOIN "course_instances" ci ON d."courseId" = ci."courseId"
        WHERE ks."enrollmentId" = $1 AND ks."masteryLevel" = 'MASTERED' AND ci."id" = $2
        "#,
    )
    .bind(enrollment_id)
    .bind(&course_instance_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?;

    let mut global_progress = 0.0;
    if total_course > 0 {
        global_progress =
            ((mastered_course as f64 / total_course as f64) * 100.0 * 100.0).round() / 100.0;
        sqlx::query(
            r#"UPDATE "enrollments" SET "progress" = $1, "lastAccessedAt" = $2 WHERE "id" = $3"#,
        )
        .bind(global_progress)
        .bind(now)
        .bind(enrollment_id)
        .execute(&mut *tx)
        .await
        .map_err(|err| map_engine_error(DiagnosticError::Sql(err)))?;
    }

    commit_tx(tx).await?;
    Ok(global_progress)
}
