//! Diagnostic session lifecycle: start, question/answer loop, finish.
//!
//! Every operation takes the caller's transaction and the acting student id
//! explicitly. Route handlers open the transaction, call in, and commit; on
//! any error the whole step rolls back and the session looks as if the
//! request never happened.

use chrono::Utc;
use sqlx::{Postgres, Row, Transaction};
use thiserror::Error;
use uuid::Uuid;

use crate::kst::bkt;
use crate::kst::graph;
use crate::kst::ledger::{self, MasteryEntry};
use crate::kst::selection::{self, ExerciseRow};

pub const DEFAULT_MAX_QUESTIONS: i32 = 30;
/// Answer text stored when the student declines to answer.
pub const DONT_KNOW_SENTINEL: &str = "SABE_NO_SABE";

pub const MASTERED_THRESHOLD: f64 = 0.85;
pub const LEARNED_THRESHOLD: f64 = 0.50;
/// Progress written for a completed diagnostic that scored zero; separates
/// "attempted, scored zero" from "never attempted" (exactly 0).
pub const COMPLETED_PROGRESS_FLOOR: f64 = 0.01;

pub const STATUS_IN_PROGRESS: &str = "IN_PROGRESS";
pub const STATUS_COMPLETED: &str = "COMPLETED";

pub const LOG_ASKED: &str = "ASKED";
pub const LOG_ANSWERED: &str = "ANSWERED";

#[derive(Debug, Error)]
pub enum DiagnosticError {
    #[error("student has no active enrollment for this course instance")]
    NotEnrolled,
    #[error("course has no subtopics configured to assess")]
    CourseNotAssessable,
    #[error("diagnostic session not found")]
    SessionNotFound,
    #[error("entity not found: {0}")]
    EntityNotFound(&'static str),
    #[error("no pending question matches this exercise")]
    NoPendingQuestion,
    #[error("no mastery data recorded for this session")]
    NoProgressData,
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub assessment_id: String,
    pub student_id: String,
    pub course_instance_id: String,
    pub max_questions: i32,
    pub current_question_count: i32,
    pub status: String,
    pub started_at: chrono::NaiveDateTime,
    pub ended_at: Option<chrono::NaiveDateTime>,
}

impl SessionRow {
    pub fn is_completed(&self) -> bool {
        self.status == STATUS_COMPLETED
    }
}

#[derive(Debug, Clone)]
pub struct EnrollmentRow {
    pub id: String,
    pub user_id: String,
    pub course_instance_id: String,
    pub status: String,
    pub progress: f64,
}

#[derive(Debug)]
pub enum StartOutcome {
    Existing {
        session_id: String,
        enrollment_id: String,
    },
    Created {
        session_id: String,
        attempt_id: String,
        enrollment_id: String,
    },
}

#[derive(Debug)]
pub enum NextQuestion {
    Question {
        exercise: ExerciseRow,
        current_count: i32,
    },
    Finished,
}

#[derive(Debug, Clone)]
pub struct AnswerInput {
    pub exercise_id: String,
    pub user_answer: Option<String>,
    pub dont_know: bool,
}

#[derive(Debug)]
pub struct SubmitOutcome {
    pub is_correct: bool,
    pub next: NextQuestion,
}

#[derive(Debug, Clone)]
pub struct FinishSummary {
    pub score: f64,
    pub total_topics: usize,
    pub mastered: usize,
    pub learned: usize,
    pub remaining: usize,
    pub enrollment_progress: f64,
    pub already_completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasteryLevel {
    NotMastered,
    Learned,
    Mastered,
}

impl MasteryLevel {
    pub fn from_probability(p: f64) -> Self {
        if p >= MASTERED_THRESHOLD {
            Self::Mastered
        } else if p >= LEARNED_THRESHOLD {
            Self::Learned
        } else {
            Self::NotMastered
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotMastered => "NOT_MASTERED",
            Self::Learned => "LEARNED",
            Self::Mastered => "MASTERED",
        }
    }
}

/// Grades a raw answer against the expected one. "Don't know" is graded
/// incorrect and recorded with a sentinel instead of the raw text.
pub fn grade_answer(exercise: &ExerciseRow, input: &AnswerInput) -> (bool, String) {
    if input.dont_know {
        return (false, DONT_KNOW_SENTINEL.to_string());
    }
    let given = input.user_answer.as_deref().unwrap_or("");
    let is_correct =
        given.trim().to_lowercase() == exercise.expected_answer.trim().to_lowercase();
    (is_correct, given.to_string())
}

/// Opens a diagnostic attempt. Idempotent per (student, course instance):
/// an existing IN_PROGRESS session is returned instead of a duplicate.
pub async fn start(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
    assessment_id: &str,
    course_instance_id: &str,
    max_questions: Option<i32>,
) -> Result<StartOutcome, DiagnosticError> {
    let enrollment = select_enrollment(tx, user_id, course_instance_id)
        .await?
        .ok_or(DiagnosticError::NotEnrolled)?;

    if let Some(existing) = select_active_session(tx, user_id, course_instance_id).await? {
        return Ok(StartOutcome::Existing {
            session_id: existing.id,
            enrollment_id: enrollment.id,
        });
    }

    let course_id = select_course_id(tx, course_instance_id)
        .await?
        .ok_or(DiagnosticError::EntityNotFound("course_instance"))?;

    let graph = graph::load_course_graph(tx, &course_id).await?;
    if graph.is_empty() {
        return Err(DiagnosticError::CourseNotAssessable);
    }

    let attempt_id = insert_attempt(tx, assessment_id, &enrollment.id).await?;

    let session_id = Uuid::new_v4().to_string();
    let max_q = max_questions.unwrap_or(DEFAULT_MAX_QUESTIONS).max(1);
    sqlx::query(
        r#"
        INSERT INTO "diagnostic_sessions"
          ("id","assessmentId","studentId","courseInstanceId","startedAt","maxQuestions","currentQuestionCount","status")
        VALUES ($1,$2,$3,$4,$5,$6,0,$7)
        "#,
    )
    .bind(&session_id)
    .bind(assessment_id)
    .bind(user_id)
    .bind(course_instance_id)
    .bind(Utc::now().naive_utc())
    .bind(max_q)
    .bind(STATUS_IN_PROGRESS)
    .execute(&mut **tx)
    .await?;

    ledger::initialize(tx, &session_id, &graph.topic_ids()).await?;

    Ok(StartOutcome::Created {
        session_id,
        attempt_id,
        enrollment_id: enrollment.id,
    })
}

/// Selection policy entry point. Re-returns a pending question unchanged, so
/// a client reload never skips or duplicates one.
pub async fn next_question(
    tx: &mut Transaction<'_, Postgres>,
    session: &SessionRow,
) -> Result<NextQuestion, DiagnosticError> {
    if let Some(pending_exercise_id) = select_pending_exercise_id(tx, &session.id).await? {
        let exercise = selection::select_exercise_by_id(tx, &pending_exercise_id)
            .await?
            .ok_or(DiagnosticError::EntityNotFound("exercise"))?;
        return Ok(NextQuestion::Question {
            exercise,
            current_count: session.current_question_count,
        });
    }

    if session.current_question_count >= session.max_questions || session.is_completed() {
        return Ok(NextQuestion::Finished);
    }

    let course_id = select_course_id(tx, &session.course_instance_id)
        .await?
        .ok_or(DiagnosticError::EntityNotFound("course_instance"))?;
    let graph = graph::load_course_graph(tx, &course_id).await?;
    let snapshot = ledger::snapshot(tx, &session.id).await?;

    let candidates = selection::rank_candidates(&snapshot, |id| {
        graph.prerequisites_of(id).to_vec()
    });

    let mut exercise = None;
    if let Some(target) = selection::pick_candidate(&candidates) {
        exercise =
            selection::select_exercise_for_subtopic(tx, &session.id, &session.assessment_id, target)
                .await?;
    }
    if exercise.is_none() {
        exercise =
            selection::select_fallback_exercise(tx, &session.id, &session.assessment_id).await?;
    }

    let Some(exercise) = exercise else {
        return Ok(NextQuestion::Finished);
    };

    insert_question_log(tx, &session.id, &exercise).await?;

    Ok(NextQuestion::Question {
        current_count: session.current_question_count,
        exercise,
    })
}

/// Applies one observed response: log mutation, BKT posterior, propagation,
/// counter increment and the follow-up selection, all on one transaction.
pub async fn submit_answer(
    tx: &mut Transaction<'_, Postgres>,
    session: &SessionRow,
    input: &AnswerInput,
) -> Result<SubmitOutcome, DiagnosticError> {
    let log_id = select_pending_log_id(tx, &session.id, &input.exercise_id)
        .await?
        .ok_or(DiagnosticError::NoPendingQuestion)?;

    let exercise = selection::select_exercise_by_id(tx, &input.exercise_id)
        .await?
        .ok_or(DiagnosticError::EntityNotFound("exercise"))?;

    let (is_correct, stored_answer) = grade_answer(&exercise, input);

    sqlx::query(
        r#"
        UPDATE "diagnostic_question_logs"
        SET "status" = $1, "studentAnswer" = $2, "isCorrect" = $3, "answeredAt" = $4
        WHERE "id" = $5
        "#,
    )
    .bind(LOG_ANSWERED)
    .bind(&stored_answer)
    .bind(is_correct)
    .bind(Utc::now().naive_utc())
    .bind(&log_id)
    .execute(&mut **tx)
    .await?;

    let p_old = ledger::get(tx, &session.id, &exercise.subtopic_id)
        .await?
        .ok_or(DiagnosticError::NoProgressData)?;
    let p_new = bkt::posterior(p_old, is_correct);
    ledger::set(tx, &session.id, &exercise.subtopic_id, p_new).await?;

    if is_correct {
        ledger::credit_prerequisites(tx, &session.id, &exercise.subtopic_id).await?;
    } else {
        ledger::penalize_dependents(tx, &session.id, &exercise.subtopic_id).await?;
    }

    sqlx::query(
        r#"
        UPDATE "diagnostic_sessions"
        SET "currentQuestionCount" = "currentQuestionCount" + 1
        WHERE "id" = $1
        "#,
    )
    .bind(&session.id)
    .execute(&mut **tx)
    .await?;

    let updated = select_session(tx, &session.id)
        .await?
        .ok_or(DiagnosticError::SessionNotFound)?;
    let next = next_question(tx, &updated).await?;

    Ok(SubmitOutcome { is_correct, next })
}

/// Collapses the ledger into durable per-student records and closes the
/// session. Finishing an already COMPLETED session recomputes the same
/// summary without writing anything.
pub async fn finish(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
    session: &SessionRow,
) -> Result<FinishSummary, DiagnosticError> {
    let enrollment = select_enrollment(tx, user_id, &session.course_instance_id)
        .await?
        .ok_or(DiagnosticError::NotEnrolled)?;

    let snapshot = ledger::snapshot(tx, &session.id).await?;
    if snapshot.is_empty() {
        return Err(DiagnosticError::NoProgressData);
    }

    let (mastered, learned) = count_levels(&snapshot);
    let total_topics = snapshot.len();
    let score = round2((mastered as f64 / total_topics as f64) * 100.0);

    if session.is_completed() {
        return Ok(FinishSummary {
            score,
            total_topics,
            mastered,
            learned,
            remaining: total_topics - mastered - learned,
            enrollment_progress: enrollment.progress,
            already_completed: true,
        });
    }

    let now = Utc::now().naive_utc();

    for entry in &snapshot {
        let level = MasteryLevel::from_probability(entry.p_mastery);
        // Rows are owned by the knowledge ledger; absence is tolerated here.
        sqlx::query(
            r#"
            UPDATE "knowledge_states"
            SET "masteryLevel" = $1, "lastUpdated" = $2
            WHERE "enrollmentId" = $3 AND "subtopicId" = $4
            "#,
        )
        .bind(level.as_str())
        .bind(now)
        .bind(&enrollment.id)
        .bind(&entry.subtopic_id)
        .execute(&mut **tx)
        .await?;
    }

    sqlx::query(
        r#"UPDATE "domain_progress" SET "lastUpdated" = $1 WHERE "enrollmentId" = $2"#,
    )
    .bind(now)
    .bind(&enrollment.id)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE "assessment_attempts"
        SET "finishedAt" = $1, "score" = $2
        WHERE "id" = (
            SELECT "id" FROM "assessment_attempts"
            WHERE "assessmentId" = $3 AND "enrollmentId" = $4
            ORDER BY "startedAt" DESC
            LIMIT 1
        )
        "#,
    )
    .bind(now)
    .bind(score)
    .bind(&session.assessment_id)
    .bind(&enrollment.id)
    .execute(&mut **tx)
    .await?;

    let enrollment_progress = round2(score.max(COMPLETED_PROGRESS_FLOOR));
    sqlx::query(
        r#"
        UPDATE "enrollments"
        SET "progress" = $1, "lastAccessedAt" = $2
        WHERE "id" = $3
        "#,
    )
    .bind(enrollment_progress)
    .bind(now)
    .bind(&enrollment.id)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE "diagnostic_sessions"
        SET "status" = $1, "endedAt" = $2
        WHERE "id" = $3
        "#,
    )
    .bind(STATUS_COMPLETED)
    .bind(now)
    .bind(&session.id)
    .execute(&mut **tx)
    .await?;

    Ok(FinishSummary {
        score,
        total_topics,
        mastered,
        learned,
        remaining: total_topics - mastered - learned,
        enrollment_progress,
        already_completed: false,
    })
}

fn count_levels(snapshot: &[MasteryEntry]) -> (usize, usize) {
    let mut mastered = 0;
    let mut learned = 0;
    for entry in snapshot {
        match MasteryLevel::from_probability(entry.p_mastery) {
            MasteryLevel::Mastered => mastered += 1,
            MasteryLevel::Learned => learned += 1,
            MasteryLevel::NotMastered => {}
        }
    }
    (mastered, learned)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub async fn select_session(
    tx: &mut Transaction<'_, Postgres>,
    session_id: &str,
) -> Result<Option<SessionRow>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT "id","assessmentId","studentId","courseInstanceId","maxQuestions",
               "currentQuestionCount","status","startedAt","endedAt"
        FROM "diagnostic_sessions"
        WHERE "id" = $1
        "#,
    )
    .bind(session_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(map_session_row))
}

pub async fn select_active_session(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
    course_instance_id: &str,
) -> Result<Option<SessionRow>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT "id","assessmentId","studentId","courseInstanceId","maxQuestions",
               "currentQuestionCount","status","startedAt","endedAt"
        FROM "diagnostic_sessions"
        WHERE "studentId" = $1 AND "courseInstanceId" = $2 AND "status" = $3
        ORDER BY "startedAt" DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(course_instance_id)
    .bind(STATUS_IN_PROGRESS)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(map_session_row))
}

pub async fn select_enrollment(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
    course_instance_id: &str,
) -> Result<Option<EnrollmentRow>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT "id","userId","courseInstanceId","status",("progress")::float8 as "progress"
        FROM "enrollments"
        WHERE "userId" = $1 AND "courseInstanceId" = $2
        "#,
    )
    .bind(user_id)
    .bind(course_instance_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(|row| EnrollmentRow {
        id: row.try_get("id").unwrap_or_default(),
        user_id: row.try_get("userId").unwrap_or_default(),
        course_instance_id: row.try_get("courseInstanceId").unwrap_or_default(),
        status: row.try_get("status").unwrap_or_default(),
        progress: row.try_get::<f64, _>("progress").unwrap_or(0.0),
    }))
}

pub async fn select_course_id(
    tx: &mut Transaction<'_, Postgres>,
    course_instance_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT "courseId" FROM "course_instances" WHERE "id" = $1"#,
    )
    .bind(course_instance_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.and_then(|r| r.try_get::<String, _>("courseId").ok()))
}

async fn select_pending_exercise_id(
    tx: &mut Transaction<'_, Postgres>,
    session_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT "exerciseId"
        FROM "diagnostic_question_logs"
        WHERE "sessionId" = $1 AND "status" = $2
        ORDER BY "askedAt" ASC
        LIMIT 1
        "#,
    )
    .bind(session_id)
    .bind(LOG_ASKED)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.and_then(|r| r.try_get::<String, _>("exerciseId").ok()))
}

async fn select_pending_log_id(
    tx: &mut Transaction<'_, Postgres>,
    session_id: &str,
    exercise_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT "id"
        FROM "diagnostic_question_logs"
        WHERE "sessionId" = $1 AND "exerciseId" = $2 AND "status" = $3
        LIMIT 1
        "#,
    )
    .bind(session_id)
    .bind(exercise_id)
    .bind(LOG_ASKED)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.and_then(|r| r.try_get::<String, _>("id").ok()))
}

async fn insert_question_log(
    tx: &mut Transaction<'_, Postgres>,
    session_id: &str,
    exercise: &ExerciseRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO "diagnostic_question_logs"
          ("id","sessionId","subtopicId","exerciseId","status","askedAt")
        VALUES ($1,$2,$3,$4,$5,$6)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(session_id)
    .bind(&exercise.subtopic_id)
    .bind(&exercise.id)
    .bind(LOG_ASKED)
    .bind(Utc::now().naive_utc())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_attempt(
    tx: &mut Transaction<'_, Postgres>,
    assessment_id: &str,
    enrollment_id: &str,
) -> Result<String, sqlx::Error> {
    let last_attempt_no: Option<i32> = sqlx::query_scalar(
        r#"
        SELECT MAX("attemptNo")
        FROM "assessment_attempts"
        WHERE "assessmentId" = $1 AND "enrollmentId" = $2
        "#,
    )
    .bind(assessment_id)
    .bind(enrollment_id)
    .fetch_one(&mut **tx)
    .await?;

    let attempt_id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO "assessment_attempts"
          ("id","assessmentId","enrollmentId","attemptNo","startedAt")
        VALUES ($1,$2,$3,$4,$5)
        "#,
    )
    .bind(&attempt_id)
    .bind(assessment_id)
    .bind(enrollment_id)
    .bind(last_attempt_no.unwrap_or(0) + 1)
    .bind(Utc::now().naive_utc())
    .execute(&mut **tx)
    .await?;

    Ok(attempt_id)
}

fn map_session_row(row: sqlx::postgres::PgRow) -> SessionRow {
    SessionRow {
        id: row.try_get("id").unwrap_or_default(),
        assessment_id: row.try_get("assessmentId").unwrap_or_default(),
        student_id: row.try_get("studentId").unwrap_or_default(),
        course_instance_id: row.try_get("courseInstanceId").unwrap_or_default(),
        max_questions: row.try_get::<i32, _>("maxQuestions").unwrap_or(DEFAULT_MAX_QUESTIONS),
        current_question_count: row.try_get::<i32, _>("currentQuestionCount").unwrap_or(0),
        status: row
            .try_get("status")
            .unwrap_or_else(|_| STATUS_IN_PROGRESS.to_string()),
        started_at: row
            .try_get("startedAt")
            .unwrap_or_else(|_| Utc::now().naive_utc()),
        ended_at: row.try_get::<Option<chrono::NaiveDateTime>, _>("endedAt").ok().flatten(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(expected: &str) -> ExerciseRow {
        ExerciseRow {
            id: "e1".to_string(),
            subtopic_id: "s1".to_string(),
            statement: "2 + 2".to_string(),
            expression: None,
            instruction: None,
            expected_answer: expected.to_string(),
            difficulty: Some(1),
        }
    }

    #[test]
    fn test_grade_exact_match() {
        let (correct, stored) = grade_answer(
            &exercise("4"),
            &AnswerInput {
                exercise_id: "e1".to_string(),
                user_answer: Some("4".to_string()),
                dont_know: false,
            },
        );
        assert!(correct);
        assert_eq!(stored, "4");
    }

    #[test]
    fn test_grade_trims_and_ignores_case() {
        let (correct, _) = grade_answer(
            &exercise("X + Y"),
            &AnswerInput {
                exercise_id: "e1".to_string(),
                user_answer: Some("  x + y  ".to_string()),
                dont_know: false,
            },
        );
        assert!(correct);
    }

    #[test]
    fn test_grade_dont_know_is_incorrect_with_sentinel() {
        let (correct, stored) = grade_answer(
            &exercise("4"),
            &AnswerInput {
                exercise_id: "e1".to_string(),
                user_answer: Some("4".to_string()),
                dont_know: true,
            },
        );
        assert!(!correct);
        assert_eq!(stored, DONT_KNOW_SENTINEL);
    }

    #[test]
    fn test_grade_missing_answer_is_incorrect() {
        let (correct, stored) = grade_answer(
            &exercise("4"),
            &AnswerInput {
                exercise_id: "e1".to_string(),
                user_answer: None,
                dont_know: false,
            },
        );
        assert!(!correct);
        assert_eq!(stored, "");
    }

    #[test]
    fn test_mastery_level_thresholds() {
        assert_eq!(MasteryLevel::from_probability(0.85), MasteryLevel::Mastered);
        assert_eq!(MasteryLevel::from_probability(0.84), MasteryLevel::Learned);
        assert_eq!(MasteryLevel::from_probability(0.50), MasteryLevel::Learned);
        assert_eq!(MasteryLevel::from_probability(0.49), MasteryLevel::NotMastered);
    }

    #[test]
    fn test_score_floor_marks_completion() {
        assert!((round2(0.0_f64.max(COMPLETED_PROGRESS_FLOOR)) - 0.01).abs() < 1e-9);
        assert!((round2(66.666_f64.max(COMPLETED_PROGRESS_FLOOR)) - 66.67).abs() < 1e-9);
    }
}
