//! Per-session mastery ledger: one probability row per (session, subtopic).
//!
//! Every operation runs on the caller's transaction so ledger writes commit
//! or roll back together with the question log and session counters.

use sqlx::{Postgres, QueryBuilder, Row, Transaction};

use crate::kst::bkt;

#[derive(Debug, Clone)]
pub struct MasteryEntry {
    pub subtopic_id: String,
    pub p_mastery: f64,
}

/// Bulk-create one entry per subtopic at the uniform prior. Runs inside the
/// caller's transaction, so a partial initialization is never observable.
pub async fn initialize(
    tx: &mut Transaction<'_, Postgres>,
    session_id: &str,
    subtopic_ids: &[String],
) -> Result<(), sqlx::Error> {
    if subtopic_ids.is_empty() {
        return Ok(());
    }

    let mut qb = QueryBuilder::<Postgres>::new(
        r#"INSERT INTO "diagnostic_probabilities" ("sessionId","subtopicId","pMastery") "#,
    );
    qb.push_values(subtopic_ids, |mut row, subtopic_id| {
        row.push_bind(session_id)
            .push_bind(subtopic_id)
            .push_bind(bkt::P_INITIAL);
    });
    qb.build().execute(&mut **tx).await?;
    Ok(())
}

pub async fn get(
    tx: &mut Transaction<'_, Postgres>,
    session_id: &str,
    subtopic_id: &str,
) -> Result<Option<f64>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT ("pMastery")::float8 as "pMastery"
        FROM "diagnostic_probabilities"
        WHERE "sessionId" = $1 AND "subtopicId" = $2
        "#,
    )
    .bind(session_id)
    .bind(subtopic_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.and_then(|r| r.try_get::<f64, _>("pMastery").ok()))
}

/// Stores a probability, clamped to the engine's working range first.
pub async fn set(
    tx: &mut Transaction<'_, Postgres>,
    session_id: &str,
    subtopic_id: &str,
    p: f64,
) -> Result<(), sqlx::Error> {
    let clamped = bkt::clamp_probability(p);
    sqlx::query(
        r#"
        UPDATE "diagnostic_probabilities"
        SET "pMastery" = $1
        WHERE "sessionId" = $2 AND "subtopicId" = $3
        "#,
    )
    .bind(clamped)
    .bind(session_id)
    .bind(subtopic_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn snapshot(
    tx: &mut Transaction<'_, Postgres>,
    session_id: &str,
) -> Result<Vec<MasteryEntry>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT "subtopicId", ("pMastery")::float8 as "pMastery"
        FROM "diagnostic_probabilities"
        WHERE "sessionId" = $1
        ORDER BY "subtopicId"
        "#,
    )
    .bind(session_id)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| MasteryEntry {
            subtopic_id: row.try_get("subtopicId").unwrap_or_default(),
            p_mastery: row.try_get::<f64, _>("pMastery").unwrap_or(bkt::P_INITIAL),
        })
        .collect())
}

/// Raises every prerequisite of the answered subtopic, capped so propagation
/// alone can never mark a topic mastered.
pub async fn credit_prerequisites(
    tx: &mut Transaction<'_, Postgres>,
    session_id: &str,
    subtopic_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE "diagnostic_probabilities"
        SET "pMastery" = LEAST("pMastery" + $3, $4)
        WHERE "sessionId" = $1
          AND "subtopicId" IN (
            SELECT "prerequisiteId" FROM "subtopic_dependencies" WHERE "subtopicId" = $2
          )
        "#,
    )
    .bind(session_id)
    .bind(subtopic_id)
    .bind(bkt::PREREQUISITE_CREDIT)
    .bind(bkt::PROPAGATION_CEILING)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

/// Lowers every subtopic that depends on the one answered incorrectly.
pub async fn penalize_dependents(
    tx: &mut Transaction<'_, Postgres>,
    session_id: &str,
    subtopic_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE "diagnostic_probabilities"
        SET "pMastery" = GREATEST("pMastery" - $3, $4)
        WHERE "sessionId" = $1
          AND "subtopicId" IN (
            SELECT "subtopicId" FROM "subtopic_dependencies" WHERE "prerequisiteId" = $2
          )
        "#,
    )
    .bind(session_id)
    .bind(subtopic_id)
    .bind(bkt::DEPENDENT_PENALTY)
    .bind(bkt::PROPAGATION_FLOOR)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}
