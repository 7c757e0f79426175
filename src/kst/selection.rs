//! Adaptive selection policy: which subtopic to probe next, and with which
//! exercise.
//!
//! Candidate subtopics sit on the learning frontier and are ranked by how
//! close their mastery estimate is to the target difficulty, the region
//! where one answer carries the most information. The final pick among the
//! best candidates is uniformly random so the question order is not
//! deterministic across students.

use std::collections::HashSet;

use rand::Rng;
use sqlx::{Postgres, Row, Transaction};

use crate::kst::ledger::MasteryEntry;

/// Mastery bar used both to exclude a topic from assessment and to treat it
/// as satisfied when checking its dependents' prerequisites.
pub const ASSESSMENT_THRESHOLD: f64 = 0.85;
/// The estimate a candidate should be closest to: roughly a 50-60% chance of
/// a correct answer, where the update is most informative.
pub const TARGET_DIFFICULTY: f64 = 0.7;
/// Best-ranked candidates kept before the random tie-break.
pub const CANDIDATE_POOL_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct ExerciseRow {
    pub id: String,
    pub subtopic_id: String,
    pub statement: String,
    pub expression: Option<String>,
    pub instruction: Option<String>,
    pub expected_answer: String,
    pub difficulty: Option<i32>,
}

/// Frontier filter plus ranking by distance to the target difficulty.
/// Returns at most `CANDIDATE_POOL_SIZE` subtopic ids, best first.
pub fn rank_candidates<F>(snapshot: &[MasteryEntry], prerequisites_of: F) -> Vec<String>
where
    F: Fn(&str) -> Vec<String>,
{
    let unmastered: HashSet<&str> = snapshot
        .iter()
        .filter(|e| e.p_mastery <= ASSESSMENT_THRESHOLD)
        .map(|e| e.subtopic_id.as_str())
        .collect();

    let mut candidates: Vec<(&MasteryEntry, f64)> = snapshot
        .iter()
        .filter(|e| e.p_mastery <= ASSESSMENT_THRESHOLD)
        .filter(|e| {
            prerequisites_of(&e.subtopic_id)
                .iter()
                .all(|p| !unmastered.contains(p.as_str()))
        })
        .map(|e| (e, (e.p_mastery - TARGET_DIFFICULTY).abs()))
        .collect();

    candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    candidates
        .into_iter()
        .take(CANDIDATE_POOL_SIZE)
        .map(|(e, _)| e.subtopic_id.clone())
        .collect()
}

/// Uniform pick among the ranked pool.
pub fn pick_candidate(candidates: &[String]) -> Option<&str> {
    if candidates.is_empty() {
        return None;
    }
    let index = rand::rng().random_range(0..candidates.len());
    Some(candidates[index].as_str())
}

/// Random active exercise of the given subtopic that belongs to the
/// assessment's allowed pool and has not been answered in this session.
pub async fn select_exercise_for_subtopic(
    tx: &mut Transaction<'_, Postgres>,
    session_id: &str,
    assessment_id: &str,
    subtopic_id: &str,
) -> Result<Option<ExerciseRow>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT e."id", e."subtopicId", e."statement", e."expression", e."instruction",
               e."expectedAnswer", e."difficulty"
        FROM "exercises" e
        JOIN "assessment_exercises" ae ON ae."exerciseId" = e."id"
        WHERE ae."assessmentId" = $1
          AND e."subtopicId" = $2
          AND e."isActive" = TRUE
          AND e."id" NOT IN (
            SELECT "exerciseId" FROM "diagnostic_question_logs"
            WHERE "sessionId" = $3 AND "status" = 'ANSWERED'
          )
        ORDER BY RANDOM()
        LIMIT 1
        "#,
    )
    .bind(assessment_id)
    .bind(subtopic_id)
    .bind(session_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(map_exercise_row))
}

/// Fallback pool: any allowed, active, unanswered exercise regardless of
/// subtopic targeting. Keeps the session moving when the chosen subtopic has
/// no material left.
pub async fn select_fallback_exercise(
    tx: &mut Transaction<'_, Postgres>,
    session_id: &str,
    assessment_id: &str,
) -> Result<Option<ExerciseRow>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT e."id", e."subtopicId", e."statement", e."expression", e."instruction",
               e."expectedAnswer", e."difficulty"
        FROM "exercises" e
        JOIN "assessment_exercises" ae ON ae."exerciseId" = e."id"
        WHERE ae."assessmentId" = $1
          AND e."isActive" = TRUE
          AND e."id" NOT IN (
            SELECT "exerciseId" FROM "diagnostic_question_logs"
            WHERE "sessionId" = $2 AND "status" = 'ANSWERED'
          )
        ORDER BY RANDOM()
        LIMIT 1
        "#,
    )
    .bind(assessment_id)
    .bind(session_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(map_exercise_row))
}

pub async fn select_exercise_by_id(
    tx: &mut Transaction<'_, Postgres>,
    exercise_id: &str,
) -> Result<Option<ExerciseRow>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT "id", "subtopicId", "statement", "expression", "instruction",
               "expectedAnswer", "difficulty"
        FROM "exercises"
        WHERE "id" = $1
        "#,
    )
    .bind(exercise_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(map_exercise_row))
}

fn map_exercise_row(row: sqlx::postgres::PgRow) -> ExerciseRow {
    ExerciseRow {
        id: row.try_get("id").unwrap_or_default(),
        subtopic_id: row.try_get("subtopicId").unwrap_or_default(),
        statement: row.try_get("statement").unwrap_or_default(),
        expression: row.try_get::<Option<String>, _>("expression").ok().flatten(),
        instruction: row.try_get::<Option<String>, _>("instruction").ok().flatten(),
        expected_answer: row.try_get("expectedAnswer").unwrap_or_default(),
        difficulty: row.try_get::<Option<i32>, _>("difficulty").ok().flatten(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, p: f64) -> MasteryEntry {
        MasteryEntry {
            subtopic_id: id.to_string(),
            p_mastery: p,
        }
    }

    #[test]
    fn test_rank_orders_by_distance_to_target() {
        let snapshot = vec![entry("far", 0.2), entry("near", 0.65), entry("exact", 0.7)];
        let ranked = rank_candidates(&snapshot, |_| Vec::new());
        assert_eq!(ranked, vec!["exact", "near", "far"]);
    }

    #[test]
    fn test_rank_excludes_mastered_topics() {
        let snapshot = vec![entry("done", 0.9), entry("open", 0.5)];
        let ranked = rank_candidates(&snapshot, |_| Vec::new());
        assert_eq!(ranked, vec!["open"]);
    }

    #[test]
    fn test_rank_excludes_gated_topics() {
        let snapshot = vec![entry("base", 0.5), entry("next", 0.7)];
        let ranked = rank_candidates(&snapshot, |id| {
            if id == "next" {
                vec!["base".to_string()]
            } else {
                Vec::new()
            }
        });
        // "next" sits exactly on the target but its prerequisite is unmastered.
        assert_eq!(ranked, vec!["base"]);
    }

    #[test]
    fn test_rank_admits_topic_once_prerequisite_mastered() {
        let snapshot = vec![entry("base", 0.9), entry("next", 0.7)];
        let ranked = rank_candidates(&snapshot, |id| {
            if id == "next" {
                vec!["base".to_string()]
            } else {
                Vec::new()
            }
        });
        assert_eq!(ranked, vec!["next"]);
    }

    #[test]
    fn test_rank_caps_pool_size() {
        let snapshot: Vec<MasteryEntry> = (0..25)
            .map(|i| entry(&format!("s{i}"), 0.3 + (i as f64) * 0.02))
            .collect();
        let ranked = rank_candidates(&snapshot, |_| Vec::new());
        assert_eq!(ranked.len(), CANDIDATE_POOL_SIZE);
    }

    #[test]
    fn test_pick_candidate_stays_in_pool() {
        let pool: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        for _ in 0..50 {
            let picked = pick_candidate(&pool).unwrap();
            assert!(pool.iter().any(|id| id == picked));
        }
        assert!(pick_candidate(&[]).is_none());
    }
}
