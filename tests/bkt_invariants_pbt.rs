//! Property-based tests for the Bayesian update rules.
//!
//! Invariants:
//! - Every probability stays inside [0.01, 0.99] after any sequence of
//!   responses, with propagation deltas interleaved arbitrarily.
//! - Correct answers never lower an estimate; incorrect answers never raise it.
//! - The candidate ranking never admits a topic with an unmastered prerequisite.

use proptest::prelude::*;

use aula_backend_rust::kst::bkt;
use aula_backend_rust::kst::ledger::MasteryEntry;
use aula_backend_rust::kst::selection;

fn arb_probability() -> impl Strategy<Value = f64> {
    (10u64..=990u64).prop_map(|v| v as f64 / 1000.0)
}

#[derive(Debug, Clone)]
enum Step {
    Answer(bool),
    Credit,
    Penalize,
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        any::<bool>().prop_map(Step::Answer),
        Just(Step::Credit),
        Just(Step::Penalize),
    ]
}

proptest! {
    #[test]
    fn prop_probability_stays_in_range(
        start in arb_probability(),
        steps in proptest::collection::vec(arb_step(), 0..200),
    ) {
        let mut p = start;
        for step in steps {
            p = match step {
                Step::Answer(is_correct) => bkt::posterior(p, is_correct),
                Step::Credit => bkt::credit_prerequisite(p),
                Step::Penalize => bkt::penalize_dependent(p),
            };
            prop_assert!(p >= bkt::P_MIN && p <= bkt::P_MAX, "p escaped range: {p}");
        }
    }

    #[test]
    fn prop_correct_never_lowers_estimate(p in arb_probability()) {
        prop_assert!(bkt::posterior(p, true) >= p - 1e-9);
    }

    #[test]
    fn prop_incorrect_never_raises_estimate(p in arb_probability()) {
        prop_assert!(bkt::posterior(p, false) <= p + 1e-9);
    }

    #[test]
    fn prop_frontier_never_admits_gated_topic(
        p_base in arb_probability(),
        p_next in arb_probability(),
    ) {
        let snapshot = vec![
            MasteryEntry { subtopic_id: "base".to_string(), p_mastery: p_base },
            MasteryEntry { subtopic_id: "next".to_string(), p_mastery: p_next },
        ];
        let ranked = selection::rank_candidates(&snapshot, |id| {
            if id == "next" { vec!["base".to_string()] } else { Vec::new() }
        });

        if p_base <= selection::ASSESSMENT_THRESHOLD {
            prop_assert!(!ranked.iter().any(|id| id == "next"));
        }
    }
}
