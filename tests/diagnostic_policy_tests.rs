//! Pure walk-through of the adaptive policy over a three-topic chain
//! (A, then B requiring A, then C requiring B), mirroring the arithmetic the
//! session controller applies per answer.

use std::collections::HashMap;

use aula_backend_rust::kst::bkt;
use aula_backend_rust::kst::ledger::MasteryEntry;
use aula_backend_rust::kst::selection;

struct Chain {
    probabilities: HashMap<&'static str, f64>,
}

impl Chain {
    fn new() -> Self {
        let mut probabilities = HashMap::new();
        for id in ["a", "b", "c"] {
            probabilities.insert(id, bkt::P_INITIAL);
        }
        Self { probabilities }
    }

    fn prerequisites(id: &str) -> Vec<String> {
        match id {
            "b" => vec!["a".to_string()],
            "c" => vec!["b".to_string()],
            _ => Vec::new(),
        }
    }

    fn dependents(id: &str) -> Vec<&'static str> {
        match id {
            "a" => vec!["b"],
            "b" => vec!["c"],
            _ => Vec::new(),
        }
    }

    fn answer(&mut self, id: &'static str, is_correct: bool) {
        let p_old = self.probabilities[id];
        self.probabilities.insert(id, bkt::posterior(p_old, is_correct));

        if is_correct {
            for prerequisite in Self::prerequisites(id) {
                let p = self.probabilities[prerequisite.as_str()];
                self.probabilities
                    .insert(Self::intern(&prerequisite), bkt::credit_prerequisite(p));
            }
        } else {
            for dependent in Self::dependents(id) {
                let p = self.probabilities[dependent];
                self.probabilities.insert(dependent, bkt::penalize_dependent(p));
            }
        }
    }

    fn intern(id: &str) -> &'static str {
        match id {
            "a" => "a",
            "b" => "b",
            _ => "c",
        }
    }

    fn snapshot(&self) -> Vec<MasteryEntry> {
        let mut entries: Vec<MasteryEntry> = self
            .probabilities
            .iter()
            .map(|(id, p)| MasteryEntry {
                subtopic_id: id.to_string(),
                p_mastery: *p,
            })
            .collect();
        entries.sort_by(|x, y| x.subtopic_id.cmp(&y.subtopic_id));
        entries
    }
}

#[test]
fn test_chain_scenario_correct_correct_incorrect() {
    let mut chain = Chain::new();

    chain.answer("a", true);
    assert!((chain.probabilities["a"] - 0.8182).abs() < 0.001);

    chain.answer("b", true);
    // B gets its own posterior; A gets the prerequisite credit on top.
    assert!((chain.probabilities["b"] - 0.8182).abs() < 0.001);
    assert!((chain.probabilities["a"] - 0.8682).abs() < 0.001);
    assert!(chain.probabilities["a"] > 0.8);

    chain.answer("c", false);
    assert!((chain.probabilities["c"] - 0.1111).abs() < 0.001);
    // Nothing depends on C, so B keeps the estimate earned by its own answer.
    assert!((chain.probabilities["b"] - 0.8182).abs() < 0.001);
}

#[test]
fn test_incorrect_answer_discredits_dependents() {
    let mut chain = Chain::new();

    chain.answer("b", false);
    assert!((chain.probabilities["b"] - 0.1111).abs() < 0.001);
    // C depends on B and loses the fixed penalty.
    assert!((chain.probabilities["c"] - 0.4).abs() < 0.001);
    // A is a prerequisite of B, not a dependent; it is untouched.
    assert!((chain.probabilities["a"] - 0.5).abs() < 0.001);
}

#[test]
fn test_penalty_floors_at_minimum() {
    let mut chain = Chain::new();

    for _ in 0..10 {
        chain.answer("b", false);
    }
    assert!(chain.probabilities["c"] >= bkt::PROPAGATION_FLOOR - 1e-9);
    assert!(chain.probabilities["b"] >= bkt::P_MIN);
}

#[test]
fn test_selection_follows_the_frontier() {
    let mut chain = Chain::new();

    // Initially only A is assessable: B and C are gated by unmastered
    // prerequisites.
    let ranked = selection::rank_candidates(&chain.snapshot(), |id| Chain::prerequisites(id));
    assert_eq!(ranked, vec!["a"]);

    // Push A over the assessment bar; B unlocks, C stays gated.
    chain.answer("a", true);
    chain.answer("a", true);
    assert!(chain.probabilities["a"] > selection::ASSESSMENT_THRESHOLD);

    let ranked = selection::rank_candidates(&chain.snapshot(), |id| Chain::prerequisites(id));
    assert_eq!(ranked, vec!["b"]);
}

#[test]
fn test_fully_mastered_chain_has_no_candidates() {
    let mut chain = Chain::new();
    for id in ["a", "b", "c"] {
        chain.answer(id, true);
        chain.answer(id, true);
    }
    let ranked = selection::rank_candidates(&chain.snapshot(), |id| Chain::prerequisites(id));
    assert!(ranked.is_empty());
}
