//! Adaptive diagnostic engine (knowledge space theory): knowledge graph,
//! per-session mastery ledger, selection policy, Bayesian update rules and
//! the session lifecycle that ties them together.

pub mod bkt;
pub mod graph;
pub mod ledger;
pub mod selection;
pub mod session;
