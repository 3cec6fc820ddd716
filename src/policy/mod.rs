//! The Policy Engine (C4): a declarative, ordered rule evaluator computing
//! the volume → policy-set assignment set from a rule document and the
//! current inventory.

pub mod engine;
pub mod rules;

pub use engine::{evaluate, Decision, Exclusion, VolumeContext};
pub use rules::{Rule, RuleSet};
