//! Content-quality evaluation: criteria configuration and the engine that
//! turns raw evaluator output into a pass/fail verdict on the state.

pub mod criteria;
pub mod engine;

pub use criteria::{CriteriaConfig, CriteriaLoader, Criterion};
pub use engine::{EvaluationEngine, EvaluationError};
