//! Condition Engines
//!
//! Pure functions turning observed state into status conditions. The
//! controllers feed them what they read from listers and write the result
//! back with the upsert semantics of [`crate::crd::set_condition`].

pub mod pruner;
pub mod registry;

pub use pruner::{evaluate_pruner, PrunerEvaluation, PrunerInputs};
pub use registry::{evaluate_registry, unavailable_recheck, RegistryConditions, RegistryInputs};
