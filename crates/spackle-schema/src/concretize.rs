//! The boundary to the concretizer.
//!
//! Solving abstract constraints is out of scope here; callers plug in a
//! [`Concretizer`]. [`PinnedConcretizer`] accepts only specs that already
//! name a single value for every attribute.

use crate::spec::{AbstractSpec, ConcreteSpec, SpecError};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConcretizeError {
    #[error("unsatisfiable spec '{spec}': {reason}")]
    Unsatisfiable { spec: String, reason: String },
    #[error(transparent)]
    Spec(#[from] SpecError),
}

pub trait Concretizer {
    fn concretize(&self, spec: &AbstractSpec) -> Result<Arc<ConcreteSpec>, ConcretizeError>;
}

/// Freezes fully pinned specs as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct PinnedConcretizer;

impl Concretizer for PinnedConcretizer {
    fn concretize(&self, spec: &AbstractSpec) -> Result<Arc<ConcreteSpec>, ConcretizeError> {
        ConcreteSpec::freeze(spec).map_err(|e| match e {
            SpecError::NotConcrete(reason) => ConcretizeError::Unsatisfiable {
                spec: spec.to_string(),
                reason,
            },
            other => ConcretizeError::Spec(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_spec_concretizes() {
        let spec: AbstractSpec = "zlib@1.3%gcc@13.2".parse().unwrap();
        let concrete = PinnedConcretizer.concretize(&spec).unwrap();
        assert_eq!(concrete.name(), "zlib");
        assert_eq!(concrete.version().as_str(), "1.3");
    }

    #[test]
    fn open_range_is_unsatisfiable() {
        let spec: AbstractSpec = "zlib@1.2:".parse().unwrap();
        let err = PinnedConcretizer.concretize(&spec).unwrap_err();
        assert!(matches!(err, ConcretizeError::Unsatisfiable { .. }));
        assert!(err.to_string().contains("zlib@1.2:"));
    }
}
