//! Write-time invariants for Decoration objects.
//!
//! The webhook transport lives outside this crate; the validating endpoint
//! calls into these functions and turns the error into an admission denial.

use kube::ResourceExt;
use thiserror::Error;

use super::crd::Decoration;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("injectStrategy.group must not be empty")]
    EmptyGroup,

    #[error("injectStrategy.weight is required: group {group:?} is shared with decoration {other:?}")]
    WeightRequired { group: String, other: String },
}

/// Validates a Decoration against the other Decorations of its namespace.
/// Priority within a shared group is undefined without a weight, so sharing
/// requires one.
pub fn validate_decoration(
    decoration: &Decoration,
    namespace_decorations: &[Decoration],
) -> Result<(), ValidationError> {
    let group = decoration.group();
    if group.is_empty() {
        return Err(ValidationError::EmptyGroup);
    }
    if decoration.spec.inject_strategy.weight.is_some() {
        return Ok(());
    }
    let name = decoration.name_any();
    if let Some(other) = namespace_decorations
        .iter()
        .find(|d| d.name_any() != name && d.group() == group)
    {
        return Err(ValidationError::WeightRequired {
            group: group.to_string(),
            other: other.name_any(),
        });
    }
    Ok(())
}
