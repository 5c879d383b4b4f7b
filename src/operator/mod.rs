//! Decoration decision engine.
//!
//! Revision-tracked, group-exclusive, partially rolled-out selection of which
//! decoration revisions apply to which pod. The controller here keeps the
//! strategy cache warm; pod admission and workload reconcilers read it
//! through [`strategy::StrategyCache::effective_revisions`] and apply the
//! result with [`patch::patch_pod`].

pub mod admission;
pub mod anno;
pub mod controller;
pub mod crd;
pub mod expectations;
pub mod group;
pub mod patch;
pub mod revision;
pub mod selector;
pub mod strategy;

#[cfg(test)]
pub(crate) mod testutil;

pub use controller::{run_decoration_controller, Context};
pub use crd::{Decoration, DecorationSpec, DecorationStatus, GroupSet};
pub use strategy::StrategyCache;
