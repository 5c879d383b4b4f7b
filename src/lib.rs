//! # decoration-rs: sidecar injection controller for GroupSet workloads
//!
//! This library implements the decoration decision engine: Decoration
//! resources declare sidecar containers, volumes, scheduling constraints and
//! metadata to merge into pods selected by label, phased across the matched
//! population by revision-tracked rolling updates, with at most one effective
//! Decoration per group.

pub mod config;
pub mod error;
pub mod operator;

pub use config::OperatorConfig;
pub use error::{Error, Result};
pub use operator::{Decoration, GroupSet, StrategyCache};
