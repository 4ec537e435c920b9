//! Rudder Engine - chart rendering
//!
//! This crate provides the `Renderer` seam used by the release actions and a
//! MiniJinja-based implementation of it with:
//! - Kubernetes-specific filters (toyaml, b64encode, nindent, etc.)
//! - Sub-chart rendering with scoped values
//! - An optional cluster `lookup` function
//! - Source-mapped template errors

pub mod engine;
pub mod error;
pub mod filters;

pub use engine::{Engine, EngineBuilder, Lookup, NoLookup, Renderer};
pub use error::{EngineError, Result, TemplateError, TemplateErrorKind};
