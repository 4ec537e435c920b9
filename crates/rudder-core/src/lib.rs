//! Rudder Core - Core types for the release action engine
//!
//! This crate provides the foundational types used throughout Rudder:
//! - `Chart`: The templated bundle (templates, values, sub-charts, CRD files)
//! - `Values`: Configuration values with deep merge support
//! - `Release`: Versioned release record with a closed status type
//! - `Hook`: Lifecycle-bound manifests extracted from a render
//! - `Capabilities`: The cluster's advertised version and API inventory

pub mod capabilities;
pub mod chart;
pub mod context;
pub mod error;
pub mod hook;
pub mod release;
pub mod values;

pub use capabilities::{Capabilities, KubeVersion, VersionSet, is_compatible_range, matches_range};
pub use chart::{Chart, ChartFile, ChartMetadata, CrdObject};
pub use context::{ChartInfo, ReleaseInfo, RenderContext, TemplateInfo};
pub use error::{CoreError, Result};
pub use hook::{Hook, HookDeletePolicy, HookEvent};
pub use release::{Release, ReleaseStatus, validate_release_name};
pub use values::Values;
