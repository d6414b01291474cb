//! Rudder Core - release data model and render-time logic
//!
//! This crate has no cluster access. It provides:
//! - `Release`: one revision of a named release and its status machine
//! - `Hook`: lifecycle hooks parsed from manifest annotations
//! - `Chart` and `Values`: what a release was rendered from
//! - `manifest`: splitting, hook extraction and install-order sorting
//! - `Renderer` and `Clock`: collaborators injected into the engine

pub mod chart;
pub mod clock;
pub mod error;
pub mod hook;
pub mod manifest;
pub mod release;
pub mod render;
pub mod values;

pub use chart::{Chart, ChartMetadata, Template};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, Result};
pub use hook::{
    Hook, HookDeletePolicy, HookEvent, HookExecution, HookOutputLogPolicy, HookPhase,
    execution_order,
};
pub use manifest::{InstallOrder, Manifest, SortedManifests, join_manifests, sort_manifests, split_documents};
pub use release::{Info, Release, Status};
pub use render::{PassthroughRenderer, Renderer};
pub use values::Values;
