//! Installable entities and their versioned install lifecycle.
//!
//! This module provides:
//! - Version parsing and comparison
//! - Context shortcut expansion and activation modes
//! - Install/uninstall routine composition from declared resources
//! - A registry of declared updates
//! - Persisted install state and site membership
//! - The [`UnInstaller`] engine that runs it all

pub mod composer;
pub mod context;
pub mod engine;
pub mod entity;
pub mod error;
mod membership;
pub mod registry;
pub mod routine;
pub mod version;

pub use crate::host::SiteId;
pub use composer::{CapsSource, InstallDeclarations, InstallPlan, UninstallPlan};
pub use context::{ActivationMode, Context, ContextKey};
pub use engine::{
    EngineOptions, Lifecycle, LifecycleContext, NoopLifecycle, RunReport, Step, UnInstaller,
};
pub use entity::{EntityKind, Installable};
pub use error::{InstallError, InstallResult, RoutineFailure};
pub use registry::{Applicability, DeclaredUpdate, UpdateRegistry};
pub use routine::{Routine, RoutineContext, Stage};
pub use version::Version;
