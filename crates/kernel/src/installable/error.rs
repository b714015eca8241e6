//! Installer error types with clear, actionable messages.
//!
//! Errors name the entity and, where relevant, the context and site in which
//! something went wrong so an operator can retry or remediate by hand.

use std::fmt;

use thiserror::Error;

use super::context::Context;
use super::SiteId;
use super::routine::Stage;

/// Errors that can occur while installing, updating or uninstalling.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Entity kind outside `plugin`, `component`, `module`.
    #[error("invalid entity kind '{kind}'. Valid kinds: plugin, component, module")]
    InvalidEntityKind { kind: String },

    /// A version string could not be parsed.
    #[error("invalid version '{version}': {details}")]
    InvalidVersion { version: String, details: String },

    /// A context or context shortcut name could not be parsed.
    #[error("unknown context '{context}'. Valid contexts: {valid}")]
    UnknownContext { context: String, valid: String },

    /// A site id that does not exist on the current network.
    #[error("site {site} does not exist on the current network")]
    InvalidSiteId { site: SiteId },

    /// A `before_*` or `after_*` lifecycle hook failed.
    #[error("{entity}: {hook} hook failed: {source}")]
    Hook {
        entity: String,
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// One or more routines failed. Completed work is not rolled back.
    #[error("{entity}: {} routine(s) failed: {}", .failures.len(), summarize(.failures))]
    RoutinesFailed {
        entity: String,
        failures: Vec<RoutineFailure>,
    },

    /// Reading or writing host state failed.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Result type alias using InstallError.
pub type InstallResult<T> = Result<T, InstallError>;

/// A single routine failure, recorded per context (and per site).
#[derive(Debug)]
pub struct RoutineFailure {
    pub stage: Stage,
    pub context: Context,
    pub site: Option<SiteId>,
    pub routine: String,
    pub error: anyhow::Error,
}

impl fmt::Display for RoutineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}, {}", self.routine, self.stage, self.context)?;
        if let Some(site) = self.site {
            write!(f, ", site {site}")?;
        }
        write!(f, "]: {:#}", self.error)
    }
}

fn summarize(failures: &[RoutineFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl InstallError {
    /// Create an invalid version error.
    pub fn invalid_version(version: impl Into<String>, details: impl Into<String>) -> Self {
        Self::InvalidVersion {
            version: version.into(),
            details: details.into(),
        }
    }

    /// Create an unknown context error.
    pub fn unknown_context(context: impl Into<String>, valid: &[&str]) -> Self {
        Self::UnknownContext {
            context: context.into(),
            valid: valid.join(", "),
        }
    }

    /// Create a hook failure error.
    pub fn hook(entity: impl Into<String>, hook: &'static str, source: anyhow::Error) -> Self {
        Self::Hook {
            entity: entity.into(),
            hook,
            source,
        }
    }
}
