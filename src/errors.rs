//! Typed error hierarchy for autoship.
//!
//! One enum per subsystem:
//! - `SandboxError` - workspace provisioning, file I/O and command execution
//! - `PatchError` - patch validation and application
//! - `ProviderError` - the code-generation provider
//! - `HostingError` - the repository hosting service
//! - `WorkflowError` - a session's terminal failure, one variant per `ErrorKind`
//! - `SessionError` - misuse of the session API

use autoship_common::{ErrorKind, SessionId};
use thiserror::Error;

/// Errors from a sandbox backend.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox provisioning failed: {0}")]
    Provision(String),

    #[error("Workspace I/O failed at {path}: {message}")]
    Io { path: String, message: String },

    #[error("Command execution failed: {0}")]
    Exec(String),

    #[error("Command timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Path '{path}' resolves outside the workspace")]
    Escape { path: String },

    #[error("Workspace has already been released")]
    Released,
}

impl SandboxError {
    pub fn io(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn escape(path: impl Into<String>) -> Self {
        Self::Escape { path: path.into() }
    }
}

/// Errors from validating or applying a patch.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Patch contains no changes")]
    Empty,

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Cannot delete '{path}': file does not exist")]
    MissingFile { path: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl PatchError {
    pub fn invalid_path(path: &str, reason: &str) -> Self {
        Self::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors from the code-generation provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider rejected the credential: {0}")]
    Auth(String),

    #[error("Provider rate limit exceeded")]
    RateLimited,

    #[error("Provider request failed: {0}")]
    Request(String),

    #[error("Provider returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Provider response was malformed: {0}")]
    Malformed(String),
}

/// Errors from the hosting service.
#[derive(Debug, Error)]
pub enum HostingError {
    #[error("Hosting service rejected the credential: {0}")]
    Auth(String),

    #[error("Branch already exists: {0}")]
    Conflict(String),

    #[error("Network failure talking to the hosting service: {0}")]
    Network(String),

    #[error("Hosting service returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Hosting service response was malformed: {0}")]
    Malformed(String),
}

impl HostingError {
    /// Only network failures are worth a second attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// The reason a session ended in `Failed`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkflowError {
    #[error("Could not provision a workspace: {0}")]
    Provision(String),

    #[error("Repository analysis failed: {0}")]
    Analysis(String),

    #[error("Patch generation failed: {0}")]
    Generation(String),

    #[error("Patch rejected: {0}")]
    Validation(String),

    #[error("Workspace I/O failed: {0}")]
    Io(String),

    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: &'static str, secs: u64 },

    #[error("Tests failed: {summary}")]
    TestFailure { summary: String },

    #[error("Hosting authentication failed: {0}")]
    Auth(String),

    #[error("Branch conflict: {0}")]
    Conflict(String),

    #[error("Network failure while publishing: {0}")]
    Network(String),

    #[error("Session cancelled")]
    Cancelled,
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provision(_) => ErrorKind::Provision,
            Self::Analysis(_) => ErrorKind::Analysis,
            Self::Generation(_) => ErrorKind::Generation,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Io(_) => ErrorKind::Io,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::TestFailure { .. } => ErrorKind::TestFailure,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Network(_) => ErrorKind::Network,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Map a sandbox failure during `stage`, keeping timeouts distinct.
    pub fn from_sandbox(stage: &'static str, err: SandboxError, fallback: fn(String) -> Self) -> Self {
        match err {
            SandboxError::Timeout { secs } => Self::Timeout { stage, secs },
            other => fallback(other.to_string()),
        }
    }
}

impl From<PatchError> for WorkflowError {
    fn from(err: PatchError) -> Self {
        match err {
            PatchError::Sandbox(SandboxError::Timeout { secs }) => Self::Timeout {
                stage: "Patch application",
                secs,
            },
            PatchError::Sandbox(inner @ SandboxError::Escape { .. }) => Self::Validation(inner.to_string()),
            PatchError::Sandbox(inner) => Self::Io(inner.to_string()),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<ProviderError> for WorkflowError {
    fn from(err: ProviderError) -> Self {
        Self::Generation(err.to_string())
    }
}

impl From<HostingError> for WorkflowError {
    fn from(err: HostingError) -> Self {
        match err {
            HostingError::Auth(msg) => Self::Auth(msg),
            HostingError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Network(other.to_string()),
        }
    }
}

/// Errors from the session API.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {id} not found")]
    NotFound { id: SessionId },

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_error_kinds_cover_taxonomy() {
        let cases = [
            (WorkflowError::Provision("x".into()), ErrorKind::Provision),
            (WorkflowError::Analysis("x".into()), ErrorKind::Analysis),
            (WorkflowError::Generation("x".into()), ErrorKind::Generation),
            (WorkflowError::Validation("x".into()), ErrorKind::Validation),
            (WorkflowError::Io("x".into()), ErrorKind::Io),
            (
                WorkflowError::Timeout {
                    stage: "Testing",
                    secs: 5,
                },
                ErrorKind::Timeout,
            ),
            (
                WorkflowError::TestFailure {
                    summary: "1 failed".into(),
                },
                ErrorKind::TestFailure,
            ),
            (WorkflowError::Auth("x".into()), ErrorKind::Auth),
            (WorkflowError::Conflict("x".into()), ErrorKind::Conflict),
            (WorkflowError::Network("x".into()), ErrorKind::Network),
            (WorkflowError::Cancelled, ErrorKind::Cancelled),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind, "{}", err);
        }
    }

    #[test]
    fn patch_error_validation_maps_to_validation_kind() {
        let err: WorkflowError = PatchError::invalid_path("../etc/passwd", "escapes workspace").into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("../etc/passwd"));

        let err: WorkflowError = PatchError::Empty.into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn patch_error_sandbox_io_maps_to_io_kind() {
        let err: WorkflowError = PatchError::Sandbox(SandboxError::io("a.py", "disk full")).into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn patch_error_sandbox_escape_maps_to_validation_kind() {
        let err: WorkflowError = PatchError::Sandbox(SandboxError::escape("link/x.txt")).into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("link/x.txt"));
    }

    #[test]
    fn patch_error_sandbox_timeout_maps_to_timeout_kind() {
        let err: WorkflowError = PatchError::Sandbox(SandboxError::Timeout { secs: 3 }).into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn hosting_error_mapping() {
        let auth: WorkflowError = HostingError::Auth("bad token".into()).into();
        assert_eq!(auth.kind(), ErrorKind::Auth);
        let conflict: WorkflowError = HostingError::Conflict("auto-x".into()).into();
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        let net: WorkflowError = HostingError::Network("reset".into()).into();
        assert_eq!(net.kind(), ErrorKind::Network);
    }

    #[test]
    fn hosting_error_only_network_is_transient() {
        assert!(HostingError::Network("reset".into()).is_transient());
        assert!(!HostingError::Auth("no".into()).is_transient());
        assert!(!HostingError::Conflict("b".into()).is_transient());
        assert!(
            !HostingError::Api {
                status: 404,
                message: "nope".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn provider_error_maps_to_generation() {
        let err: WorkflowError = ProviderError::RateLimited.into();
        assert_eq!(err.kind(), ErrorKind::Generation);
    }

    #[test]
    fn from_sandbox_keeps_timeouts_distinct() {
        let err = WorkflowError::from_sandbox(
            "Analysis",
            SandboxError::Timeout { secs: 9 },
            WorkflowError::Analysis,
        );
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("9s"));

        let err = WorkflowError::from_sandbox(
            "Analysis",
            SandboxError::Exec("sh missing".into()),
            WorkflowError::Analysis,
        );
        assert_eq!(err.kind(), ErrorKind::Analysis);
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SandboxError::Released);
        assert_std_error(&PatchError::Empty);
        assert_std_error(&ProviderError::RateLimited);
        assert_std_error(&HostingError::Network("x".into()));
        assert_std_error(&WorkflowError::Cancelled);
        assert_std_error(&SessionError::InvalidConfig("x".into()));
    }
}
