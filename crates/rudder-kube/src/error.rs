//! Error types for rudder-kube

use thiserror::Error;

/// Result type for rudder-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur during release operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Cluster could not be reached
    #[error("cluster unreachable: {0}")]
    Connection(String),

    #[error("release '{name}' not found")]
    ReleaseNotFound { name: String },

    #[error("release '{key}' already exists")]
    ReleaseAlreadyExists { key: String },

    /// A revision of this release is still pending
    #[error("another operation (install/upgrade/rollback) is in progress for release '{name}': {status}")]
    OperationInProgress { name: String, status: String },

    #[error("invalid release name '{name}': {reason}")]
    InvalidReleaseName { name: String, reason: String },

    #[error("release '{name}' is already uninstalled")]
    AlreadyUninstalled { name: String },

    #[error("cannot rollback release '{name}': {reason}")]
    RollbackNotPossible { name: String, reason: String },

    #[error("hook '{hook_name}' failed during {event}: {source}")]
    HookFailed {
        hook_name: String,
        event: String,
        #[source]
        source: Box<KubeError>,
    },

    /// Readiness or absence was not confirmed in time
    #[error("timed out after {timeout} waiting for {}", .pending.join(", "))]
    WaitTimeout { timeout: String, pending: Vec<String> },

    #[error("operation cancelled")]
    Cancelled,

    /// The engine itself broke, e.g. a task panicked
    #[error("internal error: {0}")]
    Internal(String),

    /// A resource reached a state it cannot recover from
    #[error("{resource} failed: {message}")]
    ResourceFailed { resource: String, message: String },

    /// Several independent failures
    #[error("{}", join_messages(.0))]
    Joined(Vec<KubeError>),

    /// User-visible failure of an orchestrated operation
    #[error("release '{name}' failed during {phase}: {source}")]
    ReleaseFailed {
        name: String,
        phase: String,
        #[source]
        source: Box<KubeError>,
    },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// The manifest parsed but contained no objects
    #[error("no objects visited")]
    NoObjectsVisited,

    #[error("unknown resource kind {kind} in {api_version}")]
    UnknownKind { api_version: String, kind: String },

    /// Live object exists but is not owned by this release
    #[error("{resource} exists and cannot be imported into the current release: {reason}")]
    ResourceConflict { resource: String, reason: String },

    /// Three-way merge patch would change an identifying field
    #[error("precondition failed for {resource}: {field} may not change")]
    PreconditionFailed { resource: String, field: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Core(#[from] rudder_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_messages(errors: &[KubeError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl KubeError {
    fn api_code(&self) -> Option<u16> {
        match self {
            KubeError::Api(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Check if this is a conflict error (409)
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Create of an object that already exists (409 `AlreadyExists`)
    pub fn is_already_exists(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 409 && resp.reason == "AlreadyExists")
    }

    /// Optimistic-lock conflict worth retrying
    pub fn is_write_conflict(&self) -> bool {
        self.is_conflict() && !self.is_already_exists()
    }

    /// Invalid object or immutable field (422)
    pub fn is_invalid(&self) -> bool {
        self.api_code() == Some(422)
    }

    /// A wait ran out of time, possibly inside a hook or release failure
    pub fn is_timeout(&self) -> bool {
        match self {
            KubeError::WaitTimeout { .. } => true,
            KubeError::HookFailed { source, .. } | KubeError::ReleaseFailed { source, .. } => {
                source.is_timeout()
            }
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            KubeError::Cancelled => true,
            KubeError::ReleaseFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Failures that are worth another poll: connectivity and server-side 5xx
    pub fn is_transient(&self) -> bool {
        match self {
            KubeError::Connection(_) => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            KubeError::Api(_) => true,
            _ => false,
        }
    }

    /// Join errors; `None` when there are none, the error itself when there is one
    pub fn join(errors: Vec<KubeError>) -> Option<KubeError> {
        let mut flat = Vec::with_capacity(errors.len());
        for e in errors {
            match e {
                KubeError::Joined(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(KubeError::Joined(flat)),
        }
    }

    /// Attach the release name and failed phase
    pub fn in_release(self, name: &str, phase: &str) -> KubeError {
        match self {
            already @ KubeError::ReleaseFailed { .. } => already,
            other => KubeError::ReleaseFailed {
                name: name.to_string(),
                phase: phase.to_string(),
                source: Box::new(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api(code: u16, reason: &str) -> KubeError {
        KubeError::Api(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} error", reason),
            reason: reason.into(),
            code,
        }))
    }

    #[test]
    fn test_classification() {
        assert!(api(404, "NotFound").is_not_found());
        assert!(api(409, "Conflict").is_conflict());
        assert!(api(409, "Conflict").is_write_conflict());
        assert!(api(409, "AlreadyExists").is_already_exists());
        assert!(!api(409, "AlreadyExists").is_write_conflict());
        assert!(api(422, "Invalid").is_invalid());
        assert!(api(503, "ServiceUnavailable").is_transient());
        assert!(!api(404, "NotFound").is_transient());
        assert!(KubeError::Connection("refused".into()).is_transient());
    }

    #[test]
    fn test_join_flattens() {
        assert!(KubeError::join(vec![]).is_none());

        let single = KubeError::join(vec![KubeError::Cancelled]).unwrap();
        assert!(matches!(single, KubeError::Cancelled));

        let nested = KubeError::Joined(vec![
            KubeError::Storage("a".into()),
            KubeError::Storage("b".into()),
        ]);
        let joined = KubeError::join(vec![nested, KubeError::Storage("c".into())]).unwrap();
        match &joined {
            KubeError::Joined(all) => assert_eq!(all.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            joined.to_string(),
            "storage error: a; storage error: b; storage error: c"
        );
    }

    #[test]
    fn test_in_release_names_release_and_phase() {
        let err = KubeError::Storage("boom".into()).in_release("r1", "upgrade");
        assert_eq!(
            err.to_string(),
            "release 'r1' failed during upgrade: storage error: boom"
        );

        // Wrapping twice keeps the innermost context
        let again = err.in_release("r1", "rollback");
        assert!(again.to_string().contains("during upgrade"));
    }

    #[test]
    fn test_cancelled_through_wrapper() {
        let err = KubeError::Cancelled.in_release("r1", "upgrade");
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_timeout_through_wrappers() {
        let timeout = KubeError::WaitTimeout {
            timeout: "1s".into(),
            pending: vec!["default/Job/migrate".into()],
        };
        let hook = KubeError::HookFailed {
            hook_name: "migrate".into(),
            event: "post-install".into(),
            source: Box::new(timeout),
        };
        assert!(hook.is_timeout());

        let wrapped = hook.in_release("r1", "install");
        assert!(wrapped.is_timeout());
        assert!(!wrapped.is_cancelled());
        assert!(!KubeError::Storage("boom".into()).in_release("r1", "install").is_timeout());
    }

    #[test]
    fn test_wait_timeout_lists_pending() {
        let err = KubeError::WaitTimeout {
            timeout: "5s".into(),
            pending: vec!["Deployment/web".into(), "Job/migrate".into()],
        };
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "timed out after 5s waiting for Deployment/web, Job/migrate"
        );
    }
}
