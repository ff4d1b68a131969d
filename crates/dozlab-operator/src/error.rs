//! Reconcile error taxonomy

use thiserror::Error;

use crate::builder::BuildError;
use crate::client::{ChildKind, ClientError};
use crate::controllers::retry::ErrorKind;
use crate::labsession::FailureReason;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid spec: {0}")]
    InvalidSpec(#[from] BuildError),
    #[error("{kind} {name} already exists and is not owned by this session")]
    ChildResourceConflict { kind: ChildKind, name: String },
    #[error("resource quota exhausted: {0}")]
    ResourceExhausted(ClientError),
    #[error("Kubernetes API error: {0}")]
    Client(ClientError),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

impl From<ClientError> for SessionError {
    fn from(error: ClientError) -> Self {
        if error.is_exhausted() {
            SessionError::ResourceExhausted(error)
        } else {
            SessionError::Client(error)
        }
    }
}

impl From<kube::Error> for SessionError {
    fn from(error: kube::Error) -> Self {
        ClientError::from(error).into()
    }
}

impl SessionError {
    /// Classify for retry behavior
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Client(e) if e.is_transient() || e.is_conflict() || e.is_not_found() => {
                ErrorKind::Transient
            }
            SessionError::ResourceExhausted(_) => ErrorKind::Transient,
            SessionError::Client(_)
            | SessionError::InvalidSpec(_)
            | SessionError::ChildResourceConflict { .. }
            | SessionError::MissingField(_) => ErrorKind::Permanent,
        }
    }

    /// Failure class recorded on the session when this error fails it
    pub fn reason(&self) -> FailureReason {
        match self {
            SessionError::InvalidSpec(_) | SessionError::MissingField(_) => {
                FailureReason::InvalidSpec
            }
            SessionError::ChildResourceConflict { .. } => FailureReason::ChildResourceConflict,
            SessionError::ResourceExhausted(_) => FailureReason::ResourceExhausted,
            // Rejected outright (400, 403, 422): the desired object is unacceptable
            SessionError::Client(_) if self.kind() == ErrorKind::Permanent => {
                FailureReason::InvalidSpec
            }
            SessionError::Client(_) => FailureReason::TransientApiError,
        }
    }

    /// Whether the reconciler should move the session to `Failed` right away
    ///
    /// Transient API errors are retried by the error policy instead and only
    /// fail the session once the retry budget is spent.
    pub fn fails_session(&self) -> bool {
        !(matches!(self, SessionError::Client(_)) && self.kind() == ErrorKind::Transient)
    }
}
