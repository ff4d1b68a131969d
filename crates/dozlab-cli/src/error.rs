use thiserror::Error;

/// Exit codes following Unix conventions
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_USAGE: u8 = 2;

/// Input rejected before anything was sent to the cluster
#[derive(Debug, Error)]
#[error("{0}")]
pub struct UsageError(pub String);

/// Convert a Kubernetes API error to a user-friendly message
pub fn format_kube_error(err: &kube::Error) -> String {
    match err {
        kube::Error::Api(resp) => match resp.code {
            400 | 422 => format!("Invalid input: {}", resp.message),
            401 => "Authentication failed: check your kubeconfig credentials".to_string(),
            403 => format!("Permission denied: {}", resp.message),
            404 => format!("Not found: {}", resp.message),
            409 => format!("Already exists: {}", resp.message),
            code => format!("API server error ({code}): {}", resp.message),
        },
        other => format!("Cluster unreachable: {other}"),
    }
}
