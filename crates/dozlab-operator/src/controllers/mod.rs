//! LabSession controller and its shared state

pub mod events;
pub mod labsession;
pub mod retry;

use std::sync::Arc;

use crate::client::ClusterClient;
use crate::config::OperatorConfig;

use self::events::EventPublisher;
use self::retry::RetryTracker;

/// Shared state for the session controller and reaper
pub struct ControllerContext {
    /// Cluster access used for every read and write
    pub client: Arc<dyn ClusterClient>,
    pub config: Arc<OperatorConfig>,
    /// Consecutive transient failures per session uid
    pub retry_tracker: Arc<RetryTracker>,
    pub events: Arc<dyn EventPublisher>,
}
