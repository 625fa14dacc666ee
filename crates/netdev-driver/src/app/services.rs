use std::sync::Arc;

use crate::lifecycle::ServiceLifecycle;
use crate::publisher::InventoryPublisher;
use crate::service::NodeService;

/// Application dependencies
pub struct ApplicationServices {
    pub node_service: Arc<NodeService>,
    pub lifecycle: Arc<ServiceLifecycle>,
    /// absent when publication is disabled
    pub publisher: Option<Arc<dyn InventoryPublisher>>,
}
