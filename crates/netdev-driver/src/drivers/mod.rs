//! Driver variants implementing [`NetworkDriver`](crate::domain::driver::NetworkDriver)

pub mod hostdevice;
pub mod node_agent;
pub mod subinterface;

use error_stack::Report;

use crate::domain::types::DriverError;
use crate::netns::NetError;

pub use hostdevice::HostDeviceDriver;
pub use node_agent::NodeAgentDriver;
pub use subinterface::SubInterfaceDriver;

/// Wraps a namespace failure with the workload and device it happened for
pub(crate) fn network_error(
    report: Report<NetError>,
    uid: &str,
    device: &str,
    operation: &'static str,
) -> Report<DriverError> {
    let source = report.current_context().clone();
    report.change_context(DriverError::network(uid, device, operation, &source))
}
