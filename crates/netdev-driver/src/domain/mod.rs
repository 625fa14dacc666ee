pub mod coordinator;
pub mod dispatcher;
pub mod driver;
pub mod registry;
pub mod types;

pub use coordinator::AllocationCoordinator;
pub use dispatcher::SandboxHookDispatcher;
pub use dispatcher::SandboxState;
pub use driver::DriverKind;
pub use driver::NetworkDriver;
pub use registry::DeviceRegistry;
pub use types::DriverError;
pub use types::ErrorKind;
pub use types::PreparedState;
