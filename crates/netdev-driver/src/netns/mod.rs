//! Network namespace plumbing.
//!
//! [`NamespaceMover`] moves host links into workload namespaces (or creates
//! macvlan/ipvlan slaves there) and reverses the operation. The kernel side is
//! behind the [`LinkOps`] trait; [`rtnl::RtNetlinkOps`] talks rtnetlink on
//! Linux.

use core::error::Error;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;

#[cfg(test)]
pub(crate) mod mock;
pub mod mover;
#[cfg(target_os = "linux")]
pub mod rtnl;

pub use mover::MoveOutcome;
pub use mover::NamespaceMover;

/// Reference to a kernel network namespace. Never created or destroyed here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NamespaceHandle {
    /// The namespace this daemon runs in
    Host,
    /// A bind-mounted or procfs namespace file, e.g. `/var/run/netns/cni-1234`
    /// or `/proc/<pid>/ns/net`
    Path(PathBuf),
}

impl NamespaceHandle {
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::Path(path.as_ref().to_path_buf())
    }
}

impl fmt::Display for NamespaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Kind of slave link created on a parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum SubInterfaceKind {
    #[display("macvlan")]
    Macvlan,
    #[display("ipvlan")]
    Ipvlan,
}

impl SubInterfaceKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "macvlan" => Some(Self::Macvlan),
            "ipvlan" => Some(Self::Ipvlan),
            _ => None,
        }
    }
}

/// How a device reaches a workload namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum LinkMode {
    /// Reparent the host link itself; exclusive.
    #[display("direct")]
    Direct,
    /// Create a slave of the host link inside the namespace; shared parent.
    #[display("{_0}")]
    SubInterface(SubInterfaceKind),
}

/// Link facts read from one namespace
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkInfo {
    pub name: String,
    pub index: u32,
    pub mac: Option<String>,
    pub up: bool,
    pub loopback: bool,
    /// rtnetlink kind, e.g. `macvlan`; `None` for physical links
    pub kind: Option<String>,
    pub parent_index: Option<u32>,
}

impl LinkInfo {
    /// Whether this link is a macvlan or ipvlan slave
    pub fn sub_interface_kind(&self) -> Option<SubInterfaceKind> {
        self.kind.as_deref().and_then(SubInterfaceKind::parse)
    }
}

/// Errors from namespace and link operations
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum NetError {
    #[display("network namespace {netns} does not exist")]
    NamespaceNotFound { netns: String },
    #[display("link {name} not found in namespace {netns}")]
    LinkNotFound { name: String, netns: String },
    #[display(
        "cannot add {requested} slave on parent {parent}: {existing} is already active as {active}"
    )]
    SubInterfaceConflict {
        parent: String,
        requested: SubInterfaceKind,
        active: SubInterfaceKind,
        existing: String,
    },
    #[display("parent {parent} is busy with slaves of another kind")]
    ParentBusy { parent: String },
    #[display("link name {name} in namespace {netns} is held by {holder}")]
    NameInUse {
        name: String,
        netns: String,
        holder: String,
    },
    #[display("netlink {operation} failed: {message}")]
    Netlink { operation: String, message: String },
}

impl Error for NetError {}

impl NetError {
    pub(crate) fn netlink(operation: &str, err: impl fmt::Display) -> Self {
        Self::Netlink {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }
}

/// Kernel link operations, one call per netlink transaction.
///
/// Every method may block for hundreds of milliseconds; implementations must
/// not run them on the caller's executor thread.
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Whether the namespace reference still resolves
    fn namespace_exists(&self, netns: &NamespaceHandle) -> bool;

    /// Lists all links visible in `netns`
    async fn list_links(&self, netns: &NamespaceHandle) -> Result<Vec<LinkInfo>, Report<NetError>>;

    /// Moves link `name` from `from` into `to`, renaming it to `new_name`, and
    /// brings it up there
    async fn move_link(
        &self,
        name: &str,
        from: &NamespaceHandle,
        to: &NamespaceHandle,
        new_name: &str,
    ) -> Result<(), Report<NetError>>;

    /// Creates a slave of host link `parent` named `name` directly inside
    /// `netns` and brings it up
    async fn add_sub_interface(
        &self,
        parent: &str,
        netns: &NamespaceHandle,
        name: &str,
        kind: SubInterfaceKind,
    ) -> Result<(), Report<NetError>>;

    /// Deletes link `name` in `netns`
    async fn delete_link(&self, netns: &NamespaceHandle, name: &str) -> Result<(), Report<NetError>>;
}
