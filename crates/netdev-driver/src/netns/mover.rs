//! Moves devices between the host namespace and workload namespaces

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::LinkInfo;
use super::LinkMode;
use super::LinkOps;
use super::NamespaceHandle;
use super::NetError;
use super::SubInterfaceKind;

/// Result of a successful [`NamespaceMover::move_out`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The link was deleted or moved back to the host
    Restored,
    /// Nothing named like that lives in the namespace anymore
    AlreadyAbsent,
    /// The namespace is gone and took its links with it
    NamespaceGone,
}

#[derive(Debug, Clone)]
struct ActiveSlave {
    name: String,
    netns: NamespaceHandle,
}

/// Slaves currently active on one parent link. A parent carries slaves of a
/// single kind at a time.
#[derive(Debug)]
struct ParentSlaves {
    kind: SubInterfaceKind,
    slaves: Vec<ActiveSlave>,
}

/// Performs MoveIn / MoveOut.
///
/// Slave bookkeeping is keyed by parent link and only ever touched through
/// `DashMap` entries, so unrelated parents never contend.
pub struct NamespaceMover {
    ops: Arc<dyn LinkOps>,
    parents: DashMap<String, ParentSlaves>,
}

impl NamespaceMover {
    pub fn new(ops: Arc<dyn LinkOps>) -> Self {
        Self {
            ops,
            parents: DashMap::new(),
        }
    }

    /// Links currently visible in the host namespace
    pub async fn host_links(&self) -> Result<Vec<LinkInfo>, Report<NetError>> {
        self.ops.list_links(&NamespaceHandle::Host).await
    }

    /// Moves `host_name` into `netns` as `desired_name`.
    ///
    /// Re-running a move that already took effect succeeds without touching
    /// the kernel again, so a call abandoned on timeout can simply be retried.
    pub async fn move_in(
        &self,
        host_name: &str,
        netns: &NamespaceHandle,
        desired_name: &str,
        mode: LinkMode,
    ) -> Result<(), Report<NetError>> {
        if !self.ops.namespace_exists(netns) {
            return Err(Report::new(NetError::NamespaceNotFound {
                netns: netns.to_string(),
            }));
        }

        match mode {
            LinkMode::Direct => self.move_in_direct(host_name, netns, desired_name).await,
            LinkMode::SubInterface(kind) => {
                self.add_slave(host_name, netns, desired_name, kind).await
            }
        }
    }

    async fn move_in_direct(
        &self,
        host_name: &str,
        netns: &NamespaceHandle,
        desired_name: &str,
    ) -> Result<(), Report<NetError>> {
        let host = self.ops.list_links(&NamespaceHandle::Host).await?;
        if host.iter().any(|l| l.name == host_name) {
            self.ops
                .move_link(host_name, &NamespaceHandle::Host, netns, desired_name)
                .await
                .attach_printable_lazy(|| format!("moving {host_name} into {netns}"))?;
            info!(device = host_name, netns = %netns, pod_name = desired_name, "Moved link into namespace");
            return Ok(());
        }

        // a previous attempt may have completed after its caller gave up
        let target = self.ops.list_links(netns).await?;
        if target.iter().any(|l| l.name == desired_name && l.kind.is_none()) {
            debug!(device = host_name, netns = %netns, "Link already present in namespace");
            return Ok(());
        }

        Err(Report::new(NetError::LinkNotFound {
            name: host_name.to_string(),
            netns: NamespaceHandle::Host.to_string(),
        }))
    }

    async fn add_slave(
        &self,
        parent: &str,
        netns: &NamespaceHandle,
        name: &str,
        kind: SubInterfaceKind,
    ) -> Result<(), Report<NetError>> {
        let host = self.ops.list_links(&NamespaceHandle::Host).await?;
        let Some(parent_index) = host.iter().find(|l| l.name == parent).map(|l| l.index) else {
            return Err(Report::new(NetError::LinkNotFound {
                name: parent.to_string(),
                netns: NamespaceHandle::Host.to_string(),
            }));
        };

        let target = self.ops.list_links(netns).await?;
        if let Some(present) = target.iter().find(|l| l.name == name) {
            // only our own slave of this parent counts as a finished earlier attempt
            if present.sub_interface_kind() == Some(kind)
                && present.parent_index == Some(parent_index)
            {
                self.reserve(parent, netns, name, kind)?;
                debug!(parent, netns = %netns, slave = name, "Slave already present in namespace");
                return Ok(());
            }
            return Err(Report::new(NetError::NameInUse {
                name: name.to_string(),
                netns: netns.to_string(),
                holder: describe_link(present, &host),
            }));
        }

        self.reserve(parent, netns, name, kind)?;
        match self.ops.add_sub_interface(parent, netns, name, kind).await {
            Ok(()) => {
                info!(parent, netns = %netns, slave = name, %kind, "Created slave link in namespace");
                Ok(())
            }
            Err(report) => {
                self.release(parent, netns, name);
                if matches!(report.current_context(), NetError::ParentBusy { .. }) {
                    // the kernel knows about a slave we never created
                    let active = match kind {
                        SubInterfaceKind::Macvlan => SubInterfaceKind::Ipvlan,
                        SubInterfaceKind::Ipvlan => SubInterfaceKind::Macvlan,
                    };
                    let existing = untracked_slaves(&host, parent, parent_index, active);
                    return Err(report.change_context(NetError::SubInterfaceConflict {
                        parent: parent.to_string(),
                        requested: kind,
                        active,
                        existing,
                    }));
                }
                Err(report)
            }
        }
    }

    /// Records a slave on `parent`, failing when the parent carries the other
    /// kind. Checked and recorded under the parent's entry lock.
    fn reserve(
        &self,
        parent: &str,
        netns: &NamespaceHandle,
        name: &str,
        kind: SubInterfaceKind,
    ) -> Result<(), Report<NetError>> {
        let slave = ActiveSlave {
            name: name.to_string(),
            netns: netns.clone(),
        };
        match self.parents.entry(parent.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(ParentSlaves {
                    kind,
                    slaves: vec![slave],
                });
                Ok(())
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.kind != kind && !entry.slaves.is_empty() {
                    let existing = &entry.slaves[0];
                    return Err(Report::new(NetError::SubInterfaceConflict {
                        parent: parent.to_string(),
                        requested: kind,
                        active: entry.kind,
                        existing: format!("{} in {}", existing.name, existing.netns),
                    }));
                }
                entry.kind = kind;
                if !entry
                    .slaves
                    .iter()
                    .any(|s| s.name == slave.name && s.netns == slave.netns)
                {
                    entry.slaves.push(slave);
                }
                Ok(())
            }
        }
    }

    fn release(&self, parent: &str, netns: &NamespaceHandle, name: &str) {
        if let Entry::Occupied(mut occupied) = self.parents.entry(parent.to_string()) {
            occupied
                .get_mut()
                .slaves
                .retain(|s| !(s.name == name && &s.netns == netns));
            if occupied.get().slaves.is_empty() {
                occupied.remove();
            }
        }
    }

    fn release_namespace(&self, netns: &NamespaceHandle) {
        self.parents.retain(|_, entry| {
            entry.slaves.retain(|s| &s.netns != netns);
            !entry.slaves.is_empty()
        });
    }

    fn release_slave_anywhere(&self, netns: &NamespaceHandle, name: &str) {
        self.parents.retain(|_, entry| {
            entry.slaves.retain(|s| !(s.name == name && &s.netns == netns));
            !entry.slaves.is_empty()
        });
    }

    /// Reverses [`move_in`](Self::move_in) for `current_name` inside `netns`.
    ///
    /// Slaves are deleted, direct links are moved back to the host as
    /// `host_name`. A vanished namespace counts as success: its teardown
    /// already destroyed whatever it contained.
    pub async fn move_out(
        &self,
        netns: &NamespaceHandle,
        current_name: &str,
        host_name: &str,
    ) -> Result<MoveOutcome, Report<NetError>> {
        if !self.ops.namespace_exists(netns) {
            return Ok(self.namespace_gone(netns, current_name));
        }

        let links = match self.ops.list_links(netns).await {
            Ok(links) => links,
            Err(report) if is_namespace_gone(&report) => {
                return Ok(self.namespace_gone(netns, current_name));
            }
            Err(report) => return Err(report),
        };

        let Some(link) = links.iter().find(|l| l.name == current_name) else {
            self.release_slave_anywhere(netns, current_name);
            debug!(netns = %netns, pod_name = current_name, "Link already absent from namespace");
            return Ok(MoveOutcome::AlreadyAbsent);
        };

        let result = match link.sub_interface_kind() {
            Some(kind) => {
                let deleted = self.ops.delete_link(netns, current_name).await;
                if deleted.is_ok() {
                    self.release_slave_anywhere(netns, current_name);
                    info!(netns = %netns, slave = current_name, %kind, "Deleted slave link");
                }
                deleted
            }
            None => {
                let moved = self
                    .ops
                    .move_link(current_name, netns, &NamespaceHandle::Host, host_name)
                    .await;
                if moved.is_ok() {
                    info!(netns = %netns, pod_name = current_name, device = host_name, "Moved link back to host");
                }
                moved
            }
        };

        match result {
            Ok(()) => Ok(MoveOutcome::Restored),
            Err(report) if is_namespace_gone(&report) => {
                Ok(self.namespace_gone(netns, current_name))
            }
            Err(report) => Err(report.attach_printable(format!(
                "restoring {current_name} from {netns} as {host_name}"
            ))),
        }
    }

    fn namespace_gone(&self, netns: &NamespaceHandle, current_name: &str) -> MoveOutcome {
        warn!(
            netns = %netns,
            pod_name = current_name,
            "Namespace no longer exists, treating cleanup as done; a directly moved link cannot be recovered"
        );
        self.release_namespace(netns);
        MoveOutcome::NamespaceGone
    }
}

/// Names the slaves of `parent` visible on the host, or says where the
/// kernel's slave must be when none are.
fn untracked_slaves(
    host: &[LinkInfo],
    parent: &str,
    parent_index: u32,
    active: SubInterfaceKind,
) -> String {
    let names: Vec<&str> = host
        .iter()
        .filter(|l| l.parent_index == Some(parent_index) && l.sub_interface_kind().is_some())
        .map(|l| l.name.as_str())
        .collect();
    if names.is_empty() {
        format!(
            "an untracked {active} slave of {parent} (ifindex {parent_index}) in another namespace"
        )
    } else {
        format!("{} in {}", names.join(", "), NamespaceHandle::Host)
    }
}

fn describe_link(link: &LinkInfo, host: &[LinkInfo]) -> String {
    let kind = link.kind.as_deref().unwrap_or("physical");
    match link
        .parent_index
        .and_then(|index| host.iter().find(|l| l.index == index))
    {
        Some(parent) => format!("a {kind} link on {}", parent.name),
        None => format!("a {kind} link"),
    }
}

fn is_namespace_gone(report: &Report<NetError>) -> bool {
    matches!(report.current_context(), NetError::NamespaceNotFound { .. })
}
