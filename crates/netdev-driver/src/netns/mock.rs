//! In-memory [`LinkOps`] used by tests. Models the host namespace, workload
//! namespaces, slave links and the kernel's refusal to mix slave kinds on one
//! parent.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;

use super::LinkInfo;
use super::LinkOps;
use super::NamespaceHandle;
use super::NetError;
use super::SubInterfaceKind;

#[derive(Default)]
struct State {
    namespaces: HashMap<NamespaceHandle, Vec<LinkInfo>>,
    next_index: u32,
    failing_moves: HashSet<String>,
    fail_listing: bool,
}

pub(crate) struct FakeNetwork {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
    settle: Mutex<Option<Duration>>,
    moves: AtomicUsize,
    creates: AtomicUsize,
    deletes: AtomicUsize,
}

impl FakeNetwork {
    pub(crate) fn new() -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(NamespaceHandle::Host, Vec::new());
        Self {
            state: Mutex::new(State {
                namespaces,
                next_index: 1,
                ..Default::default()
            }),
            latency: Mutex::new(None),
            settle: Mutex::new(None),
            moves: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn add_host_link(&self, name: &str, up: bool) -> u32 {
        let mut state = self.state();
        let index = state.next_index;
        state.next_index += 1;
        let link = LinkInfo {
            name: name.to_string(),
            index,
            mac: Some(format!("02:00:00:00:00:{index:02x}")),
            up,
            ..Default::default()
        };
        state
            .namespaces
            .entry(NamespaceHandle::Host)
            .or_default()
            .push(link);
        index
    }

    pub(crate) fn add_loopback(&self) {
        let mut state = self.state();
        let index = state.next_index;
        state.next_index += 1;
        state
            .namespaces
            .entry(NamespaceHandle::Host)
            .or_default()
            .push(LinkInfo {
                name: "lo".to_string(),
                index,
                mac: Some("00:00:00:00:00:00".to_string()),
                up: true,
                loopback: true,
                ..Default::default()
            });
    }

    pub(crate) fn add_namespace(&self, path: &str) -> NamespaceHandle {
        let handle = NamespaceHandle::from_path(path);
        self.state().namespaces.entry(handle.clone()).or_default();
        handle
    }

    /// Simulates the sandbox runtime tearing the namespace down; every link
    /// inside is destroyed with it.
    pub(crate) fn remove_namespace(&self, netns: &NamespaceHandle) {
        self.state().namespaces.remove(netns);
    }

    /// A slave created behind our back, e.g. by another agent
    pub(crate) fn add_unmanaged_slave(
        &self,
        parent: &str,
        netns: &NamespaceHandle,
        name: &str,
        kind: SubInterfaceKind,
    ) {
        let mut state = self.state();
        let parent_index = find(&state, &NamespaceHandle::Host, parent).map(|l| l.index);
        let index = state.next_index;
        state.next_index += 1;
        state.namespaces.entry(netns.clone()).or_default().push(LinkInfo {
            name: name.to_string(),
            index,
            up: true,
            kind: Some(kind.to_string()),
            parent_index,
            ..Default::default()
        });
    }

    /// Makes every later move of the host link `name` fail
    pub(crate) fn fail_move_of(&self, name: &str) {
        self.state().failing_moves.insert(name.to_string());
    }

    pub(crate) fn fail_listing(&self, fail: bool) {
        self.state().fail_listing = fail;
    }

    /// Delay applied before every mutating operation takes effect
    pub(crate) fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Delay applied after every mutating operation took effect, like a
    /// kernel reply that arrives after the caller gave up
    pub(crate) fn set_settle_delay(&self, settle: Option<Duration>) {
        *self.settle.lock().unwrap() = settle;
    }

    pub(crate) fn link_names(&self, netns: &NamespaceHandle) -> Vec<String> {
        let state = self.state();
        let mut names: Vec<String> = state
            .namespaces
            .get(netns)
            .map(|links| links.iter().map(|l| l.name.clone()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Sorted (name, mac, up) of every host link
    pub(crate) fn host_inventory(&self) -> Vec<(String, Option<String>, bool)> {
        let state = self.state();
        let mut links: Vec<_> = state
            .namespaces
            .get(&NamespaceHandle::Host)
            .map(|links| {
                links
                    .iter()
                    .map(|l| (l.name.clone(), l.mac.clone(), l.up))
                    .collect()
            })
            .unwrap_or_default();
        links.sort();
        links
    }

    pub(crate) fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    pub(crate) fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Every kernel mutation performed so far
    pub(crate) fn mutation_count(&self) -> usize {
        self.move_count() + self.create_count() + self.deletes.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    async fn settle(&self) {
        let settle = *self.settle.lock().unwrap();
        if let Some(settle) = settle {
            tokio::time::sleep(settle).await;
        }
    }
}

fn find<'a>(state: &'a State, netns: &NamespaceHandle, name: &str) -> Option<&'a LinkInfo> {
    state
        .namespaces
        .get(netns)
        .and_then(|links| links.iter().find(|l| l.name == name))
}

fn missing_namespace(netns: &NamespaceHandle) -> Report<NetError> {
    Report::new(NetError::NamespaceNotFound {
        netns: netns.to_string(),
    })
}

#[async_trait]
impl LinkOps for FakeNetwork {
    fn namespace_exists(&self, netns: &NamespaceHandle) -> bool {
        self.state().namespaces.contains_key(netns)
    }

    async fn list_links(&self, netns: &NamespaceHandle) -> Result<Vec<LinkInfo>, Report<NetError>> {
        let state = self.state();
        if state.fail_listing {
            return Err(Report::new(NetError::netlink("list links", "connection reset")));
        }
        state
            .namespaces
            .get(netns)
            .cloned()
            .ok_or_else(|| missing_namespace(netns))
    }

    async fn move_link(
        &self,
        name: &str,
        from: &NamespaceHandle,
        to: &NamespaceHandle,
        new_name: &str,
    ) -> Result<(), Report<NetError>> {
        self.delay().await;
        let result = self.apply_move(name, from, to, new_name);
        self.settle().await;
        result
    }

    async fn add_sub_interface(
        &self,
        parent: &str,
        netns: &NamespaceHandle,
        name: &str,
        kind: SubInterfaceKind,
    ) -> Result<(), Report<NetError>> {
        self.delay().await;
        let result = self.apply_add(parent, netns, name, kind);
        self.settle().await;
        result
    }

    async fn delete_link(&self, netns: &NamespaceHandle, name: &str) -> Result<(), Report<NetError>> {
        self.delay().await;
        let result = self.apply_delete(netns, name);
        self.settle().await;
        result
    }
}

impl FakeNetwork {
    fn apply_move(
        &self,
        name: &str,
        from: &NamespaceHandle,
        to: &NamespaceHandle,
        new_name: &str,
    ) -> Result<(), Report<NetError>> {
        let mut state = self.state();
        if state.failing_moves.contains(name) {
            return Err(Report::new(NetError::netlink("set link netns", "Operation not permitted (os error 1)")));
        }
        if !state.namespaces.contains_key(to) {
            return Err(missing_namespace(to));
        }
        if find(&state, to, new_name).is_some() {
            return Err(Report::new(NetError::netlink("set link name", "File exists (os error 17)")));
        }
        let source = state.namespaces.get_mut(from).ok_or_else(|| missing_namespace(from))?;
        let position = source.iter().position(|l| l.name == name).ok_or_else(|| {
            Report::new(NetError::LinkNotFound {
                name: name.to_string(),
                netns: from.to_string(),
            })
        })?;
        let mut link = source.remove(position);
        link.name = new_name.to_string();
        link.up = true;
        state.namespaces.entry(to.clone()).or_default().push(link);
        self.moves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn apply_add(
        &self,
        parent: &str,
        netns: &NamespaceHandle,
        name: &str,
        kind: SubInterfaceKind,
    ) -> Result<(), Report<NetError>> {
        let mut state = self.state();
        let parent_index = find(&state, &NamespaceHandle::Host, parent)
            .map(|l| l.index)
            .ok_or_else(|| {
                Report::new(NetError::LinkNotFound {
                    name: parent.to_string(),
                    netns: NamespaceHandle::Host.to_string(),
                })
            })?;
        if !state.namespaces.contains_key(netns) {
            return Err(missing_namespace(netns));
        }
        let other_kind_active = state.namespaces.values().flatten().any(|l| {
            l.parent_index == Some(parent_index)
                && l.sub_interface_kind().is_some_and(|k| k != kind)
        });
        if other_kind_active {
            return Err(Report::new(NetError::ParentBusy {
                parent: parent.to_string(),
            }));
        }
        if find(&state, netns, name).is_some() {
            return Err(Report::new(NetError::netlink("add link", "File exists (os error 17)")));
        }
        let index = state.next_index;
        state.next_index += 1;
        state.namespaces.entry(netns.clone()).or_default().push(LinkInfo {
            name: name.to_string(),
            index,
            mac: Some(format!("02:00:00:00:01:{index:02x}")),
            up: true,
            loopback: false,
            kind: Some(kind.to_string()),
            parent_index: Some(parent_index),
        });
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn apply_delete(&self, netns: &NamespaceHandle, name: &str) -> Result<(), Report<NetError>> {
        let mut state = self.state();
        let links = state.namespaces.get_mut(netns).ok_or_else(|| missing_namespace(netns))?;
        let position = links.iter().position(|l| l.name == name).ok_or_else(|| {
            Report::new(NetError::LinkNotFound {
                name: name.to_string(),
                netns: netns.to_string(),
            })
        })?;
        links.remove(position);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
