//! rtnetlink backed [`LinkOps`].
//!
//! A netlink socket always talks to the namespace of the thread that opened
//! it, so every operation gets its own OS thread: the thread enters the
//! namespace with `setns(2)`, opens a fresh connection and drives it on a
//! current-thread runtime. The caller only awaits a oneshot channel.

use std::fs::File;
use std::future::Future;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use futures::TryStreamExt;
use netlink_packet_route::link::InfoData;
use netlink_packet_route::link::InfoIpVlan;
use netlink_packet_route::link::InfoKind;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::link::LinkFlag;
use netlink_packet_route::link::LinkMessage;
use nix::sched::setns;
use nix::sched::CloneFlags;
use rtnetlink::new_connection;
use rtnetlink::Handle;
use rtnetlink::LinkAddRequest;
use tokio::sync::oneshot;
use tracing::debug;

use super::LinkInfo;
use super::LinkOps;
use super::NamespaceHandle;
use super::NetError;
use super::SubInterfaceKind;

const HOST_NETNS: &str = "/proc/self/ns/net";
const MACVLAN_MODE_BRIDGE: u32 = 4;
const IPVLAN_MODE_L2: u16 = 0;

/// Talks to the kernel through rtnetlink
#[derive(Debug, Clone)]
pub struct RtNetlinkOps {
    macvlan_mode: u32,
    ipvlan_mode: u16,
}

impl Default for RtNetlinkOps {
    fn default() -> Self {
        Self {
            macvlan_mode: MACVLAN_MODE_BRIDGE,
            ipvlan_mode: IPVLAN_MODE_L2,
        }
    }
}

impl RtNetlinkOps {
    pub fn new(macvlan_mode: u32, ipvlan_mode: u16) -> Self {
        Self {
            macvlan_mode,
            ipvlan_mode,
        }
    }
}

fn ns_path(netns: &NamespaceHandle) -> &Path {
    match netns {
        NamespaceHandle::Host => Path::new(HOST_NETNS),
        NamespaceHandle::Path(p) => p.as_path(),
    }
}

fn open_namespace(netns: &NamespaceHandle) -> Result<File, Report<NetError>> {
    File::open(ns_path(netns)).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Report::new(NetError::NamespaceNotFound {
                netns: netns.to_string(),
            })
        } else {
            Report::new(NetError::netlink("open namespace", &e))
                .attach_printable(format!("namespace: {netns}"))
        }
    })
}

/// Runs `op` on a dedicated thread inside `netns`. `extra` is opened before
/// switching namespaces so it can name the namespace the thread came from.
async fn run_in<T, F, Fut>(
    netns: &NamespaceHandle,
    extra: Option<&NamespaceHandle>,
    op: F,
) -> Result<T, Report<NetError>>
where
    T: Send + 'static,
    F: FnOnce(Handle, Option<File>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, Report<NetError>>>,
{
    let target = netns.clone();
    let extra = extra.cloned();
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("netns-op".to_string())
        .spawn(move || {
            let result = enter_and_run(&target, extra.as_ref(), op);
            let _ = tx.send(result);
        })
        .map_err(|e| Report::new(NetError::netlink("spawn namespace thread", e)))?;

    rx.await
        .map_err(|_| Report::new(NetError::netlink("namespace thread", "exited without a result")))?
}

fn enter_and_run<T, F, Fut>(
    target: &NamespaceHandle,
    extra: Option<&NamespaceHandle>,
    op: F,
) -> Result<T, Report<NetError>>
where
    F: FnOnce(Handle, Option<File>) -> Fut,
    Fut: Future<Output = Result<T, Report<NetError>>>,
{
    let extra = extra.map(open_namespace).transpose()?;
    if let NamespaceHandle::Path(_) = target {
        let file = open_namespace(target)?;
        setns(&file, CloneFlags::CLONE_NEWNET)
            .map_err(|e| Report::new(NetError::netlink("setns", e)))
            .attach_printable_lazy(|| format!("namespace: {target}"))?;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Report::new(NetError::netlink("build runtime", e)))?;

    runtime.block_on(async move {
        let (connection, handle, _) =
            new_connection().map_err(|e| Report::new(NetError::netlink("open netlink socket", e)))?;
        tokio::spawn(connection);
        op(handle, extra).await
    })
}

fn errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.code.map(|c| -c.get()),
        _ => None,
    }
}

fn link_info(msg: &LinkMessage) -> LinkInfo {
    let mut info = LinkInfo {
        index: msg.header.index,
        up: msg.header.flags.contains(&LinkFlag::Up),
        loopback: msg.header.flags.contains(&LinkFlag::Loopback),
        ..Default::default()
    };
    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => info.name = name.clone(),
            LinkAttribute::Address(addr) if !addr.is_empty() => {
                info.mac = Some(
                    addr.iter()
                        .map(|b| format!("{b:02x}"))
                        .collect::<Vec<_>>()
                        .join(":"),
                );
            }
            LinkAttribute::Link(parent) => info.parent_index = Some(*parent),
            LinkAttribute::LinkInfo(infos) => {
                for i in infos {
                    if let netlink_packet_route::link::LinkInfo::Kind(kind) = i {
                        info.kind = Some(match kind {
                            InfoKind::MacVlan => "macvlan".to_string(),
                            InfoKind::IpVlan => "ipvlan".to_string(),
                            other => format!("{other:?}").to_lowercase(),
                        });
                    }
                }
            }
            _ => {}
        }
    }
    info
}

async fn find_link(
    handle: &Handle,
    name: &str,
    netns: &NamespaceHandle,
) -> Result<Option<LinkMessage>, Report<NetError>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(e) if errno(&e) == Some(libc::ENODEV) => Ok(None),
        Err(e) => Err(Report::new(NetError::netlink("get link", e)))
            .attach_printable_lazy(|| format!("link {name} in {netns}")),
    }
}

async fn require_link(
    handle: &Handle,
    name: &str,
    netns: &NamespaceHandle,
) -> Result<LinkMessage, Report<NetError>> {
    find_link(handle, name, netns).await?.ok_or_else(|| {
        Report::new(NetError::LinkNotFound {
            name: name.to_string(),
            netns: netns.to_string(),
        })
    })
}

/// `ip link add NAME link PARENT type ipvlan mode MODE`
fn ipvlan_request(handle: &Handle, name: &str, parent_index: u32, mode: u16) -> LinkAddRequest {
    let mut request = handle.link().add().name(name.to_string());
    let attributes = &mut request.message_mut().attributes;
    attributes.push(LinkAttribute::LinkInfo(vec![
        netlink_packet_route::link::LinkInfo::Kind(InfoKind::IpVlan),
        netlink_packet_route::link::LinkInfo::Data(InfoData::IpVlan(vec![InfoIpVlan::Mode(mode)])),
    ]));
    attributes.push(LinkAttribute::Link(parent_index));
    request
}

#[async_trait]
impl LinkOps for RtNetlinkOps {
    fn namespace_exists(&self, netns: &NamespaceHandle) -> bool {
        ns_path(netns).exists()
    }

    async fn list_links(&self, netns: &NamespaceHandle) -> Result<Vec<LinkInfo>, Report<NetError>> {
        run_in(netns, None, |handle, _| async move {
            let messages: Vec<LinkMessage> = handle
                .link()
                .get()
                .execute()
                .try_collect()
                .await
                .map_err(|e| Report::new(NetError::netlink("dump links", e)))?;
            Ok(messages.iter().map(link_info).collect())
        })
        .await
    }

    async fn move_link(
        &self,
        name: &str,
        from: &NamespaceHandle,
        to: &NamespaceHandle,
        new_name: &str,
    ) -> Result<(), Report<NetError>> {
        let source = from.clone();
        let link_name = name.to_string();
        run_in(from, Some(to), move |handle, target| async move {
            let target = target.ok_or_else(|| {
                Report::new(NetError::netlink("set link netns", "target namespace not open"))
            })?;
            let link = require_link(&handle, &link_name, &source).await?;
            handle
                .link()
                .set(link.header.index)
                .down()
                .execute()
                .await
                .map_err(|e| Report::new(NetError::netlink("set link down", e)))?;
            handle
                .link()
                .set(link.header.index)
                .setns_by_fd(target.as_raw_fd())
                .execute()
                .await
                .map_err(|e| Report::new(NetError::netlink("set link netns", e)))
        })
        .await?;
        debug!(device = name, from = %from, to = %to, "Link reparented");

        let destination = to.clone();
        let old_name = name.to_string();
        let new_name = new_name.to_string();
        run_in(to, None, move |handle, _| async move {
            let link = match find_link(&handle, &old_name, &destination).await? {
                Some(link) => link,
                None => require_link(&handle, &new_name, &destination).await?,
            };
            let mut request = handle.link().set(link.header.index);
            if old_name != new_name {
                request = request.name(new_name.clone());
            }
            request
                .execute()
                .await
                .map_err(|e| Report::new(NetError::netlink("rename link", e)))
                .attach_printable_lazy(|| format!("{old_name} -> {new_name} in {destination}"))?;
            handle
                .link()
                .set(link.header.index)
                .up()
                .execute()
                .await
                .map_err(|e| Report::new(NetError::netlink("set link up", e)))
        })
        .await
    }

    async fn add_sub_interface(
        &self,
        parent: &str,
        netns: &NamespaceHandle,
        name: &str,
        kind: SubInterfaceKind,
    ) -> Result<(), Report<NetError>> {
        let (macvlan_mode, ipvlan_mode) = (self.macvlan_mode, self.ipvlan_mode);
        let parent_name = parent.to_string();
        let slave = name.to_string();
        run_in(&NamespaceHandle::Host, Some(netns), move |handle, target| async move {
            let target = target.ok_or_else(|| {
                Report::new(NetError::netlink("add link", "target namespace not open"))
            })?;
            let link = require_link(&handle, &parent_name, &NamespaceHandle::Host).await?;
            let mut request = match kind {
                SubInterfaceKind::Macvlan => {
                    handle
                        .link()
                        .add()
                        .macvlan(slave.clone(), link.header.index, macvlan_mode)
                }
                SubInterfaceKind::Ipvlan => ipvlan_request(&handle, &slave, link.header.index, ipvlan_mode),
            };
            request
                .message_mut()
                .attributes
                .push(LinkAttribute::NetNsFd(target.as_raw_fd()));
            request.execute().await.map_err(|e| {
                if errno(&e) == Some(libc::EBUSY) {
                    Report::new(NetError::ParentBusy {
                        parent: parent_name.clone(),
                    })
                } else {
                    Report::new(NetError::netlink("add link", e))
                }
            })
        })
        .await?;

        let destination = netns.clone();
        let slave = name.to_string();
        run_in(netns, None, move |handle, _| async move {
            let link = require_link(&handle, &slave, &destination).await?;
            handle
                .link()
                .set(link.header.index)
                .up()
                .execute()
                .await
                .map_err(|e| Report::new(NetError::netlink("set link up", e)))
        })
        .await
    }

    async fn delete_link(&self, netns: &NamespaceHandle, name: &str) -> Result<(), Report<NetError>> {
        let owner = netns.clone();
        let link_name = name.to_string();
        run_in(netns, None, move |handle, _| async move {
            let link = require_link(&handle, &link_name, &owner).await?;
            handle
                .link()
                .del(link.header.index)
                .execute()
                .await
                .map_err(|e| Report::new(NetError::netlink("delete link", e)))
        })
        .await
    }
}
