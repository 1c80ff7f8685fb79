//! Netlink Client: a thin async wrapper over RTNETLINK for the handful of
//! link/address/route operations the Network Topology component needs.
//!
//! Grounded on `examples/orbstack-swift-nio/vinit/src/startup.rs::setup_network`,
//! which drives the identical `rtnetlink` + `netlink-packet-route` stack for
//! an equivalent bridge/veth/address/route problem. All sequence-number, ACK,
//! and dump-termination bookkeeping is handled internally by `rtnetlink`; this
//! module only supplies the per-operation request construction named in
//! `spec.md` §4.7.
//!
//! Every function here is `async` and operates on a borrowed `Handle`. The
//! synchronous `supervisor`/`netns` callers drive these with a private
//! current-thread Tokio runtime's `block_on`, never scheduling anything
//! concurrently (see `SPEC_FULL.md` §4.1).

use std::net::IpAddr;

use futures::TryStreamExt;
use rtnetlink::{Handle, LinkUnspec, LinkVeth};

use crate::error::MicroboxError;

/// Opens a new RTNETLINK socket and spawns its driving connection task on
/// the caller's current Tokio runtime. The returned `Handle` is cheaply
/// cloneable and is what every other function in this module takes.
pub fn connect() -> Result<Handle, MicroboxError> {
    let (conn, handle, _) =
        rtnetlink::new_connection().map_err(|e| MicroboxError::Netlink(e.to_string()))?;
    tokio::spawn(conn);
    Ok(handle)
}

fn netlink_err(op: &str, e: impl std::fmt::Display) -> MicroboxError {
    MicroboxError::Netlink(format!("{op}: {e}"))
}

/// Looks up an interface's index by name, returning `None` if it does not exist.
pub async fn interface_index(handle: &Handle, name: &str) -> Result<Option<u32>, MicroboxError> {
    let link = handle
        .link()
        .get()
        .match_name(name.to_string())
        .execute()
        .try_next()
        .await
        .map_err(|e| netlink_err("link get", e))?;
    Ok(link.map(|l| l.header.index))
}

/// `spec.md` §4.7 `interface_exists`: a cheap existence check, grounded on
/// the original's `if_nametoindex` shortcut rather than a full dump.
pub async fn interface_exists(handle: &Handle, name: &str) -> Result<bool, MicroboxError> {
    Ok(interface_index(handle, name).await?.is_some())
}

/// Creates a bridge device named `name`, idempotently: if it already exists
/// this is a no-op success.
pub async fn create_bridge(handle: &Handle, name: &str) -> Result<(), MicroboxError> {
    if interface_exists(handle, name).await? {
        return Ok(());
    }

    handle
        .link()
        .add(LinkUnspec::new_bridge(name).build())
        .execute()
        .await
        .map_err(|e| netlink_err("create bridge", e))
}

/// Creates a veth pair `host_side`<->`container_side`.
pub async fn create_veth_pair(
    handle: &Handle,
    host_side: &str,
    container_side: &str,
) -> Result<(), MicroboxError> {
    handle
        .link()
        .add(LinkVeth::new(host_side, container_side).build())
        .execute()
        .await
        .map_err(|e| netlink_err("create veth pair", e))
}

pub async fn set_interface_up(handle: &Handle, name: &str) -> Result<(), MicroboxError> {
    let index = interface_index(handle, name)
        .await?
        .ok_or_else(|| MicroboxError::Netlink(format!("no such interface: {name}")))?;
    handle
        .link()
        .set(LinkUnspec::new_with_index(index).up().build())
        .execute()
        .await
        .map_err(|e| netlink_err("set interface up", e))
}

/// Enslaves `iface` to `bridge` (sets `IFLA_MASTER`).
pub async fn set_interface_master(
    handle: &Handle,
    iface: &str,
    bridge: &str,
) -> Result<(), MicroboxError> {
    let iface_index = interface_index(handle, iface)
        .await?
        .ok_or_else(|| MicroboxError::Netlink(format!("no such interface: {iface}")))?;
    let bridge_index = interface_index(handle, bridge)
        .await?
        .ok_or_else(|| MicroboxError::Netlink(format!("no such bridge: {bridge}")))?;

    handle
        .link()
        .set(LinkUnspec::new_with_index(iface_index).controller(bridge_index).build())
        .execute()
        .await
        .map_err(|e| netlink_err("set interface master", e))
}

pub async fn add_ip_address(
    handle: &Handle,
    name: &str,
    addr: IpAddr,
    prefix_len: u8,
) -> Result<(), MicroboxError> {
    let index = interface_index(handle, name)
        .await?
        .ok_or_else(|| MicroboxError::Netlink(format!("no such interface: {name}")))?;
    handle
        .address()
        .add(index, addr, prefix_len)
        .execute()
        .await
        .map_err(|e| netlink_err("add ip address", e))
}

pub async fn add_default_route(handle: &Handle, gateway: IpAddr) -> Result<(), MicroboxError> {
    let request = handle.route().add();
    let result = match gateway {
        IpAddr::V4(v4) => request.v4().gateway(v4).execute().await,
        IpAddr::V6(v6) => request.v6().gateway(v6).execute().await,
    };
    result.map_err(|e| netlink_err("add default route", e))
}

/// Moves `name` into the network namespace identified by the open file
/// descriptor `netns_fd` (as returned by opening `/proc/<pid>/ns/net`).
pub async fn move_interface_to_netns(
    handle: &Handle,
    name: &str,
    netns_fd: std::os::unix::io::RawFd,
) -> Result<(), MicroboxError> {
    let index = interface_index(handle, name)
        .await?
        .ok_or_else(|| MicroboxError::Netlink(format!("no such interface: {name}")))?;
    handle
        .link()
        .set(
            LinkUnspec::new_with_index(index)
                .setns_by_fd(netns_fd)
                .build(),
        )
        .execute()
        .await
        .map_err(|e| netlink_err("move interface to netns", e))
}

pub async fn delete_interface(handle: &Handle, name: &str) -> Result<(), MicroboxError> {
    let Some(index) = interface_index(handle, name).await? else {
        return Ok(());
    };
    handle
        .link()
        .del(index)
        .execute()
        .await
        .map_err(|e| netlink_err("delete interface", e))
}

/// `spec.md` §4.7 `get_default_interface`: finds the output interface of the
/// default (`0.0.0.0/0`) route, falling back to `"eth0"` if no default route
/// exists, matching the original's fallback behavior.
pub async fn get_default_interface(handle: &Handle) -> Result<String, MicroboxError> {
    let mut routes = handle.route().get(rtnetlink::IpVersion::V4).execute();

    while let Some(route) = routes
        .try_next()
        .await
        .map_err(|e| netlink_err("get default interface", e))?
    {
        if route.header.destination_prefix_length != 0 {
            continue;
        }

        let oif = route.attributes.iter().find_map(|attr| match attr {
            netlink_packet_route::route::RouteAttribute::Oif(index) => Some(*index),
            _ => None,
        });

        if let Some(index) = oif {
            if let Some(name) = index_to_name(handle, index).await? {
                return Ok(name);
            }
        }
    }

    Ok("eth0".to_string())
}

async fn index_to_name(handle: &Handle, index: u32) -> Result<Option<String>, MicroboxError> {
    let link = handle
        .link()
        .get()
        .match_index(index)
        .execute()
        .try_next()
        .await
        .map_err(|e| netlink_err("link get by index", e))?;
    Ok(link.and_then(|l| {
        l.attributes.into_iter().find_map(|attr| match attr {
            netlink_packet_route::link::LinkAttribute::IfName(name) => Some(name),
            _ => None,
        })
    }))
}
