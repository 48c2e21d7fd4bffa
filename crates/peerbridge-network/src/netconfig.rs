//! Route and firewall configuration for the virtual network
//!
//! Applies OS-level plumbing once the session knows its role: assigns
//! the virtual address, installs the /24 route (falling back to a /32
//! host route toward the peer), enables forwarding, adds the multicast
//! route and opens the firewall for the virtual subnet. Removal is the
//! symmetric set.
//!
//! Every command failure is logged and treated as partial success; a
//! degraded route never aborts the connection. The one exception is the
//! virtual address assignment itself, which fails the whole configure
//! call.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use tokio::process::Command;
use tracing::{info, warn};

use peerbridge_core::{VIRTUAL_PREFIX_LEN, VIRTUAL_SUBNET};

/// Multicast range routed onto the tunnel for LAN discovery
const MULTICAST_RANGE: &str = "224.0.0.0/4";

/// Parameters of one connection's interface setup
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Our virtual address
    pub self_virtual_ip: Ipv4Addr,
    /// The peer's virtual address (used by the host-route fallback)
    pub peer_virtual_ip: Ipv4Addr,
}

/// Which routing approach ended up installed, so removal stays symmetric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteApproach {
    None,
    Subnet,
    HostOnly,
    Failed,
}

/// Applies and removes the routing/firewall state for one tunnel
/// interface.
pub struct NetConfigManager {
    interface: Mutex<String>,
    approach: Mutex<RouteApproach>,
}

impl NetConfigManager {
    pub fn new() -> Self {
        Self {
            interface: Mutex::new(String::new()),
            approach: Mutex::new(RouteApproach::None),
        }
    }

    /// Record the tunnel interface name the commands operate on.
    pub fn set_interface(&self, name: &str) {
        *self.interface.lock().unwrap() = name.to_string();
    }

    fn interface(&self) -> String {
        self.interface.lock().unwrap().clone()
    }

    /// Install routing and firewall for this connection. Returns false
    /// only when the interface could not be addressed at all.
    pub async fn configure_interface(&self, config: &ConnectionConfig) -> bool {
        if !self.setup_routing(config).await {
            warn!("Interface configuration failed, removing partial routes");
            self.remove_routing(config.peer_virtual_ip).await;
            return false;
        }
        self.setup_firewall().await;
        info!("Interface configuration successful");
        true
    }

    /// Undo everything `configure_interface` installed.
    pub async fn reset_interface_configuration(&self, peer_virtual_ip: Ipv4Addr) {
        if !self.remove_routing(peer_virtual_ip).await {
            info!("Some routing state could not be removed");
        }
        self.remove_firewall().await;
    }

    async fn setup_routing(&self, config: &ConnectionConfig) -> bool {
        let interface = self.interface();
        let subnet = format!("{}/{}", VIRTUAL_SUBNET, VIRTUAL_PREFIX_LEN);

        info!(
            "Setting up routing on {}: self {} peer {} subnet {}",
            interface, config.self_virtual_ip, config.peer_virtual_ip, subnet
        );

        if !self
            .run("ip", &addr_assign_args(&interface, config.self_virtual_ip))
            .await
        {
            warn!("Failed to assign virtual address, cancelling connection");
            *self.approach.lock().unwrap() = RouteApproach::Failed;
            return false;
        }

        // Preferred: one route for the whole virtual subnet
        if self.run("ip", &subnet_route_args(&interface)).await {
            *self.approach.lock().unwrap() = RouteApproach::Subnet;
        } else {
            warn!("Subnet route failed, trying direct host route to peer");
            // Fallback: at least reach the peer itself
            if self
                .run("ip", &host_route_args(&interface, config.peer_virtual_ip))
                .await
            {
                *self.approach.lock().unwrap() = RouteApproach::HostOnly;
            } else {
                warn!("Failed to add any route for the virtual network, connectivity may be limited");
                *self.approach.lock().unwrap() = RouteApproach::Failed;
            }
        }

        if !self.run("sysctl", &forwarding_args(&interface, true)).await {
            warn!("Failed to enable forwarding on {}", interface);
            return false;
        }

        if !self.run("ip", &multicast_route_args(&interface)).await {
            warn!("Failed to add multicast route; discovery may be limited");
        }

        info!("Routing configured for the virtual network");
        true
    }

    async fn remove_routing(&self, peer_virtual_ip: Ipv4Addr) -> bool {
        let interface = self.interface();
        let mut success = true;

        let approach = *self.approach.lock().unwrap();
        match approach {
            RouteApproach::Subnet => {
                if !self.run("ip", &subnet_route_del_args(&interface)).await {
                    info!("Failed to remove subnet route");
                    success = false;
                }
            }
            RouteApproach::HostOnly => {
                if !self
                    .run("ip", &host_route_del_args(&interface, peer_virtual_ip))
                    .await
                {
                    info!("Failed to remove host route");
                    success = false;
                }
            }
            RouteApproach::None | RouteApproach::Failed => {}
        }
        *self.approach.lock().unwrap() = RouteApproach::None;

        if !self.run("ip", &addr_flush_args(&interface)).await {
            info!("Failed to remove virtual address");
            success = false;
        }
        if !self.run("ip", &multicast_route_del_args(&interface)).await {
            info!("Failed to remove multicast route");
            success = false;
        }
        if !self.run("sysctl", &forwarding_args(&interface, false)).await {
            info!("Failed to disable forwarding");
            success = false;
        }

        success
    }

    async fn setup_firewall(&self) {
        info!("Setting up firewall rules");
        for args in firewall_rules(true) {
            if !self.run("iptables", &args).await {
                warn!("Firewall rule failed ({}), connectivity may be limited", args.join(" "));
            }
        }
    }

    async fn remove_firewall(&self) {
        info!("Removing firewall rules");
        for args in firewall_rules(false) {
            if !self.run("iptables", &args).await {
                warn!("Failed to remove firewall rule ({})", args.join(" "));
            }
        }
    }

    /// Run one command, logging it and its outcome.
    async fn run(&self, program: &str, args: &[String]) -> bool {
        info!("Executing: {} {}", program, args.join(" "));

        match Command::new(program).args(args).output().await {
            Ok(output) => {
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!(
                        "Command failed ({}): {}",
                        output.status,
                        stderr.trim()
                    );
                }
                output.status.success()
            }
            Err(e) => {
                warn!("Failed to execute {}: {}", program, e);
                false
            }
        }
    }
}

impl Default for NetConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn addr_assign_args(interface: &str, self_ip: Ipv4Addr) -> Vec<String> {
    vec![
        "addr".into(),
        "replace".into(),
        format!("{}/{}", self_ip, VIRTUAL_PREFIX_LEN),
        "dev".into(),
        interface.into(),
    ]
}

fn addr_flush_args(interface: &str) -> Vec<String> {
    vec!["addr".into(), "flush".into(), "dev".into(), interface.into()]
}

fn subnet_route_args(interface: &str) -> Vec<String> {
    vec![
        "route".into(),
        "replace".into(),
        format!("{}/{}", VIRTUAL_SUBNET, VIRTUAL_PREFIX_LEN),
        "dev".into(),
        interface.into(),
        "metric".into(),
        "1".into(),
    ]
}

fn subnet_route_del_args(interface: &str) -> Vec<String> {
    vec![
        "route".into(),
        "del".into(),
        format!("{}/{}", VIRTUAL_SUBNET, VIRTUAL_PREFIX_LEN),
        "dev".into(),
        interface.into(),
    ]
}

fn host_route_args(interface: &str, peer_ip: Ipv4Addr) -> Vec<String> {
    vec![
        "route".into(),
        "replace".into(),
        format!("{}/32", peer_ip),
        "dev".into(),
        interface.into(),
        "metric".into(),
        "1".into(),
    ]
}

fn host_route_del_args(interface: &str, peer_ip: Ipv4Addr) -> Vec<String> {
    vec![
        "route".into(),
        "del".into(),
        format!("{}/32", peer_ip),
        "dev".into(),
        interface.into(),
    ]
}

fn multicast_route_args(interface: &str) -> Vec<String> {
    vec![
        "route".into(),
        "replace".into(),
        MULTICAST_RANGE.into(),
        "dev".into(),
        interface.into(),
        "metric".into(),
        "1".into(),
    ]
}

fn multicast_route_del_args(interface: &str) -> Vec<String> {
    vec![
        "route".into(),
        "del".into(),
        MULTICAST_RANGE.into(),
        "dev".into(),
        interface.into(),
    ]
}

fn forwarding_args(interface: &str, enable: bool) -> Vec<String> {
    vec![
        "-w".into(),
        format!(
            "net.ipv4.conf.{}.forwarding={}",
            interface,
            if enable { 1 } else { 0 }
        ),
    ]
}

/// Allow rules for the virtual subnet: any protocol both directions,
/// plus explicit ICMP and IGMP. `add` selects insert vs delete.
fn firewall_rules(add: bool) -> Vec<Vec<String>> {
    let action = if add { "-I" } else { "-D" };
    let subnet = format!("{}/{}", VIRTUAL_SUBNET, VIRTUAL_PREFIX_LEN);

    let rule = |chain: &str, extra: &[&str], name: &str| -> Vec<String> {
        let mut args: Vec<String> = vec![action.into(), chain.into()];
        let direction = if chain == "INPUT" { "-s" } else { "-d" };
        args.push(direction.into());
        args.push(subnet.clone());
        args.extend(extra.iter().map(|s| s.to_string()));
        args.extend(
            ["-j", "ACCEPT", "-m", "comment", "--comment", name]
                .iter()
                .map(|s| s.to_string()),
        );
        args
    };

    vec![
        rule("INPUT", &[], "PeerBridge IN"),
        rule("OUTPUT", &[], "PeerBridge OUT"),
        rule("INPUT", &["-p", "icmp"], "PeerBridge ICMP"),
        rule("INPUT", &["-p", "igmp"], "PeerBridge IGMP IN"),
        rule("OUTPUT", &["-p", "igmp"], "PeerBridge IGMP OUT"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_and_route_commands_use_the_virtual_subnet() {
        let addr = addr_assign_args("pb0", Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(addr.join(" "), "addr replace 10.0.0.1/24 dev pb0");

        let route = subnet_route_args("pb0");
        assert_eq!(route.join(" "), "route replace 10.0.0.0/24 dev pb0 metric 1");

        let fallback = host_route_args("pb0", Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(fallback.join(" "), "route replace 10.0.0.2/32 dev pb0 metric 1");

        let multicast = multicast_route_args("pb0");
        assert_eq!(multicast.join(" "), "route replace 224.0.0.0/4 dev pb0 metric 1");
    }

    #[test]
    fn forwarding_toggles_per_interface() {
        assert_eq!(
            forwarding_args("pb0", true).join(" "),
            "-w net.ipv4.conf.pb0.forwarding=1"
        );
        assert_eq!(
            forwarding_args("pb0", false).join(" "),
            "-w net.ipv4.conf.pb0.forwarding=0"
        );
    }

    #[test]
    fn firewall_rule_set_is_symmetric() {
        let added = firewall_rules(true);
        let removed = firewall_rules(false);
        assert_eq!(added.len(), removed.len());

        for (add, del) in added.iter().zip(removed.iter()) {
            assert_eq!(add[0], "-I");
            assert_eq!(del[0], "-D");
            assert_eq!(&add[1..], &del[1..]);
        }

        // Any-protocol rules for both directions plus ICMP and IGMP
        let flat: Vec<String> = added.iter().map(|a| a.join(" ")).collect();
        assert!(flat.iter().any(|r| r.contains("INPUT -s 10.0.0.0/24 -j ACCEPT")));
        assert!(flat.iter().any(|r| r.contains("OUTPUT -d 10.0.0.0/24 -j ACCEPT")));
        assert!(flat.iter().any(|r| r.contains("-p icmp")));
        assert!(flat.iter().filter(|r| r.contains("-p igmp")).count() == 2);
    }

    #[test]
    fn removal_args_mirror_install_args() {
        assert_eq!(
            subnet_route_del_args("pb0").join(" "),
            "route del 10.0.0.0/24 dev pb0"
        );
        assert_eq!(
            host_route_del_args("pb0", Ipv4Addr::new(10, 0, 0, 1)).join(" "),
            "route del 10.0.0.1/32 dev pb0"
        );
        assert_eq!(
            multicast_route_del_args("pb0").join(" "),
            "route del 224.0.0.0/4 dev pb0"
        );
        assert_eq!(addr_flush_args("pb0").join(" "), "addr flush dev pb0");
    }
}
