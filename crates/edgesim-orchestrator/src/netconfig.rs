//! Shell scripts that land addresses inside SimNode workloads.

use std::net::Ipv4Addr;

use edgesim_core::NodeInterfaceConfig;

use crate::error::{OrchestratorError, Result};

/// Error fragments meaning the interface has not shown up yet.
const MISSING_DEVICE_MARKERS: [&str; 3] = ["Device \"", "Cannot find device", "does not exist"];

/// Returns true if `output` says the interface is not there yet.
pub fn is_missing_device(output: &str) -> bool {
    MISSING_DEVICE_MARKERS.iter().any(|m| output.contains(m))
}

/// Builder for `ip` command lines on one parent interface.
#[derive(Debug, Clone)]
pub(crate) struct IpCommand {
    interface: String,
}

impl IpCommand {
    /// Creates a new builder for `interface`.
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
        }
    }

    pub fn link_up(&self, device: &str) -> String {
        format!("ip link set {device} up")
    }

    /// Creates the VLAN sub-interface unless it already exists.
    pub fn ensure_vlan(&self, vlan: &str) -> String {
        let device = self.vlan_device(vlan);
        format!(
            "(ip link show {device} >/dev/null 2>&1 || ip link add link {} name {device} type vlan id {vlan})",
            self.interface
        )
    }

    pub fn flush(&self, device: &str) -> String {
        format!("ip addr flush dev {device}")
    }

    pub fn add_address(&self, device: &str, address: &str) -> String {
        format!("ip addr add {address} dev {device}")
    }

    pub fn default_route(&self, device: &str, gateway: &str) -> String {
        format!("ip route replace default via {gateway} dev {device}")
    }

    fn vlan_device(&self, vlan: &str) -> String {
        format!("{}.{}", self.interface, vlan)
    }
}

/// The script applying one [`NodeInterfaceConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceScript {
    device: String,
    script: String,
}

impl InterfaceScript {
    /// Validates the config and renders its script.
    ///
    /// Every value ends up in a shell command line, so each one is checked
    /// against the shape it is supposed to have.
    pub fn new(config: &NodeInterfaceConfig) -> Result<Self> {
        check_interface(&config.name, &config.interface)?;
        check_address(&config.name, &config.ip_address)?;
        if let Some(vlan) = &config.vlan {
            check_vlan(&config.name, vlan)?;
        }
        if let Some(gateway) = &config.gateway {
            gateway.parse::<Ipv4Addr>().map_err(|_| {
                OrchestratorError::configuration_failed(&config.name, format!("invalid gateway '{gateway}'"))
            })?;
        }

        let ip = IpCommand::new(&config.interface);
        let device = config.device();
        let mut steps = match &config.vlan {
            Some(vlan) => vec![
                ip.link_up(&config.interface),
                ip.ensure_vlan(vlan),
                ip.link_up(&device),
                ip.flush(&device),
                ip.add_address(&device, &config.ip_address),
            ],
            None => vec![
                ip.flush(&device),
                ip.add_address(&device, &config.ip_address),
                ip.link_up(&device),
            ],
        };
        if let Some(gateway) = &config.gateway {
            steps.push(ip.default_route(&device, gateway));
        }

        Ok(Self {
            script: steps.join(" && "),
            device,
        })
    }

    /// Device the address lands on.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// The rendered script.
    pub fn script(&self) -> &str {
        &self.script
    }
}

/// Script that shows one device's state, for debug output.
pub fn show_script(device: &str) -> String {
    format!("ip addr show {device}")
}

fn check_interface(node: &str, interface: &str) -> Result<()> {
    let valid = !interface.is_empty()
        && interface.len() <= 15
        && interface
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::configuration_failed(
            node,
            format!("invalid interface name '{interface}'"),
        ))
    }
}

fn check_address(node: &str, address: &str) -> Result<()> {
    let valid = match address.split_once('/') {
        Some((addr, len)) => addr.parse::<Ipv4Addr>().is_ok() && len.parse::<u8>().map(|l| l <= 32).unwrap_or(false),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::configuration_failed(
            node,
            format!("invalid address '{address}', expected a.b.c.d/len"),
        ))
    }
}

fn check_vlan(node: &str, vlan: &str) -> Result<()> {
    match vlan.parse::<u16>() {
        Ok(id) if (1..=4094).contains(&id) => Ok(()),
        _ => Err(OrchestratorError::configuration_failed(node, format!("invalid VLAN '{vlan}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(vlan: Option<&str>, gateway: Option<&str>) -> NodeInterfaceConfig {
        NodeInterfaceConfig {
            name: "server1".into(),
            interface: "eth1".into(),
            ip_address: "10.20.1.1/24".into(),
            vlan: vlan.map(Into::into),
            gateway: gateway.map(Into::into),
        }
    }

    #[test]
    fn test_vlan_script_with_gateway() {
        let script = InterfaceScript::new(&config(Some("201"), Some("10.20.1.254"))).unwrap();
        assert_eq!(script.device(), "eth1.201");
        assert_eq!(
            script.script(),
            "ip link set eth1 up && \
             (ip link show eth1.201 >/dev/null 2>&1 || ip link add link eth1 name eth1.201 type vlan id 201) && \
             ip link set eth1.201 up && \
             ip addr flush dev eth1.201 && \
             ip addr add 10.20.1.1/24 dev eth1.201 && \
             ip route replace default via 10.20.1.254 dev eth1.201"
        );
    }

    #[test]
    fn test_untagged_script() {
        let script = InterfaceScript::new(&config(None, None)).unwrap();
        assert_eq!(
            script.script(),
            "ip addr flush dev eth1 && ip addr add 10.20.1.1/24 dev eth1 && ip link set eth1 up"
        );
        assert_eq!(show_script(script.device()), "ip addr show eth1");
    }

    #[test]
    fn test_rejects_shell_metacharacters() {
        let mut bad = config(Some("201"), None);
        bad.interface = "eth1; reboot".into();
        assert!(InterfaceScript::new(&bad).is_err());

        let bad = config(Some("20 1"), None);
        assert!(InterfaceScript::new(&bad).is_err());

        let bad = config(None, Some("$(id)"));
        assert!(InterfaceScript::new(&bad).is_err());

        let mut bad = config(None, None);
        bad.ip_address = "10.0.0.1".into();
        assert!(InterfaceScript::new(&bad).is_err());
    }

    #[test]
    fn test_missing_device_detection() {
        assert!(is_missing_device("Cannot find device \"eth1\""));
        assert!(is_missing_device("Device \"eth1.201\" does not exist."));
        assert!(!is_missing_device("RTNETLINK answers: File exists"));
    }
}
