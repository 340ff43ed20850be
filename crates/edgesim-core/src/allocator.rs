//! Automatic spec derivation from the fabric.
//!
//! When no explicit spec is given, every VLAN slice of every virtual network
//! is matched against the fabric's interface labels. Each matched attachment
//! point (fabric node + interface) becomes one SimNode named `serverN`, and
//! every VLAN landing on it becomes one attachment edge with an address from
//! the VLAN's IRB prefix or from a fallback L2 pool.
//!
//! The result depends only on the snapshot: virtual networks are visited by
//! name, interfaces by attachment point, and names are assigned after sorting.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;

use tracing::{debug, warn};

use crate::compiler::slugify;
use crate::error::{Error, Result};
use crate::fabric::{FabricSnapshot, VirtualNetwork};
use crate::pool::{gateway_of, IpPool};
use crate::spec::{ConciseAttachment, ConciseSimNode, ConciseSpec, SimulationSpec};

/// Image used by synthesized SimNodes.
pub const DEFAULT_IMAGE: &str = "ghcr.io/srl-labs/network-multitool:v0.4.1";
/// Type used by synthesized SimNodes.
pub const DEFAULT_NODE_TYPE: &str = "Linux";
/// Workload interface used by synthesized SimNodes.
pub const DEFAULT_SIM_INTERFACE: &str = "eth1";

/// A non-fatal problem met while allocating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationIssue {
    /// A VLAN selector matched no interface.
    NoMatchingInterfaces {
        /// Virtual network name.
        network: String,
        /// VLAN slice name.
        vlan: String,
    },
    /// A matched interface has no usable first member.
    MissingEndpoint {
        /// Virtual network name.
        network: String,
        /// Interface resource name.
        interface: String,
    },
    /// An address pool ran dry; the whole network was dropped.
    PoolExhausted {
        /// Virtual network name.
        network: String,
        /// VLAN slice name.
        vlan: String,
        /// Subnet of the exhausted pool.
        pool: String,
    },
    /// An IRB prefix could not be parsed; its bridge domain gets no pool.
    InvalidPrefix {
        /// Virtual network name.
        network: String,
        /// Offending prefix.
        prefix: String,
    },
    /// A VLAN slice would land on an attachment point already carrying the
    /// same VLAN id; the slice seen first, by network name, is kept.
    DuplicateAttachment {
        /// Virtual network name.
        network: String,
        /// VLAN slice name.
        vlan: String,
        /// Interface resource name.
        interface: String,
    },
}

impl fmt::Display for AllocationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMatchingInterfaces { network, vlan } => {
                write!(f, "{network}/{vlan}: interface selector matched no interfaces")
            }
            Self::MissingEndpoint { network, interface } => {
                write!(f, "{network}: interface {interface} has no node/interface member")
            }
            Self::PoolExhausted { network, vlan, pool } => {
                write!(f, "{network}/{vlan}: address pool {pool} exhausted, network dropped")
            }
            Self::InvalidPrefix { network, prefix } => {
                write!(f, "{network}: invalid IRB prefix '{prefix}'")
            }
            Self::DuplicateAttachment { network, vlan, interface } => {
                write!(f, "{network}/{vlan}: {interface} already carries this VLAN, slice skipped")
            }
        }
    }
}

/// One derived attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoAttachment {
    /// Virtual network the VLAN belongs to.
    pub virtual_network: String,
    /// VLAN slice name.
    pub vlan_name: String,
    /// VLAN id as declared.
    pub vlan_id: Option<String>,
    /// Interface resource name.
    pub interface_name: String,
    /// Fabric node of the attachment point.
    pub fabric_node: String,
    /// Fabric interface of the attachment point.
    pub fabric_interface: String,
    /// Assigned SimNode name.
    pub sim_name: String,
    /// Assigned address.
    pub ip_address: Option<String>,
    /// Gateway of the pool the address came from.
    pub gateway: Option<String>,
}

impl AutoAttachment {
    fn sort_key(&self) -> (&str, &str, &str, &str, &str) {
        (
            &self.fabric_node,
            &self.fabric_interface,
            &self.virtual_network,
            &self.vlan_name,
            &self.interface_name,
        )
    }
}

/// Result of automatic allocation.
#[derive(Debug, Clone)]
pub struct AutoPlan {
    /// Synthesized spec in the concise shape.
    pub spec: ConciseSpec,
    /// Attachments sorted by attachment point.
    pub attachments: Vec<AutoAttachment>,
    /// Non-fatal issues, in the order they were met.
    pub issues: Vec<AllocationIssue>,
}

impl AutoPlan {
    /// SimNode names, in `serverN` order.
    pub fn sim_node_names(&self) -> Vec<&str> {
        self.spec.sim_nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// The synthesized spec as a YAML value.
    pub fn to_value(&self) -> Result<serde_yaml::Value> {
        Ok(serde_yaml::to_value(&self.spec)?)
    }

    /// Runs the synthesized spec through the regular spec model.
    pub fn to_spec(&self, fabric: Option<&FabricSnapshot>) -> Result<SimulationSpec> {
        SimulationSpec::parse(&self.to_value()?, fabric)
    }
}

/// Address pools of one run, shared by every virtual network.
#[derive(Debug, Clone, Default)]
struct PoolState {
    issued: BTreeSet<Ipv4Addr>,
    fallback: BTreeMap<u16, IpPool>,
    seen: BTreeSet<(String, String)>,
    /// (node, interface, slugged VLAN id) of every kept attachment. Link
    /// names are derived from exactly these parts.
    links: BTreeSet<(String, String, Option<String>)>,
}

/// Derives a plan from the fabric snapshot.
pub fn build_auto_plan(fabric: &FabricSnapshot) -> Result<AutoPlan> {
    if fabric.virtual_networks.is_empty() {
        return Err(Error::allocation("no VirtualNetwork resources found in fabric", Vec::new()));
    }
    if fabric.interfaces.is_empty() {
        return Err(Error::allocation("no Interface resources found in fabric", Vec::new()));
    }

    let mut networks: Vec<&VirtualNetwork> = fabric.virtual_networks.iter().collect();
    networks.sort_by(|a, b| a.name.cmp(&b.name));

    // Gateways are never handed out, whichever pool they would come from.
    let mut state = PoolState {
        issued: networks
            .iter()
            .flat_map(|vn| vn.irb_interfaces.iter())
            .flat_map(|irb| irb.prefixes.iter())
            .filter_map(|p| gateway_of(&p.prefix))
            .collect(),
        ..Default::default()
    };

    let mut issues = Vec::new();
    let mut attachments = Vec::new();

    for vn in networks {
        let mut staged_state = state.clone();
        match allocate_network(fabric, vn, &mut staged_state, &mut issues) {
            Some(staged) => {
                state = staged_state;
                attachments.extend(staged);
            }
            None => warn!(network = %vn.name, "dropping virtual network after pool exhaustion"),
        }
    }

    if attachments.is_empty() {
        return Err(Error::allocation(
            "no interfaces matched any VLAN selector; nothing to attach",
            issues,
        ));
    }

    attachments.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    assign_server_names(&mut attachments);

    let spec = synthesize_spec(&attachments);
    debug!(
        sim_nodes = spec.sim_nodes.len(),
        attachments = attachments.len(),
        issues = issues.len(),
        "auto plan built"
    );
    Ok(AutoPlan {
        spec,
        attachments,
        issues,
    })
}

/// Allocates one virtual network against `state`. Returns `None` when a pool
/// ran dry, in which case `state` must be discarded by the caller.
fn allocate_network(
    fabric: &FabricSnapshot,
    vn: &VirtualNetwork,
    state: &mut PoolState,
    issues: &mut Vec<AllocationIssue>,
) -> Option<Vec<AutoAttachment>> {
    let mut irb_pools: BTreeMap<&str, IpPool> = BTreeMap::new();
    let mut unpooled: BTreeSet<&str> = BTreeSet::new();
    for irb in &vn.irb_interfaces {
        let Some(prefix) = irb.primary_prefix() else { continue };
        match IpPool::from_gateway_prefix(prefix) {
            Ok(pool) => {
                irb_pools.insert(irb.bridge_domain.as_str(), pool);
            }
            Err(_) => {
                warn!(network = %vn.name, %prefix, "invalid IRB prefix, bridge domain left unaddressed");
                unpooled.insert(irb.bridge_domain.as_str());
                issues.push(AllocationIssue::InvalidPrefix {
                    network: vn.name.clone(),
                    prefix: prefix.to_string(),
                });
            }
        }
    }

    let mut staged = Vec::new();
    for vlan in &vn.vlans {
        if vlan.selectors.is_empty() {
            continue;
        }
        let matched = fabric.matching_interfaces(&vlan.selectors);
        if matched.is_empty() {
            warn!(network = %vn.name, vlan = %vlan.name, "interface selector matched no interfaces");
            issues.push(AllocationIssue::NoMatchingInterfaces {
                network: vn.name.clone(),
                vlan: vlan.name.clone(),
            });
            continue;
        }

        for iface in matched {
            if !state.seen.insert((vlan.name.clone(), iface.name.clone())) {
                continue;
            }
            let Some(member) = iface.primary_member() else {
                issues.push(AllocationIssue::MissingEndpoint {
                    network: vn.name.clone(),
                    interface: iface.name.clone(),
                });
                continue;
            };

            let link = (
                member.node.clone(),
                member.interface.clone(),
                vlan.vlan_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(slugify),
            );
            if state.links.contains(&link) {
                warn!(network = %vn.name, vlan = %vlan.name, interface = %iface.name, "duplicate attachment skipped");
                issues.push(AllocationIssue::DuplicateAttachment {
                    network: vn.name.clone(),
                    vlan: vlan.name.clone(),
                    interface: iface.name.clone(),
                });
                continue;
            }

            let bridge_domain = vlan.bridge_domain.as_deref();
            let unaddressed = bridge_domain.is_some_and(|bd| unpooled.contains(bd));
            let irb_pool = bridge_domain.and_then(|bd| irb_pools.get_mut(bd));
            let pool = match (irb_pool, vlan.numeric_id()) {
                (Some(pool), _) => Some(pool),
                (None, _) if unaddressed => None,
                (None, Some(id)) => match state.fallback.entry(id) {
                    Entry::Occupied(e) => Some(e.into_mut()),
                    Entry::Vacant(e) => IpPool::fallback_for_vlan(id).ok().map(|p| e.insert(p)),
                },
                (None, None) => None,
            };

            let (ip_address, gateway) = match pool {
                Some(pool) => match pool.allocate(&mut state.issued) {
                    Some(ip) => (Some(ip), pool.gateway().map(|g| g.to_string())),
                    None => {
                        issues.push(AllocationIssue::PoolExhausted {
                            network: vn.name.clone(),
                            vlan: vlan.name.clone(),
                            pool: pool.network().to_string(),
                        });
                        return None;
                    }
                },
                None => (None, None),
            };

            state.links.insert(link);
            staged.push(AutoAttachment {
                virtual_network: vn.name.clone(),
                vlan_name: vlan.name.clone(),
                vlan_id: vlan.vlan_id.clone(),
                interface_name: iface.name.clone(),
                fabric_node: member.node.clone(),
                fabric_interface: member.interface.clone(),
                sim_name: String::new(),
                ip_address,
                gateway,
            });
        }
    }
    Some(staged)
}

fn assign_server_names(attachments: &mut [AutoAttachment]) {
    let points: BTreeSet<(String, String)> = attachments
        .iter()
        .map(|a| (a.fabric_node.clone(), a.fabric_interface.clone()))
        .collect();
    let names: BTreeMap<(String, String), String> = points
        .into_iter()
        .enumerate()
        .map(|(index, point)| (point, format!("server{}", index + 1)))
        .collect();
    for att in attachments.iter_mut() {
        if let Some(name) = names.get(&(att.fabric_node.clone(), att.fabric_interface.clone())) {
            att.sim_name = name.clone();
        }
    }
}

fn synthesize_spec(attachments: &[AutoAttachment]) -> ConciseSpec {
    let mut spec = ConciseSpec::default();
    let mut declared = BTreeSet::new();

    for att in attachments {
        if declared.insert(att.sim_name.clone()) {
            spec.sim_nodes.push(ConciseSimNode {
                name: att.sim_name.clone(),
                image: DEFAULT_IMAGE.to_string(),
                node_type: DEFAULT_NODE_TYPE.to_string(),
                interface: Some(DEFAULT_SIM_INTERFACE.to_string()),
                vlan: att.vlan_id.clone(),
                ip_address: att.ip_address.clone(),
                gateway: att.gateway.clone(),
            });
        }
        spec.topology.push(ConciseAttachment {
            node: att.fabric_node.clone(),
            interface: att.fabric_interface.clone(),
            sim_node: att.sim_name.clone(),
            sim_node_interface: DEFAULT_SIM_INTERFACE.to_string(),
            vlan: att.vlan_id.clone(),
            ip_address: att.ip_address.clone(),
            gateway: att.gateway.clone(),
        });
    }
    spec
}
