//! Snapshot of the live fabric.
//!
//! The snapshot carries only what the allocator and the validator need: node
//! names, interfaces with their labels and members, and virtual networks with
//! their VLAN slices and IRB interfaces. It is built either from the JSON lists
//! returned by the cluster API or from a fabric topology document on disk.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;

use crate::error::{Error, Result};

/// One endpoint of a fabric interface.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct InterfaceMember {
    /// Fabric node hosting the interface.
    pub node: String,
    /// Interface name on that node, e.g. `ethernet-1-1`.
    pub interface: String,
}

/// A fabric interface resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FabricInterface {
    /// Resource name.
    pub name: String,
    /// Labels used by VLAN interface selectors.
    pub labels: BTreeMap<String, String>,
    /// Members in declared order; the first one is the attachment point.
    pub members: Vec<InterfaceMember>,
}

impl FabricInterface {
    /// Returns the first member when it names both a node and an interface.
    pub fn primary_member(&self) -> Option<&InterfaceMember> {
        self.members
            .first()
            .filter(|member| !member.node.is_empty() && !member.interface.is_empty())
    }

    /// Returns true if this interface satisfies any of `selectors`.
    pub fn matches_any(&self, selectors: &[String]) -> bool {
        selectors.iter().any(|selector| self.matches(selector))
    }

    /// Evaluates one `key` or `key=value` selector against the labels.
    pub fn matches(&self, selector: &str) -> bool {
        match selector.split_once('=') {
            Some((key, value)) => {
                let key = key.trim();
                !key.is_empty() && self.labels.get(key).map(String::as_str) == Some(value.trim())
            }
            None => {
                let key = selector.trim();
                !key.is_empty() && self.labels.contains_key(key)
            }
        }
    }

    fn sort_key(&self) -> (String, String, String) {
        let (node, interface) = self
            .primary_member()
            .map(|m| (m.node.clone(), m.interface.clone()))
            .unwrap_or_default();
        (node, interface, self.name.clone())
    }
}

/// A VLAN slice of a virtual network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VlanSlice {
    /// Slice name.
    pub name: String,
    /// Bridge domain the slice belongs to.
    pub bridge_domain: Option<String>,
    /// VLAN id as declared; may be non-numeric (e.g. `pool`).
    pub vlan_id: Option<String>,
    /// Interface selector expressions.
    pub selectors: Vec<String>,
}

impl VlanSlice {
    /// Returns the VLAN id when it is a valid 802.1Q id.
    pub fn numeric_id(&self) -> Option<u16> {
        self.vlan_id
            .as_deref()
            .and_then(|id| id.trim().parse::<u16>().ok())
            .filter(|id| (1..=4094).contains(id))
    }
}

/// An IPv4 prefix configured on an IRB interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrbPrefix {
    /// Gateway address with prefix length, e.g. `10.20.1.254/24`.
    pub prefix: String,
    /// Whether the prefix is marked primary.
    pub primary: bool,
}

/// A routed interface bound to a bridge domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrbInterface {
    /// Bridge domain this IRB serves.
    pub bridge_domain: String,
    /// Configured IPv4 prefixes.
    pub prefixes: Vec<IrbPrefix>,
}

impl IrbInterface {
    /// The primary prefix, or the last one listed when none is marked.
    pub fn primary_prefix(&self) -> Option<&str> {
        self.prefixes
            .iter()
            .find(|p| p.primary)
            .or_else(|| self.prefixes.last())
            .map(|p| p.prefix.as_str())
    }
}

/// A virtual network with its VLAN slices and IRB interfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualNetwork {
    /// Resource name.
    pub name: String,
    /// VLAN slices in declared order.
    pub vlans: Vec<VlanSlice>,
    /// IRB interfaces in declared order.
    pub irb_interfaces: Vec<IrbInterface>,
}

/// What the fabric looks like right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FabricSnapshot {
    /// Names of fabric nodes.
    pub nodes: BTreeSet<String>,
    /// Interface resources.
    pub interfaces: Vec<FabricInterface>,
    /// Virtual network resources.
    pub virtual_networks: Vec<VirtualNetwork>,
}

impl FabricSnapshot {
    /// Builds a snapshot from the three JSON lists the cluster API returns
    /// for toponodes, interfaces and virtual networks.
    pub fn from_resource_lists(nodes: &str, interfaces: &str, virtual_networks: &str) -> Result<Self> {
        let nodes: raw::List<raw::Named> = parse_list(nodes, "toponodes")?;
        let interfaces: raw::List<raw::Interface> = parse_list(interfaces, "interfaces")?;
        let networks: raw::List<raw::VirtualNetwork> = parse_list(virtual_networks, "virtualnetworks")?;

        let mut snapshot = Self {
            nodes: nodes
                .items
                .into_iter()
                .map(|n| n.metadata.name)
                .filter(|name| !name.is_empty())
                .collect(),
            interfaces: interfaces.items.into_iter().map(raw::Interface::into_model).collect(),
            virtual_networks: networks
                .items
                .into_iter()
                .map(raw::VirtualNetwork::into_model)
                .collect(),
        };
        snapshot.absorb_member_nodes();
        Ok(snapshot)
    }

    /// Builds a snapshot from a fabric topology document.
    ///
    /// Node names come from `items[].spec.nodes[].name` and from the
    /// endpoints of `items[].spec.links`. Topology documents carry no
    /// interface or virtual network resources.
    pub fn from_topology_document(doc: &Value) -> Result<Self> {
        let items = doc
            .get("items")
            .and_then(Value::as_sequence)
            .ok_or_else(|| Error::parse("fabric topology must contain an 'items' list"))?;

        let mut snapshot = Self::default();
        for item in items {
            if let Some(spec) = item.get("spec") {
                snapshot.absorb_topology_spec(spec);
            }
        }
        Ok(snapshot)
    }

    /// Loads a fabric topology document from disk.
    pub fn load_topology_file(path: &Path) -> Result<Self> {
        let doc = crate::spec::read_yaml(path)?;
        Self::from_topology_document(&doc)
    }

    /// Adds the nodes and link endpoints of one topology item spec.
    pub(crate) fn absorb_topology_spec(&mut self, spec: &Value) {
        if let Some(nodes) = spec.get("nodes").and_then(Value::as_sequence) {
            for node in nodes {
                if let Some(name) = node.get("name").and_then(Value::as_str) {
                    if !name.is_empty() {
                        self.nodes.insert(name.to_string());
                    }
                }
            }
        }

        if let Some(links) = spec.get("links").and_then(Value::as_sequence) {
            for link in links {
                // Either a bare link or a TopoLink-like entry with spec.links.
                let inner = link
                    .get("spec")
                    .and_then(|s| s.get("links"))
                    .and_then(Value::as_sequence);
                match inner {
                    Some(entries) => entries.iter().for_each(|e| self.absorb_link_endpoints(e)),
                    None => self.absorb_link_endpoints(link),
                }
            }
        }
    }

    fn absorb_link_endpoints(&mut self, link: &Value) {
        for side in ["local", "remote"] {
            if let Some(node) = link.get(side).and_then(|e| e.get("node")).and_then(Value::as_str) {
                if !node.is_empty() {
                    self.nodes.insert(node.to_string());
                }
            }
        }
    }

    fn absorb_member_nodes(&mut self) {
        let members: Vec<String> = self
            .interfaces
            .iter()
            .flat_map(|iface| iface.members.iter().map(|m| m.node.clone()))
            .filter(|node| !node.is_empty())
            .collect();
        self.nodes.extend(members);
    }

    /// Returns true if the snapshot holds nothing at all.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.interfaces.is_empty() && self.virtual_networks.is_empty()
    }

    /// Returns true if `node` is a known fabric node.
    pub fn has_node(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }

    /// Known fabric node names, sorted.
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(String::as_str).collect()
    }

    /// Interfaces matching any selector, in (node, interface, name) order.
    pub fn matching_interfaces(&self, selectors: &[String]) -> Vec<&FabricInterface> {
        let mut matched: Vec<&FabricInterface> = self
            .interfaces
            .iter()
            .filter(|iface| iface.matches_any(selectors))
            .collect();
        matched.sort_by_cached_key(|iface| iface.sort_key());
        matched
    }
}

fn parse_list<T: for<'de> Deserialize<'de>>(text: &str, what: &str) -> Result<raw::List<T>> {
    if text.trim().is_empty() {
        return Ok(raw::List { items: Vec::new() });
    }
    serde_json::from_str(text).map_err(|e| Error::parse(format!("{what}: {e}")))
}

/// Wire shapes of the cluster resources, tolerant of missing fields.
mod raw {
    use std::collections::BTreeMap;

    use serde::Deserialize;

    use super::{FabricInterface, InterfaceMember, IrbInterface, IrbPrefix, VlanSlice};

    #[derive(Debug, Deserialize)]
    pub struct List<T> {
        #[serde(default = "Vec::new")]
        pub items: Vec<T>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct Metadata {
        pub name: String,
        pub labels: BTreeMap<String, String>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct Named {
        pub metadata: Metadata,
    }

    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    pub enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    impl OneOrMany {
        fn into_vec(self) -> Vec<String> {
            let items = match self {
                OneOrMany::One(s) => vec![s],
                OneOrMany::Many(v) => v,
            };
            items.into_iter().filter(|s| !s.trim().is_empty()).collect()
        }
    }

    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    pub enum Scalar {
        Int(i64),
        Str(String),
    }

    impl Scalar {
        fn into_string(self) -> String {
            match self {
                Scalar::Int(v) => v.to_string(),
                Scalar::Str(s) => s,
            }
        }
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct Member {
        pub node: String,
        pub interface: String,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct InterfaceSpec {
        pub members: Vec<Member>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct Interface {
        pub metadata: Metadata,
        pub spec: InterfaceSpec,
    }

    impl Interface {
        pub fn into_model(self) -> FabricInterface {
            FabricInterface {
                name: self.metadata.name,
                labels: self.metadata.labels,
                members: self
                    .spec
                    .members
                    .into_iter()
                    .map(|m| InterfaceMember {
                        node: m.node,
                        interface: m.interface,
                    })
                    .collect(),
            }
        }
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct VlanSpec {
        pub bridge_domain: Option<String>,
        pub interface_selector: Option<OneOrMany>,
        #[serde(rename = "vlanID", alias = "vlanId")]
        pub vlan_id: Option<Scalar>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct Vlan {
        pub name: String,
        pub spec: VlanSpec,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct Ipv4Address {
        pub ip_prefix: Option<String>,
        pub primary: Option<bool>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct IpAddress {
        pub ipv4_address: Option<Ipv4Address>,
        pub primary: Option<bool>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct IrbSpec {
        pub bridge_domain: Option<String>,
        pub ip_addresses: Vec<IpAddress>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct Irb {
        pub name: String,
        pub spec: IrbSpec,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct VirtualNetworkSpec {
        pub vlans: Vec<Vlan>,
        pub irb_interfaces: Vec<Irb>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct VirtualNetwork {
        pub metadata: Metadata,
        pub spec: VirtualNetworkSpec,
    }

    impl VirtualNetwork {
        pub fn into_model(self) -> super::VirtualNetwork {
            let vlans = self
                .spec
                .vlans
                .into_iter()
                .map(|vlan| VlanSlice {
                    name: vlan.name,
                    bridge_domain: vlan.spec.bridge_domain.filter(|bd| !bd.is_empty()),
                    vlan_id: vlan.spec.vlan_id.map(Scalar::into_string),
                    selectors: vlan
                        .spec
                        .interface_selector
                        .map(OneOrMany::into_vec)
                        .unwrap_or_default(),
                })
                .collect();

            let irb_interfaces = self
                .spec
                .irb_interfaces
                .into_iter()
                .filter_map(|irb| {
                    let bridge_domain = irb.spec.bridge_domain.filter(|bd| !bd.is_empty())?;
                    let prefixes = irb
                        .spec
                        .ip_addresses
                        .into_iter()
                        .filter_map(|entry| {
                            let v4 = entry.ipv4_address?;
                            let prefix = v4.ip_prefix.filter(|p| !p.is_empty())?;
                            let primary = v4.primary.or(entry.primary).unwrap_or(false);
                            Some(IrbPrefix { prefix, primary })
                        })
                        .collect();
                    Some(IrbInterface {
                        bridge_domain,
                        prefixes,
                    })
                })
                .collect();

            super::VirtualNetwork {
                name: self.metadata.name,
                vlans,
                irb_interfaces,
            }
        }
    }
}
