//! Manifest compiler.
//!
//! [`compile`] is a pure function of the simulation spec and the target namespace: the
//! same input always yields the same documents, the same names and the same
//! rendered text.

use std::fmt;
use std::path::Path;

use serde_yaml::{Mapping, Value};

use crate::error::Result;
use crate::manifest::{
    Document, Endpoint, LinkSpec, ObjectMeta, Resource, ResourceKind, SimLinkEntry, TopoLinkEntry, API_GROUP,
    ROLE_LABEL_KEY,
};
use crate::spec::{AttachmentSpec, SimNodeSpec, SimulationSpec};

/// Separator between rendered documents.
pub const DOCUMENT_SEPARATOR: &str = "\n---\n";

/// Port exposed by Linux SimNodes.
pub const LINUX_SIMNODE_PORT: u64 = 57400;

/// Kind and name of one rendered document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceSummary {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource name.
    pub name: String,
}

impl ResourceSummary {
    /// Fully-qualified reference, e.g. `simnode.core.eda.nokia.com/server1`.
    pub fn qualified(&self) -> String {
        format!("{}.{}/{}", self.kind.resource(), API_GROUP, self.name)
    }
}

impl fmt::Display for ResourceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Address configuration applied inside a SimNode after it becomes ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInterfaceConfig {
    /// SimNode name; also the container name inside the pod.
    pub name: String,
    /// Parent interface inside the workload.
    pub interface: String,
    /// Address with prefix length.
    pub ip_address: String,
    /// VLAN sub-interface to create, if any.
    pub vlan: Option<String>,
    /// Default gateway, if any.
    pub gateway: Option<String>,
}

impl NodeInterfaceConfig {
    /// Device the address lands on: `eth1.201` with a VLAN, `eth1` without.
    pub fn device(&self) -> String {
        match &self.vlan {
            Some(vlan) => format!("{}.{}", self.interface, vlan),
            None => self.interface.clone(),
        }
    }
}

/// Everything produced by one compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledBundle {
    /// Documents in apply order: SimNodes, SimLinks, TopoLinks.
    pub resources: Vec<Resource>,
    /// Interface configurations in node order.
    pub node_configs: Vec<NodeInterfaceConfig>,
    /// SimNode names in declaration order.
    pub sim_nodes: Vec<String>,
    /// Namespace the documents target.
    pub namespace: String,
}

impl CompiledBundle {
    /// Kind and name of every document, in apply order.
    pub fn summaries(&self) -> Vec<ResourceSummary> {
        self.resources
            .iter()
            .map(|r| ResourceSummary {
                kind: r.kind(),
                name: r.name().to_string(),
            })
            .collect()
    }

    /// Names grouped by kind, in apply order.
    pub fn names_by_kind(&self) -> Vec<(ResourceKind, Vec<String>)> {
        ResourceKind::ALL
            .iter()
            .map(|kind| {
                let names = self
                    .resources
                    .iter()
                    .filter(|r| r.kind() == *kind)
                    .map(|r| r.name().to_string())
                    .collect();
                (*kind, names)
            })
            .collect()
    }

    /// Interface configurations of one node.
    pub fn configs_for<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a NodeInterfaceConfig> + 'a {
        self.node_configs.iter().filter(move |c| c.name == node)
    }

    /// Renders every document as one multi-document YAML text.
    pub fn render(&self) -> Result<String> {
        let docs = self
            .resources
            .iter()
            .map(|r| r.to_yaml().map(|y| y.trim_end().to_string()))
            .collect::<Result<Vec<_>>>()?;
        let mut text = docs.join(DOCUMENT_SEPARATOR);
        text.push('\n');
        Ok(text)
    }

    /// Renders and writes the bundle to `path`, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<String> {
        let text = self.render()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &text)?;
        Ok(text)
    }
}

/// Compiles a spec into its resource documents.
pub fn compile(spec: &SimulationSpec, namespace: &str) -> CompiledBundle {
    let mut resources = Vec::with_capacity(spec.nodes.len() + 2 * spec.attachments.len());

    for node in &spec.nodes {
        resources.push(render_sim_node(node, namespace));
    }
    for att in &spec.attachments {
        resources.push(render_sim_link(att, namespace));
    }
    for att in &spec.attachments {
        resources.push(render_topo_link(att, namespace));
    }

    let node_configs = spec.nodes.iter().flat_map(|node| interface_configs(spec, node)).collect();

    CompiledBundle {
        resources,
        node_configs,
        sim_nodes: spec.nodes.iter().map(|n| n.name.clone()).collect(),
        namespace: namespace.to_string(),
    }
}

/// Lower-cases and maps every non-alphanumeric run to a single `-`.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "sim".to_string()
    } else {
        slug.to_string()
    }
}

/// Name shared by the SimLink and TopoLink of one attachment.
pub fn link_name(att: &AttachmentSpec) -> String {
    let mut name = format!(
        "{}-{}-{}",
        slugify(&att.fabric_node),
        slugify(&att.fabric_interface),
        slugify(&att.sim_node)
    );
    if let Some(vlan) = &att.vlan {
        name.push('-');
        name.push_str(&slugify(vlan));
    }
    name
}

fn endpoint(node: &str, interface: &str) -> Endpoint {
    Endpoint {
        node: node.to_string(),
        interface: interface.to_string(),
        interface_resource: format!("{}-{}", slugify(node), slugify(interface)),
    }
}

fn render_sim_node(node: &SimNodeSpec, namespace: &str) -> Resource {
    let mut metadata = ObjectMeta::managed(&node.name, namespace);
    for (key, value) in &node.labels {
        metadata.labels.entry(key.clone()).or_insert_with(|| value.clone());
    }
    metadata.annotations = node.annotations.clone();

    let image = Value::from(node.image.as_str());
    let os = Value::from(node.node_type.to_lowercase());

    let mut body = Mapping::new();
    body.insert("containerImage".into(), image.clone());
    body.insert("operatingSystem".into(), os.clone());
    body.insert("dhcp".into(), Value::Mapping(Mapping::new()));
    if node.is_linux() {
        body.insert("port".into(), Value::from(LINUX_SIMNODE_PORT));
        body.insert("serialNumberPath".into(), Value::from(""));
        body.insert("versionPath".into(), Value::from(""));
    }
    for (key, value) in &node.schema_fields {
        body.insert(key.clone(), value.clone());
    }
    body.insert("containerImage".into(), image);
    body.insert("operatingSystem".into(), os);

    Resource::SimNode(Document::new(ResourceKind::SimNode, metadata, body))
}

fn render_sim_link(att: &AttachmentSpec, namespace: &str) -> Resource {
    Resource::SimLink(Document::new(
        ResourceKind::SimLink,
        ObjectMeta::managed(link_name(att), namespace),
        LinkSpec {
            links: vec![SimLinkEntry {
                local: endpoint(&att.fabric_node, &att.fabric_interface),
                sim: endpoint(&att.sim_node, &att.sim_interface),
            }],
        },
    ))
}

fn render_topo_link(att: &AttachmentSpec, namespace: &str) -> Resource {
    let mut metadata = ObjectMeta::managed(link_name(att), namespace);
    metadata.labels.insert(ROLE_LABEL_KEY.to_string(), "edge".to_string());
    Resource::TopoLink(Document::new(
        ResourceKind::TopoLink,
        metadata,
        LinkSpec {
            links: vec![TopoLinkEntry {
                link_type: "edge".to_string(),
                local: endpoint(&att.fabric_node, &att.fabric_interface),
                remote: endpoint(&att.sim_node, &att.sim_interface),
            }],
        },
    ))
}

fn interface_configs(spec: &SimulationSpec, node: &SimNodeSpec) -> Vec<NodeInterfaceConfig> {
    let attachments: Vec<&AttachmentSpec> = spec.attachments_for(&node.name).collect();

    let addressed: Vec<NodeInterfaceConfig> = attachments
        .iter()
        .filter_map(|att| {
            let ip = att.ip_address.clone()?;
            Some(NodeInterfaceConfig {
                name: node.name.clone(),
                interface: node.interface.clone().unwrap_or_else(|| att.sim_interface.clone()),
                ip_address: ip,
                vlan: att.vlan.clone().or_else(|| node.vlan.clone()),
                gateway: att.gateway.clone(),
            })
        })
        .collect();
    if !addressed.is_empty() {
        return addressed;
    }

    let Some(ip) = node.ip_address.clone() else {
        return Vec::new();
    };
    let Some(interface) = node
        .interface
        .clone()
        .or_else(|| attachments.first().map(|a| a.sim_interface.clone()))
    else {
        tracing::debug!(node = %node.name, "node address has no interface to land on");
        return Vec::new();
    };
    vec![NodeInterfaceConfig {
        name: node.name.clone(),
        interface,
        ip_address: ip,
        vlan: node
            .vlan
            .clone()
            .or_else(|| attachments.iter().find_map(|a| a.vlan.clone())),
        gateway: node.gateway.clone(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEAF1_SPEC: &str = r#"
simNodes:
  - name: edge1
    image: img
    type: Linux
    ip: 10.0.0.10/24
    vlan: 100
topology:
  - node: leaf1
    interface: ethernet-1-1
    simNode: edge1
    simNodeInterface: eth1
    vlan: 100
"#;

    fn spec(text: &str) -> SimulationSpec {
        SimulationSpec::from_yaml_str(text, None).unwrap()
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Leaf1"), "leaf1");
        assert_eq!(slugify("ethernet-1/1"), "ethernet-1-1");
        assert_eq!(slugify("a__b..c"), "a-b-c");
        assert_eq!(slugify("--x--"), "x");
        assert_eq!(slugify("///"), "sim");
    }

    #[test]
    fn test_single_attachment_bundle() {
        let bundle = compile(&spec(LEAF1_SPEC), "eda");
        let summaries: Vec<String> = bundle.summaries().iter().map(|s| s.to_string()).collect();
        assert_eq!(
            summaries,
            vec![
                "SimNode/edge1",
                "SimLink/leaf1-ethernet-1-1-edge1-100",
                "TopoLink/leaf1-ethernet-1-1-edge1-100",
            ]
        );
        assert_eq!(
            bundle.node_configs,
            vec![NodeInterfaceConfig {
                name: "edge1".into(),
                interface: "eth1".into(),
                ip_address: "10.0.0.10/24".into(),
                vlan: Some("100".into()),
                gateway: None,
            }]
        );
        assert_eq!(bundle.node_configs[0].device(), "eth1.100");
    }

    #[test]
    fn test_compile_is_byte_identical() {
        let spec = spec(LEAF1_SPEC);
        let first = compile(&spec, "eda").render().unwrap();
        let second = compile(&spec, "eda").render().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.matches(DOCUMENT_SEPARATOR).count(), 2);
        assert!(first.ends_with('\n'));
        assert!(!first.ends_with("\n\n"));
    }

    #[test]
    fn test_sim_node_body_order_and_overrides() {
        let text = r#"
simNodes:
  - name: n1
    image: img
    type: Linux
    port: 1234
    ip: 10.0.0.1/24
    spec:
      containerImage: other
      version: "1.2"
      bogus: ignored
topology: [{node: leaf1, interface: e1, simNode: n1}]
"#;
        let bundle = compile(&spec(text), "eda");
        let Resource::SimNode(doc) = &bundle.resources[0] else { panic!("expected SimNode") };
        let keys: Vec<&str> = doc.spec.iter().filter_map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["containerImage", "operatingSystem", "dhcp", "port", "serialNumberPath", "versionPath", "version"]
        );
        assert_eq!(doc.spec.get("containerImage"), Some(&Value::from("img")));
        assert_eq!(doc.spec.get("operatingSystem"), Some(&Value::from("linux")));
        assert_eq!(doc.spec.get("port").and_then(Value::as_u64), Some(1234));

        let yaml = bundle.render().unwrap();
        assert!(!yaml.contains("10.0.0.1"));
        assert!(!yaml.contains("bogus"));
    }

    #[test]
    fn test_non_linux_node_has_no_linux_defaults() {
        let text = r#"
simNodes: [{name: r1, image: srl, type: SRL}]
topology: [{node: leaf1, interface: e1, simNode: r1}]
"#;
        let bundle = compile(&spec(text), "eda");
        let Resource::SimNode(doc) = &bundle.resources[0] else { panic!("expected SimNode") };
        assert!(doc.spec.get("port").is_none());
        assert_eq!(doc.spec.get("operatingSystem"), Some(&Value::from("srl")));
    }

    #[test]
    fn test_multi_vlan_attachment_configs() {
        let text = r#"
simNodes:
  - {name: server1, image: img, type: Linux, interface: eth1, vlan: "201", ipAddress: 10.20.1.1/24, gateway: 10.20.1.254}
topology:
  - {node: leaf1, interface: ethernet-1-1, simNode: server1, simNodeInterface: eth1, vlan: "201", ipAddress: 10.20.1.1/24, gateway: 10.20.1.254}
  - {node: leaf1, interface: ethernet-1-1, simNode: server1, simNodeInterface: eth1, vlan: "1001", ipAddress: 172.19.233.10/24}
"#;
        let bundle = compile(&spec(text), "eda");
        assert_eq!(bundle.resources.len(), 5);
        let devices: Vec<String> = bundle.configs_for("server1").map(|c| c.device()).collect();
        assert_eq!(devices, vec!["eth1.201", "eth1.1001"]);
        assert_eq!(bundle.node_configs[0].gateway.as_deref(), Some("10.20.1.254"));
        assert_eq!(bundle.node_configs[1].gateway, None);

        let grouped = bundle.names_by_kind();
        assert_eq!(grouped[1].1, vec!["leaf1-ethernet-1-1-server1-201", "leaf1-ethernet-1-1-server1-1001"]);
    }

    #[test]
    fn test_node_level_vlan_falls_back_to_attachment() {
        let text = r#"
simNodes: [{name: a, image: img, ip: 10.0.0.5/24}]
topology: [{node: leaf1, interface: e1, simNode: a, simNodeInterface: eth2, vlan: 7}]
"#;
        let bundle = compile(&spec(text), "eda");
        assert_eq!(bundle.node_configs[0].interface, "eth2");
        assert_eq!(bundle.node_configs[0].vlan.as_deref(), Some("7"));
    }

    #[test]
    fn test_write_to_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/bundle.yaml");
        let bundle = compile(&spec(LEAF1_SPEC), "eda");
        let text = bundle.write_to(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
    }

    #[test]
    fn test_qualified_summary() {
        let summary = ResourceSummary {
            kind: ResourceKind::SimNode,
            name: "server1".into(),
        };
        assert_eq!(summary.qualified(), "simnode.core.eda.nokia.com/server1");
    }
}
