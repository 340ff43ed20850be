//! Simulation spec model.
//!
//! Two input shapes are accepted and normalized into [`SimulationSpec`]:
//!
//! - concise: top-level `simNodes` and `topology` lists, optionally nested
//!   under a top-level `spec` mapping;
//! - fabric-native: `items[].spec`, where each item spec carries
//!   `simNodes`/`topology` directly or under `simulation`, and may also carry
//!   the fabric's own `nodes`/`links`.
//!
//! Shape detection is based on the presence of a top-level `items` key.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::compiler::link_name;
use crate::error::{Error, Result, ValidationReport};
use crate::fabric::FabricSnapshot;

/// SimNode schema fields that may be passed through to the rendered resource.
pub const SIMNODE_ALLOWED_FIELDS: [&str; 13] = [
    "component",
    "containerImage",
    "dhcp",
    "imagePullSecret",
    "license",
    "operatingSystem",
    "platform",
    "platformPath",
    "port",
    "serialNumberPath",
    "version",
    "versionMatch",
    "versionPath",
];

/// Default operating-system class for SimNodes.
pub const DEFAULT_NODE_TYPE: &str = "linux";

/// A simulated workload node.
#[derive(Debug, Clone, PartialEq)]
pub struct SimNodeSpec {
    /// Unique node name.
    pub name: String,
    /// Container image.
    pub image: String,
    /// Operating-system class, e.g. `Linux`.
    pub node_type: String,
    /// Node-level IP address with prefix length.
    pub ip_address: Option<String>,
    /// Node-level VLAN.
    pub vlan: Option<String>,
    /// Interface inside the workload that carries the attachment.
    pub interface: Option<String>,
    /// Default gateway for the node-level address.
    pub gateway: Option<String>,
    /// Extra labels for the rendered resource.
    pub labels: BTreeMap<String, String>,
    /// Annotations for the rendered resource.
    pub annotations: BTreeMap<String, String>,
    /// Allowed schema fields given at the node's top level, then its `spec`
    /// overrides, in that order.
    pub schema_fields: Mapping,
}

impl SimNodeSpec {
    /// Returns true if the node runs Linux.
    pub fn is_linux(&self) -> bool {
        self.node_type.eq_ignore_ascii_case("linux")
    }
}

/// One attachment edge between a fabric interface and a SimNode interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentSpec {
    /// Fabric node.
    pub fabric_node: String,
    /// Interface on the fabric node.
    pub fabric_interface: String,
    /// SimNode name.
    pub sim_node: String,
    /// Interface on the SimNode.
    pub sim_interface: String,
    /// VLAN carried by this edge.
    pub vlan: Option<String>,
    /// Address for the SimNode side of this edge.
    pub ip_address: Option<String>,
    /// Gateway for the SimNode side of this edge.
    pub gateway: Option<String>,
}

/// Canonical simulation spec.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationSpec {
    /// SimNodes in declaration order.
    pub nodes: Vec<SimNodeSpec>,
    /// Attachment edges in declaration order.
    pub attachments: Vec<AttachmentSpec>,
    /// Fabric nodes and links carried by a fabric-native document.
    pub embedded_fabric: Option<FabricSnapshot>,
}

impl SimulationSpec {
    /// Normalizes and validates a raw spec document.
    ///
    /// When `fabric` is `None`, the embedded fabric of a native-shape document
    /// (if any) is used for the reference check. Structural and reference
    /// problems are reported together in one [`Error::Validation`].
    pub fn parse(raw: &Value, fabric: Option<&FabricSnapshot>) -> Result<Self> {
        let mut report = ValidationReport::default();
        let spec = normalize(raw, &mut report);
        let reference = fabric.or(spec.embedded_fabric.as_ref());
        if let Some(reference) = reference {
            spec.check_fabric_references(reference, &mut report);
        }
        report.into_result()?;
        Ok(spec)
    }

    /// Parses a YAML string.
    pub fn from_yaml_str(text: &str, fabric: Option<&FabricSnapshot>) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(text)?;
        Self::parse(&raw, fabric)
    }

    /// Reads and parses a spec file.
    pub fn load(path: &Path, fabric: Option<&FabricSnapshot>) -> Result<Self> {
        let raw = read_yaml(path)?;
        Self::parse(&raw, fabric)
    }

    /// Checks that every attachment references a fabric node in `fabric`.
    pub fn validate_against(&self, fabric: &FabricSnapshot) -> Result<()> {
        let mut report = ValidationReport::default();
        self.check_fabric_references(fabric, &mut report);
        report.into_result()
    }

    fn check_fabric_references(&self, fabric: &FabricSnapshot, report: &mut ValidationReport) {
        for (index, att) in self.attachments.iter().enumerate() {
            if !att.fabric_node.is_empty() && !fabric.has_node(&att.fabric_node) {
                report.push(
                    format!("topology[{index}].node"),
                    format!("fabric node '{}' not found in fabric snapshot", att.fabric_node),
                );
            }
        }
    }

    /// Looks up a SimNode by name.
    pub fn node(&self, name: &str) -> Option<&SimNodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Attachments of one SimNode, in declaration order.
    pub fn attachments_for<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a AttachmentSpec> + 'a {
        self.attachments.iter().filter(move |a| a.sim_node == node)
    }

    /// SimNode names in declaration order.
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }
}

/// Reads a YAML file whose root must be a mapping.
pub fn read_yaml(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Err(Error::FileNotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Err(Error::parse(format!("{} is empty", path.display())));
    }
    let value: Value = serde_yaml::from_str(&text)
        .map_err(|e| Error::parse(format!("{}: {e}", path.display())))?;
    match value {
        Value::Mapping(_) => Ok(value),
        Value::Null => Err(Error::parse(format!("{} is empty", path.display()))),
        _ => Err(Error::parse(format!("{}: top-level YAML must be a mapping", path.display()))),
    }
}

/// Serializable concise-shape document, as produced by the allocator.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConciseSpec {
    /// SimNodes.
    pub sim_nodes: Vec<ConciseSimNode>,
    /// Attachments.
    pub topology: Vec<ConciseAttachment>,
}

/// One SimNode entry of a [`ConciseSpec`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ConciseSimNode {
    pub name: String,
    pub image: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// One topology entry of a [`ConciseSpec`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ConciseAttachment {
    pub node: String,
    pub interface: String,
    pub sim_node: String,
    pub sim_node_interface: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// Raw sections gathered from either input shape, with their field paths.
#[derive(Default)]
struct Sections<'a> {
    nodes: Vec<(String, &'a Value)>,
    attachments: Vec<(String, &'a Value)>,
    fabric: Option<FabricSnapshot>,
}

fn normalize(raw: &Value, report: &mut ValidationReport) -> SimulationSpec {
    let Some(root) = raw.as_mapping() else {
        report.push("<root>", "spec must be a mapping");
        return SimulationSpec::default();
    };

    let mut sections = Sections::default();
    match root.get("items") {
        Some(items) => collect_native(items, report, &mut sections),
        None => {
            let (base, prefix) = match root.get("spec").and_then(Value::as_mapping) {
                Some(spec) => (spec, "spec."),
                None => (root, ""),
            };
            collect_section(base, prefix, report, &mut sections);
        }
    }

    if sections.nodes.is_empty() {
        report.push("simNodes", "at least one simNode is required");
    }
    if sections.attachments.is_empty() {
        report.push("topology", "at least one topology entry is required");
    }

    let nodes = parse_nodes(&sections.nodes, report);
    let known: BTreeSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    let attachments = parse_attachments(&sections.attachments, &known, report);

    SimulationSpec {
        nodes,
        attachments,
        embedded_fabric: sections.fabric,
    }
}

fn collect_native<'a>(items: &'a Value, report: &mut ValidationReport, sections: &mut Sections<'a>) {
    let Some(items) = items.as_sequence().filter(|s| !s.is_empty()) else {
        report.push("items", "must be a non-empty list");
        return;
    };

    for (index, item) in items.iter().enumerate() {
        let Some(spec) = item.get("spec").and_then(Value::as_mapping) else {
            report.push(format!("items[{index}].spec"), "must be a mapping");
            continue;
        };

        if spec.contains_key("nodes") || spec.contains_key("links") {
            sections
                .fabric
                .get_or_insert_with(FabricSnapshot::default)
                .absorb_topology_spec(&Value::Mapping(spec.clone()));
        }

        match spec.get("simulation").and_then(Value::as_mapping) {
            Some(sim) => {
                let prefix = format!("items[{index}].spec.simulation.");
                collect_section(sim, &prefix, report, sections);
            }
            None => {
                let prefix = format!("items[{index}].spec.");
                collect_section(spec, &prefix, report, sections);
            }
        }
    }
}

fn collect_section<'a>(section: &'a Mapping, prefix: &str, report: &mut ValidationReport, sections: &mut Sections<'a>) {
    for (key, target) in [("simNodes", &mut sections.nodes), ("topology", &mut sections.attachments)] {
        match section.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::Sequence(list)) => {
                target.extend(list.iter().enumerate().map(|(i, v)| (format!("{prefix}{key}[{i}]"), v)));
            }
            Some(_) => report.push(format!("{prefix}{key}"), "expected a list"),
        }
    }
}

fn parse_nodes(raw: &[(String, &Value)], report: &mut ValidationReport) -> Vec<SimNodeSpec> {
    let mut seen = BTreeSet::new();
    let mut nodes = Vec::with_capacity(raw.len());

    for (path, value) in raw {
        let Some(map) = value.as_mapping() else {
            report.push(path.clone(), "must be a mapping");
            continue;
        };

        let name = required_string(map, &["name"], &format!("{path}.name"), report);
        let image = required_string(map, &["image"], &format!("{path}.image"), report);
        let node_type = match map.get("type") {
            None | Some(Value::Null) => DEFAULT_NODE_TYPE.to_string(),
            Some(v) => match scalar_string(v) {
                Some(t) if !t.trim().is_empty() => t.trim().to_string(),
                _ => {
                    report.push(format!("{path}.type"), "must be a non-empty string");
                    DEFAULT_NODE_TYPE.to_string()
                }
            },
        };

        let (Some(name), Some(image)) = (name, image) else {
            continue;
        };
        if !seen.insert(name.clone()) {
            report.push(format!("{path}.name"), format!("duplicate simNode name '{name}'"));
            continue;
        }

        nodes.push(SimNodeSpec {
            name,
            image,
            node_type,
            ip_address: optional_string(map, &["ipAddress", "ip"]),
            vlan: optional_string(map, &["vlan", "vlanId"]),
            interface: optional_string(map, &["interface", "simInterface"]),
            gateway: optional_string(map, &["gateway"]),
            labels: string_map(map, "labels", &format!("{path}.labels"), report),
            annotations: string_map(map, "annotations", &format!("{path}.annotations"), report),
            schema_fields: schema_fields(map, &format!("{path}.spec"), report),
        });
    }
    nodes
}

fn parse_attachments(
    raw: &[(String, &Value)],
    known: &BTreeSet<&str>,
    report: &mut ValidationReport,
) -> Vec<AttachmentSpec> {
    let mut names: BTreeMap<String, String> = BTreeMap::new();
    let mut attachments = Vec::with_capacity(raw.len());

    for (path, value) in raw {
        let Some(map) = value.as_mapping() else {
            report.push(path.clone(), "must be a mapping");
            continue;
        };

        let node = required_string(map, &["node"], &format!("{path}.node"), report);
        let interface = required_string(map, &["interface"], &format!("{path}.interface"), report);
        let sim_node = required_string(map, &["simNode"], &format!("{path}.simNode"), report);
        let sim_interface = optional_string(map, &["simNodeInterface"]).or_else(|| interface.clone());

        let (Some(node), Some(interface), Some(sim_node), Some(sim_interface)) =
            (node, interface, sim_node, sim_interface)
        else {
            continue;
        };

        if !known.is_empty() && !known.contains(sim_node.as_str()) {
            let available: Vec<&str> = known.iter().copied().collect();
            report.push(
                format!("{path}.simNode"),
                format!("unknown simNode '{sim_node}'; available: {}", available.join(", ")),
            );
        }

        let att = AttachmentSpec {
            fabric_node: node,
            fabric_interface: interface,
            sim_node,
            sim_interface,
            vlan: optional_string(map, &["vlan", "vlanId"]),
            ip_address: optional_string(map, &["ipAddress", "ip"]),
            gateway: optional_string(map, &["gateway"]),
        };

        let name = link_name(&att);
        if let Some(first) = names.get(&name) {
            report.push(path.clone(), format!("duplicate attachment '{name}' (first declared at {first})"));
            continue;
        }
        names.insert(name, path.clone());
        attachments.push(att);
    }
    attachments
}

fn schema_fields(map: &Mapping, overrides_path: &str, report: &mut ValidationReport) -> Mapping {
    let mut fields = Mapping::new();
    for key in SIMNODE_ALLOWED_FIELDS {
        if let Some(value) = map.get(key).filter(|v| !v.is_null()) {
            fields.insert(Value::from(key), value.clone());
        }
    }

    match map.get("spec") {
        None | Some(Value::Null) => {}
        Some(Value::Mapping(overrides)) => {
            for key in SIMNODE_ALLOWED_FIELDS {
                if let Some(value) = overrides.get(key).filter(|v| !v.is_null()) {
                    fields.insert(Value::from(key), value.clone());
                }
            }
        }
        Some(_) => report.push(overrides_path, "must be a mapping"),
    }
    fields
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn optional_string(map: &Mapping, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find_map(scalar_string)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn required_string(map: &Mapping, keys: &[&str], path: &str, report: &mut ValidationReport) -> Option<String> {
    let found = keys
        .iter()
        .filter_map(|key| map.get(*key))
        .find_map(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if found.is_none() {
        report.push(path, "required non-empty string");
    }
    found.map(str::to_string)
}

fn string_map(map: &Mapping, key: &str, path: &str, report: &mut ValidationReport) -> BTreeMap<String, String> {
    match map.get(key) {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Mapping(entries)) => entries
            .iter()
            .filter_map(|(k, v)| {
                let value = scalar_string(v).or_else(|| v.as_bool().map(|b| b.to_string()))?;
                Some((scalar_string(k)?, value))
            })
            .collect(),
        Some(_) => {
            report.push(path, "must be a mapping of strings");
            BTreeMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const CONCISE: &str = r#"
simNodes:
  - name: edge1
    image: ghcr.io/example/edge:1
    type: Linux
    ip: 10.0.0.10/24
    vlan: 100
    labels:
      team: net
    port: 57401
    spec:
      platform: x86
topology:
  - node: leaf1
    interface: ethernet-1-1
    simNode: edge1
    simNodeInterface: eth1
    vlan: 100
"#;

    fn fabric(nodes: &[&str]) -> FabricSnapshot {
        FabricSnapshot {
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_concise_shape() {
        let spec = SimulationSpec::from_yaml_str(CONCISE, None).unwrap();
        assert_eq!(spec.nodes.len(), 1);
        let node = &spec.nodes[0];
        assert_eq!(node.name, "edge1");
        assert_eq!(node.ip_address.as_deref(), Some("10.0.0.10/24"));
        assert_eq!(node.vlan.as_deref(), Some("100"));
        assert_eq!(node.labels.get("team").map(String::as_str), Some("net"));
        assert_eq!(node.schema_fields.get("port").and_then(Value::as_u64), Some(57401));
        assert_eq!(node.schema_fields.get("platform"), Some(&Value::from("x86")));

        let att = &spec.attachments[0];
        assert_eq!(att.fabric_node, "leaf1");
        assert_eq!(att.sim_interface, "eth1");
        assert_eq!(att.vlan.as_deref(), Some("100"));
        assert!(spec.embedded_fabric.is_none());
    }

    #[test]
    fn test_concise_shape_nested_under_spec() {
        let text = r#"
spec:
  simNodes: [{name: a, image: img}]
  topology: [{node: leaf1, interface: e1, simNode: a}]
"#;
        let spec = SimulationSpec::from_yaml_str(text, None).unwrap();
        assert_eq!(spec.node_names(), vec!["a"]);
        // simNodeInterface falls back to the fabric interface name.
        assert_eq!(spec.attachments[0].sim_interface, "e1");
        assert_eq!(spec.nodes[0].node_type, DEFAULT_NODE_TYPE);
    }

    #[test]
    fn test_native_shape_merges_items_and_embeds_fabric() {
        let text = r#"
items:
  - spec:
      nodes:
        - name: leaf1
      links: []
      simulation:
        simNodes: [{name: a, image: img}]
        topology: [{node: leaf1, interface: e1, simNode: a}]
  - spec:
      simNodes: [{name: b, image: img}]
      topology: [{node: leaf1, interface: e2, simNode: b}]
"#;
        let spec = SimulationSpec::from_yaml_str(text, None).unwrap();
        assert_eq!(spec.node_names(), vec!["a", "b"]);
        assert_eq!(spec.attachments.len(), 2);
        let embedded = spec.embedded_fabric.as_ref().unwrap();
        assert!(embedded.has_node("leaf1"));
    }

    #[test]
    fn test_embedded_fabric_rejects_unknown_node() {
        let text = r#"
items:
  - spec:
      nodes: [{name: leaf1}]
      simNodes: [{name: a, image: img}]
      topology: [{node: leaf2, interface: e1, simNode: a}]
"#;
        let err = SimulationSpec::from_yaml_str(text, None).unwrap_err();
        let Error::Validation(report) = err else { panic!("expected validation error") };
        assert!(report.mentions("leaf2"));
    }

    #[test]
    fn test_every_issue_reported_together() {
        let text = r#"
simNodes:
  - name: a
  - image: img
  - name: a
    image: img
  - name: a
    image: img
topology:
  - node: leaf1
    simNode: ghost
"#;
        let Error::Validation(report) = SimulationSpec::from_yaml_str(text, None).unwrap_err() else {
            panic!("expected validation error");
        };
        assert!(report.mentions("simNodes[0].image"));
        assert!(report.mentions("simNodes[1].name"));
        assert!(report.mentions("duplicate simNode name 'a'"));
        assert!(report.mentions("topology[0].interface"));
    }

    #[test]
    fn test_unknown_sim_node_lists_available() {
        let text = r#"
simNodes: [{name: a, image: img}, {name: b, image: img}]
topology: [{node: leaf1, interface: e1, simNode: c}]
"#;
        let Error::Validation(report) = SimulationSpec::from_yaml_str(text, None).unwrap_err() else {
            panic!("expected validation error");
        };
        assert!(report.mentions("unknown simNode 'c'; available: a, b"));
    }

    #[test]
    fn test_duplicate_attachment_identity_rejected() {
        let text = r#"
simNodes: [{name: a, image: img}]
topology:
  - {node: leaf1, interface: e1, simNode: a, vlan: 10}
  - {node: leaf1, interface: e1, simNode: a, vlan: 10}
  - {node: leaf1, interface: e1, simNode: a, vlan: 20}
"#;
        let Error::Validation(report) = SimulationSpec::from_yaml_str(text, None).unwrap_err() else {
            panic!("expected validation error");
        };
        assert_eq!(report.issues().len(), 1);
        assert!(report.mentions("topology[1]"));
    }

    #[test]
    fn test_missing_sections() {
        let Error::Validation(report) = SimulationSpec::from_yaml_str("simNodes: []", None).unwrap_err() else {
            panic!("expected validation error");
        };
        assert!(report.mentions("at least one simNode"));
        assert!(report.mentions("at least one topology entry"));
    }

    #[test]
    fn test_empty_items_rejected() {
        let err = SimulationSpec::from_yaml_str("items: []", None).unwrap_err();
        assert!(err.to_string().contains("items: must be a non-empty list"));
    }

    #[test]
    fn test_fabric_reference_check() {
        let spec = SimulationSpec::from_yaml_str(CONCISE, Some(&fabric(&["leaf1"]))).unwrap();
        assert!(spec.validate_against(&fabric(&["leaf1", "leaf2"])).is_ok());

        let err = SimulationSpec::from_yaml_str(CONCISE, Some(&fabric(&["leaf2"]))).unwrap_err();
        assert!(err.to_string().contains("topology[0].node"));
        assert!(err.to_string().contains("'leaf1'"));
    }

    #[test]
    fn test_read_yaml_errors_are_distinct() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.yaml");
        assert!(matches!(read_yaml(&missing), Err(Error::FileNotFound(_))));

        let empty = dir.path().join("empty.yaml");
        std::fs::File::create(&empty).unwrap();
        let err = read_yaml(&empty).unwrap_err();
        assert!(err.to_string().contains("is empty"));

        let list = dir.path().join("list.yaml");
        let mut file = std::fs::File::create(&list).unwrap();
        writeln!(file, "- a\n- b").unwrap();
        let err = read_yaml(&list).unwrap_err();
        assert!(err.to_string().contains("must be a mapping"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONCISE.as_bytes()).unwrap();
        let spec = SimulationSpec::load(file.path(), None).unwrap();
        assert_eq!(spec.attachments_for("edge1").count(), 1);
        assert!(spec.node("edge1").unwrap().is_linux());
    }
}
