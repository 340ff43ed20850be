//! Resource documents rendered for the apply tool.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_yaml::Mapping;

use crate::error::Result;

/// API group and version of every rendered resource.
pub const API_VERSION: &str = "core.eda.nokia.com/v1";
/// API group used in fully-qualified resource names.
pub const API_GROUP: &str = "core.eda.nokia.com";
/// Label marking resources managed by this tool.
pub const MANAGED_LABEL_KEY: &str = "eda.nokia.com/simtopology";
/// Value of [`MANAGED_LABEL_KEY`].
pub const MANAGED_LABEL_VALUE: &str = "true";
/// Role label carried by TopoLinks.
pub const ROLE_LABEL_KEY: &str = "eda.nokia.com/role";
/// Pod label that identifies the workload pod of a SimNode.
pub const POD_SELECTOR_LABEL: &str = "cx-pod-name";

/// Kind of a rendered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ResourceKind {
    /// Simulated workload node.
    SimNode,
    /// Link between a fabric interface and a SimNode interface.
    SimLink,
    /// Edge link in the fabric topology.
    TopoLink,
}

impl ResourceKind {
    /// All kinds, in apply order.
    pub const ALL: [ResourceKind; 3] = [ResourceKind::SimNode, ResourceKind::SimLink, ResourceKind::TopoLink];

    /// Kind name as rendered, e.g. `SimNode`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::SimNode => "SimNode",
            ResourceKind::SimLink => "SimLink",
            ResourceKind::TopoLink => "TopoLink",
        }
    }

    /// Singular resource name for the cluster CLI, e.g. `simnode`.
    pub fn resource(&self) -> &'static str {
        match self {
            ResourceKind::SimNode => "simnode",
            ResourceKind::SimLink => "simlink",
            ResourceKind::TopoLink => "topolink",
        }
    }

    /// Plural resource name, e.g. `simnodes`.
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::SimNode => "simnodes",
            ResourceKind::SimLink => "simlinks",
            ResourceKind::TopoLink => "topolinks",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectMeta {
    /// Resource name.
    pub name: String,
    /// Target namespace.
    pub namespace: String,
    /// Labels, always including the managed-by label.
    pub labels: BTreeMap<String, String>,
    /// Annotations, omitted when empty.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Metadata carrying only the managed-by label.
    pub fn managed(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::from([(MANAGED_LABEL_KEY.to_string(), MANAGED_LABEL_VALUE.to_string())]),
            annotations: BTreeMap::new(),
        }
    }
}

/// A resource document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document<S> {
    /// Always [`API_VERSION`].
    pub api_version: &'static str,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Kind-specific body.
    pub spec: S,
}

impl<S> Document<S> {
    /// Wraps a body with the standard header.
    pub fn new(kind: ResourceKind, metadata: ObjectMeta, spec: S) -> Self {
        Self {
            api_version: API_VERSION,
            kind,
            metadata,
            spec,
        }
    }
}

/// One side of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Node name.
    pub node: String,
    /// Interface name on the node.
    pub interface: String,
    /// Name of the interface resource, `slug(node)-slug(interface)`.
    pub interface_resource: String,
}

/// A SimLink entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimLinkEntry {
    /// Fabric side.
    pub local: Endpoint,
    /// SimNode side.
    pub sim: Endpoint,
}

/// A TopoLink entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopoLinkEntry {
    /// Link type, always `edge`.
    #[serde(rename = "type")]
    pub link_type: String,
    /// Fabric side.
    pub local: Endpoint,
    /// SimNode side.
    pub remote: Endpoint,
}

/// Body of link resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkSpec<L> {
    /// Link entries; a single one per rendered resource.
    pub links: Vec<L>,
}

/// Any rendered resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Resource {
    /// A SimNode; its body keeps insertion order.
    SimNode(Document<Mapping>),
    /// A SimLink.
    SimLink(Document<LinkSpec<SimLinkEntry>>),
    /// A TopoLink.
    TopoLink(Document<LinkSpec<TopoLinkEntry>>),
}

impl Resource {
    /// Kind of this resource.
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::SimNode(_) => ResourceKind::SimNode,
            Resource::SimLink(_) => ResourceKind::SimLink,
            Resource::TopoLink(_) => ResourceKind::TopoLink,
        }
    }

    /// Metadata of this resource.
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Resource::SimNode(doc) => &doc.metadata,
            Resource::SimLink(doc) => &doc.metadata,
            Resource::TopoLink(doc) => &doc.metadata,
        }
    }

    /// Name of this resource.
    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Renders the resource as one YAML document without the separator.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topolink_rendering() {
        let endpoint = |node: &str, iface: &str| Endpoint {
            node: node.into(),
            interface: iface.into(),
            interface_resource: format!("{node}-{iface}"),
        };
        let mut metadata = ObjectMeta::managed("leaf1-e1-a", "eda");
        metadata.labels.insert(ROLE_LABEL_KEY.into(), "edge".into());
        let doc = Resource::TopoLink(Document::new(
            ResourceKind::TopoLink,
            metadata,
            LinkSpec {
                links: vec![TopoLinkEntry {
                    link_type: "edge".into(),
                    local: endpoint("leaf1", "e1"),
                    remote: endpoint("a", "eth1"),
                }],
            },
        ));

        let yaml = doc.to_yaml().unwrap();
        assert!(yaml.starts_with("apiVersion: core.eda.nokia.com/v1\nkind: TopoLink\n"));
        assert!(yaml.contains("eda.nokia.com/role: edge"));
        assert!(yaml.contains("eda.nokia.com/simtopology: 'true'"));
        assert!(yaml.contains("type: edge"));
        assert!(yaml.contains("interfaceResource: leaf1-e1"));
        assert!(!yaml.contains("annotations"));
        assert_eq!(doc.kind(), ResourceKind::TopoLink);
        assert_eq!(doc.name(), "leaf1-e1-a");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ResourceKind::SimLink.resource(), "simlink");
        assert_eq!(ResourceKind::TopoLink.plural(), "topolinks");
        assert_eq!(ResourceKind::SimNode.to_string(), "SimNode");
    }
}
