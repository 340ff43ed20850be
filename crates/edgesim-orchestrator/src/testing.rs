//! Recording backend for orchestrator tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use edgesim_core::{FabricSnapshot, POD_SELECTOR_LABEL};

use crate::backend::{ClusterBackend, ExecOutput, PodStatus, ToolMode, ToolOutput};
use crate::error::{OrchestratorError, Result};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    FabricSnapshot,
    Apply { mode: ToolMode, manifest: String },
    Delete { mode: ToolMode, manifest: String },
    PodStatus { selector: String },
    Exec { pod: String, container: String, script: String },
    ListLabeled { resource: String },
    Dump { resource: String },
}

#[derive(Debug, Default)]
pub struct StubBackend {
    fabric: Option<FabricSnapshot>,
    fabric_error: Option<String>,
    reject_dry_run: bool,
    fail_commit: bool,
    unready: BTreeSet<String>,
    exec_failures: BTreeMap<String, String>,
    script_failures: Vec<(String, String)>,
    missing_device_attempts: Mutex<BTreeMap<String, usize>>,
    residuals: Vec<String>,
    calls: Mutex<Vec<Call>>,
}

impl StubBackend {
    pub fn with_fabric(mut self, fabric: FabricSnapshot) -> Self {
        self.fabric = Some(fabric);
        self
    }

    /// `fabric_snapshot` fails as a forbidden or missing resource list would.
    pub fn failing_fabric(mut self, reason: &str) -> Self {
        self.fabric_error = Some(reason.to_string());
        self
    }

    pub fn rejecting_dry_run(mut self) -> Self {
        self.reject_dry_run = true;
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    /// Pods of `node` never report Ready.
    pub fn with_unready(mut self, node: &str) -> Self {
        self.unready.insert(node.to_string());
        self
    }

    /// Every exec in `node`'s container fails with `stderr`.
    pub fn with_exec_failure(mut self, node: &str, stderr: &str) -> Self {
        self.exec_failures.insert(node.to_string(), stderr.to_string());
        self
    }

    /// Any exec whose script contains `needle` fails with `stderr`.
    pub fn with_script_failure(mut self, needle: &str, stderr: &str) -> Self {
        self.script_failures.push((needle.to_string(), stderr.to_string()));
        self
    }

    /// The first `attempts` execs in `node`'s container report a missing device.
    pub fn with_missing_device(self, node: &str, attempts: usize) -> Self {
        if let Ok(mut map) = self.missing_device_attempts.lock() {
            map.insert(node.to_string(), attempts);
        }
        self
    }

    /// `list_labeled` reports `name` (e.g. `simnode/server1`) as a survivor.
    pub fn with_residual(mut self, name: &str) -> Self {
        self.residuals.push(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl ClusterBackend for StubBackend {
    async fn fabric_snapshot(&self, _namespace: &str) -> Result<Option<FabricSnapshot>> {
        self.record(Call::FabricSnapshot);
        if let Some(reason) = &self.fabric_error {
            return Err(OrchestratorError::command_failed("kubectl get toponodes -o json", reason.clone()));
        }
        Ok(self.fabric.clone())
    }

    async fn apply_bundle(&self, path: &Path, mode: ToolMode) -> Result<ToolOutput> {
        let manifest = std::fs::read_to_string(path)?;
        self.record(Call::Apply { mode, manifest });
        let command = format!("etc apply -f {}", path.display());
        Ok(match mode {
            ToolMode::DryRun if self.reject_dry_run => ToolOutput::new(
                command,
                false,
                "",
                "Error: simlink.core.eda.nokia.com/leaf1-ethernet-1-1-edge1-100 is invalid: spec.links[0].local.node: not found",
            ),
            ToolMode::Commit if self.fail_commit => ToolOutput::new(
                command,
                false,
                "simnode.core.eda.nokia.com/edge1 created",
                "Error from server: topolink.core.eda.nokia.com/leaf1-ethernet-1-1-edge1-100 denied by admission",
            ),
            _ => ToolOutput::new(command, true, "transaction committed", ""),
        })
    }

    async fn delete_bundle(&self, path: &Path, mode: ToolMode) -> Result<ToolOutput> {
        let manifest = std::fs::read_to_string(path)?;
        self.record(Call::Delete { mode, manifest });
        Ok(ToolOutput::new(format!("etc delete -f {}", path.display()), true, "", ""))
    }

    async fn pod_status(&self, _namespace: &str, selector: &str) -> Result<Vec<PodStatus>> {
        self.record(Call::PodStatus {
            selector: selector.to_string(),
        });
        let node = selector
            .strip_prefix(POD_SELECTOR_LABEL)
            .and_then(|s| s.strip_prefix('='))
            .unwrap_or_default();
        Ok(vec![PodStatus {
            name: format!("{node}-pod"),
            ready: !self.unready.contains(node),
            phase: Some("Running".to_string()),
        }])
    }

    async fn exec(&self, _namespace: &str, pod: &str, container: &str, script: &str) -> Result<ExecOutput> {
        self.record(Call::Exec {
            pod: pod.to_string(),
            container: container.to_string(),
            script: script.to_string(),
        });
        if let Some(stderr) = self.exec_failures.get(container) {
            return Ok(ExecOutput::new("", stderr.clone(), 1));
        }
        if let Some((_, stderr)) = self.script_failures.iter().find(|(needle, _)| script.contains(needle.as_str())) {
            return Ok(ExecOutput::new("", stderr.clone(), 1));
        }
        if let Ok(mut pending) = self.missing_device_attempts.lock() {
            if let Some(left) = pending.get_mut(container).filter(|n| **n > 0) {
                *left -= 1;
                return Ok(ExecOutput::new("", "Cannot find device \"eth1\"", 1));
            }
        }
        Ok(ExecOutput::new("", "", 0))
    }

    async fn list_labeled(&self, _namespace: &str, resource: &str, _selector: &str) -> Result<Vec<String>> {
        self.record(Call::ListLabeled {
            resource: resource.to_string(),
        });
        let prefix = format!("{resource}/");
        Ok(self.residuals.iter().filter(|r| r.starts_with(&prefix)).cloned().collect())
    }

    async fn dump(&self, _namespace: &str, resource: &str, _format: &str) -> Result<String> {
        self.record(Call::Dump {
            resource: resource.to_string(),
        });
        Ok(format!("{resource}: ok"))
    }

    fn name(&self) -> &str {
        "stub"
    }
}

/// A fabric with edge interfaces on leaf1 and leaf2, a routed VLAN 201 on
/// both and an L2 VLAN 1001 on leaf1 only.
pub fn sample_fabric() -> FabricSnapshot {
    let nodes = r#"{"items": [{"metadata": {"name": "leaf1"}}, {"metadata": {"name": "leaf2"}}]}"#;
    let interfaces = r#"{"items": [
        {"metadata": {"name": "leaf1-ethernet-1-1", "labels": {"role": "edge", "l2": "yes"}},
         "spec": {"members": [{"node": "leaf1", "interface": "ethernet-1-1"}]}},
        {"metadata": {"name": "leaf2-ethernet-1-1", "labels": {"role": "edge"}},
         "spec": {"members": [{"node": "leaf2", "interface": "ethernet-1-1"}]}}
    ]}"#;
    let networks = r#"{"items": [
        {"metadata": {"name": "ipvrf2001"},
         "spec": {
            "vlans": [{"name": "macvrf201", "spec": {"bridgeDomain": "bd201", "interfaceSelector": ["role=edge"], "vlanID": "201"}}],
            "irbInterfaces": [{"name": "irb201", "spec": {"bridgeDomain": "bd201",
                "ipAddresses": [{"ipv4Address": {"ipPrefix": "10.20.1.254/24", "primary": true}}]}}]
         }},
        {"metadata": {"name": "macvrf1001"},
         "spec": {"vlans": [{"name": "macvrf1001", "spec": {"interfaceSelector": ["l2=yes"], "vlanID": "1001"}}]}}
    ]}"#;
    FabricSnapshot::from_resource_lists(nodes, interfaces, networks).expect("sample fabric parses")
}
