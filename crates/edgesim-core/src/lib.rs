//! Spec model, fabric allocator and manifest compiler for simulated edge
//! attachments.
//!
//! This crate is the pure half of edgesim: nothing in here talks to a
//! cluster. It turns simulation intent into the exact set of resource
//! documents that the orchestrator later hands to the external apply tool.
//!
//! # Overview
//!
//! ```text
//!   spec file ──► spec::SimulationSpec ─┐
//!                                       ├──► compiler::compile ──► CompiledBundle
//!   fabric ──► allocator::build_auto_plan ┘
//! ```
//!
//! - [`spec`]: normalizes the concise (`simNodes`/`topology`) and the
//!   fabric-native (`items[].spec`) input shapes into one model and validates
//!   it, reporting every offending field together.
//! - [`fabric`]: the snapshot of fabric nodes, interfaces and virtual networks
//!   the allocator and the validator consume.
//! - [`allocator`]: derives a spec from the fabric when none is given,
//!   assigning `serverN` names and non-colliding addresses deterministically.
//! - [`compiler`]: renders SimNode, SimLink and TopoLink documents with stable
//!   names, in dependency order.
//!
//! # Example
//!
//! ```ignore
//! use edgesim_core::{compile, SimulationSpec};
//!
//! let raw = edgesim_core::spec::read_yaml("sim.yaml".as_ref())?;
//! let spec = SimulationSpec::parse(&raw, None)?;
//! let bundle = compile(&spec, "eda");
//! println!("{}", bundle.render()?);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod allocator;
pub mod compiler;
pub mod error;
pub mod fabric;
pub mod manifest;
pub mod pool;
pub mod spec;

pub use allocator::{build_auto_plan, AllocationIssue, AutoAttachment, AutoPlan};
pub use compiler::{compile, CompiledBundle, NodeInterfaceConfig, ResourceSummary};
pub use error::{Error, Result, SpecIssue, ValidationReport};
pub use fabric::{FabricInterface, FabricSnapshot, InterfaceMember, VirtualNetwork, VlanSlice};
pub use manifest::{Resource, ResourceKind, MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE, POD_SELECTOR_LABEL};
pub use pool::IpPool;
pub use spec::{AttachmentSpec, SimNodeSpec, SimulationSpec};
