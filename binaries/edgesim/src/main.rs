//! Edgesim - attach simulated edge nodes to fabric interfaces.
//!
//! Compiles a simulation spec (or one derived from the live fabric) into
//! SimNode, SimLink and TopoLink resources, applies them behind a dry-run
//! gate and configures addresses inside the simulated workloads.
//!
//! # Usage
//!
//! ```bash
//! # Derive attachments from the fabric and apply them
//! edgesim apply
//!
//! # Apply an explicit spec and keep the rendered resources
//! edgesim apply --spec sim.yaml --emit-crds out/crds.yaml
//!
//! # Remove what the same spec created
//! edgesim remove --spec sim.yaml -n eda -c eda-system
//! ```

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::EdgesimConfig;
use edgesim_orchestrator::{
    ApplyOrchestrator, ApplyReport, ApplyRequest, BundleRequest, KubectlBackend, RemoveOrchestrator, RemoveReport,
    SharedBackend, SpecSource, ToolOutput,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// CLI arguments for edgesim.
#[derive(Parser, Debug)]
#[command(
    name = "edgesim",
    about = "Attach simulated edge nodes to fabric interfaces",
    version
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Enable JSON log output.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Print the default configuration and exit.
    #[arg(long)]
    print_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile, dry-run, commit and configure the simulation.
    Apply {
        #[command(flatten)]
        common: CommonArgs,

        /// Keep the rendered resources at this path.
        #[arg(long, value_name = "FILE")]
        emit_crds: Option<PathBuf>,
    },

    /// Delete the simulation resources the same inputs produce.
    Remove {
        #[command(flatten)]
        common: CommonArgs,
    },
}

/// Arguments shared by `apply` and `remove`.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Simulation spec file. Derived from the live fabric when omitted.
    #[arg(long, value_name = "FILE")]
    pub spec: Option<PathBuf>,

    /// Fabric topology file to validate against instead of the live fabric.
    #[arg(long, value_name = "FILE")]
    pub topology: Option<PathBuf>,

    /// Namespace holding the fabric and the simulation resources.
    #[arg(short = 'n', long = "topology-namespace", env = "TOPO_NS", value_name = "NS")]
    pub topology_namespace: Option<String>,

    /// Namespace the SimNode pods run in.
    #[arg(short = 'c', long = "core-namespace", env = "CORE_NS", value_name = "NS")]
    pub core_namespace: Option<String>,

    /// Debug logging, state dumps and the rendered bundle on output.
    #[arg(long)]
    pub debug: bool,
}

impl CommonArgs {
    fn bundle_request(&self, namespace: &str) -> BundleRequest {
        let source = match &self.spec {
            Some(path) => SpecSource::File(path.clone()),
            None => SpecSource::Auto,
        };
        let request = BundleRequest::new(source, namespace);
        match &self.topology {
            Some(path) => request.with_topology_file(path),
            None => request,
        }
    }
}

/// Initializes the tracing subscriber.
fn init_tracing(config: &config::LoggingConfig, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to parse log filter")?;

    let format = if json_logs || config.format == "json" {
        "json"
    } else {
        &config.format
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli, common: &CommonArgs) -> Result<EdgesimConfig> {
    let mut config = match cli.config {
        Some(ref path) => {
            EdgesimConfig::from_file(path).with_context(|| format!("Failed to load config from {:?}", path))?
        }
        None => EdgesimConfig::default(),
    };
    config.merge_cli_args(common, cli.log_level.as_deref());
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn print_transcript(transcript: &[ToolOutput]) {
    for output in transcript {
        println!("$ {}", output.command);
        let text = output.combined_output();
        if !text.is_empty() {
            println!("{text}");
        }
    }
}

fn print_debug(manifest: Option<&str>, transcript: &[ToolOutput]) {
    if let Some(manifest) = manifest {
        println!("--- rendered bundle ---");
        print!("{manifest}");
    }
    if !transcript.is_empty() {
        println!("--- tool transcript ---");
        print_transcript(transcript);
    }
}

fn print_apply_report(report: &ApplyReport) {
    for issue in &report.allocation_issues {
        println!("warning: {issue}");
    }
    println!("Applied {} resource(s) (stage: {}):", report.summaries.len(), report.stage);
    for summary in &report.summaries {
        println!("  {summary}");
    }
    if let Some(path) = &report.manifest_path {
        println!("Manifest written to {}", path.display());
    }
    for (node, pod) in &report.ready_pods {
        let devices = report.configured.get(node).map(|d| d.join(", ")).unwrap_or_default();
        if devices.is_empty() {
            println!("  {node}: {pod} ready");
        } else {
            println!("  {node}: {pod} ready, configured {devices}");
        }
    }
    for failure in &report.failures {
        println!("FAILED {failure}");
    }
}

fn print_remove_report(report: &RemoveReport) {
    println!("Removed {} resource(s):", report.summaries.len());
    for summary in &report.summaries {
        println!("  {summary}");
    }
    for residual in &report.residuals {
        println!("warning: {residual} still present");
    }
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
}

async fn run_apply(
    backend: SharedBackend,
    config: &EdgesimConfig,
    common: &CommonArgs,
    emit_crds: Option<PathBuf>,
) -> Result<bool> {
    let mut request = ApplyRequest::new(common.bundle_request(&config.namespaces.topology));
    if let Some(path) = emit_crds {
        request = request.with_emit_path(path);
    }

    let orchestrator = ApplyOrchestrator::new(backend, config.orchestrator_config(common.debug));
    match orchestrator.apply(&request).await {
        Ok(report) => {
            if common.debug {
                print_debug(Some(&report.manifest), &report.transcript);
            }
            print_apply_report(&report);
            Ok(report.is_success())
        }
        Err(failure) => {
            if common.debug {
                print_debug(failure.manifest.as_deref(), &failure.transcript);
            }
            Err(failure.into())
        }
    }
}

async fn run_remove(backend: SharedBackend, config: &EdgesimConfig, common: &CommonArgs) -> Result<bool> {
    let request = common.bundle_request(&config.namespaces.topology);
    let orchestrator = RemoveOrchestrator::new(backend, config.orchestrator_config(common.debug));
    match orchestrator.remove(&request).await {
        Ok(report) => {
            if common.debug {
                print_debug(Some(&report.manifest), &report.transcript);
            }
            print_remove_report(&report);
            if !report.is_clean() {
                warn!(residuals = report.residuals.len(), "removal left managed resources behind");
            }
            Ok(true)
        }
        Err(failure) => {
            if common.debug {
                print_debug(failure.manifest.as_deref(), &failure.transcript);
            }
            Err(failure.into())
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    if cli.print_config {
        println!("{}", toml::to_string_pretty(&EdgesimConfig::default())?);
        return Ok(true);
    }

    let Some(command) = &cli.command else {
        anyhow::bail!("no command given; run `edgesim apply` or `edgesim remove`");
    };
    let common = match command {
        Command::Apply { common, .. } | Command::Remove { common } => common,
    };

    let config = load_config(&cli, common)?;
    init_tracing(&config.logging, cli.json_logs)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        topology_namespace = %config.namespaces.topology,
        core_namespace = %config.namespaces.core,
        "edgesim starting"
    );

    let backend: SharedBackend = Arc::new(KubectlBackend::new(config.kubectl_config()));
    match command {
        Command::Apply { common, emit_crds } => run_apply(backend, &config, common, emit_crds.clone()).await,
        Command::Remove { common } => run_remove(backend, &config, common).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "edgesim failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_apply() {
        let cli = Cli::try_parse_from([
            "edgesim",
            "apply",
            "--spec",
            "sim.yaml",
            "-n",
            "lab",
            "-c",
            "core",
            "--emit-crds",
            "out.yaml",
            "--debug",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Apply { common, emit_crds }) => {
                assert_eq!(common.spec, Some(PathBuf::from("sim.yaml")));
                assert_eq!(common.topology_namespace.as_deref(), Some("lab"));
                assert_eq!(common.core_namespace.as_deref(), Some("core"));
                assert!(common.debug);
                assert_eq!(emit_crds, Some(PathBuf::from("out.yaml")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_remove_rejects_emit_crds() {
        assert!(Cli::try_parse_from(["edgesim", "remove", "--emit-crds", "x.yaml"]).is_err());
    }

    #[test]
    fn test_bundle_request_without_spec_is_auto() {
        let cli = Cli::try_parse_from(["edgesim", "remove", "--topology", "topo.yaml"]).unwrap();
        let Some(Command::Remove { common }) = cli.command else {
            panic!("expected remove");
        };
        let request = common.bundle_request("eda");
        assert_eq!(request.source, SpecSource::Auto);
        assert_eq!(request.topology_file, Some(PathBuf::from("topo.yaml")));
        assert_eq!(request.topology_namespace, "eda");
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["edgesim", "apply", "--log-level", "warn", "--json-logs"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("warn"));
        assert!(cli.json_logs);
    }
}
