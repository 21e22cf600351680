use clap::Args;
use serde::Serialize;
use std::sync::Arc;

use clusterup::config::Settings;
use clusterup::node::{Inventory, JsonInventory, Node};
use clusterup::{DeployReport, DeployRequest};

use super::CmdResult;
use crate::output::{exit_code_for_error, CliError};

#[derive(Args)]
pub struct DeployArgs {
    /// Node IDs to deploy (defaults to every node in the inventory)
    #[arg(long, num_args = 1.., value_name = "ID")]
    pub nodes: Vec<String>,

    /// Kubernetes version (e.g. 1.28.2 or v1.28.2)
    #[arg(long)]
    pub version: String,

    /// CPU architecture: amd64 or arm64
    #[arg(long, default_value = "amd64")]
    pub arch: String,

    /// Steps to skip on every node (repeatable)
    #[arg(long = "skip", value_name = "STEP")]
    pub skip: Vec<String>,

    /// Do not echo progress to the terminal
    #[arg(long)]
    pub quiet: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutput {
    pub command: String,
    pub node_ids: Vec<String>,
    #[serde(flatten)]
    pub report: DeployReport,
    pub failed_joins: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CliError>,
}

pub fn run(args: DeployArgs, _global: &super::GlobalArgs) -> CmdResult<DeployOutput> {
    let settings = Settings::load()?;
    let inventory = Arc::new(JsonInventory::open_default()?);
    let nodes = select_nodes(inventory.as_ref(), &args.nodes)?;
    let node_ids = nodes.iter().map(|n| n.id.clone()).collect();

    let engine = super::open_engine(settings, inventory)?;

    let mut request = DeployRequest::new(nodes, args.version, args.arch);
    request.skip_steps = args.skip;
    let on_log = if args.quiet {
        None
    } else {
        Some(super::progress_callback())
    };

    let report = engine.deploy(request, on_log);
    let failed_joins = report.failed_joins();
    let exit_code = match &report.error {
        Some(err) => exit_code_for_error(err.code),
        None if failed_joins > 0 => 1,
        None => 0,
    };
    let error = report.error.as_ref().map(CliError::from_error);

    Ok((
        DeployOutput {
            command: "deploy".to_string(),
            node_ids,
            report,
            failed_joins,
            error,
        },
        exit_code,
    ))
}

/// Inventory nodes named by `ids` in the given order, or all of them.
fn select_nodes(inventory: &dyn Inventory, ids: &[String]) -> clusterup::Result<Vec<Node>> {
    if ids.is_empty() {
        return inventory.list_nodes();
    }
    ids.iter().map(|id| inventory.get_node(id)).collect()
}
