use clap::Args;
use serde::Serialize;
use std::sync::Arc;

use clusterup::node::{Inventory, JsonInventory};
use clusterup::pipeline::{plan, PlannedStep, SkipSet};
use clusterup::script::{DirScriptStore, ScriptResolver};
use clusterup::paths;

use super::CmdResult;

#[derive(Args)]
pub struct StepsArgs {
    /// Distribution to resolve scripts for
    #[arg(long, default_value = "ubuntu", conflicts_with = "node")]
    pub distro: String,

    /// Resolve for this inventory node's detected distribution instead
    #[arg(long, value_name = "ID")]
    pub node: Option<String>,

    /// Steps to mark as skipped (repeatable)
    #[arg(long = "skip", value_name = "STEP")]
    pub skip: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepsOutput {
    pub command: String,
    pub distro: String,
    pub steps: Vec<PlannedStep>,
    pub overrides: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unknown_skips: Vec<String>,
}

pub fn run(args: StepsArgs, _global: &super::GlobalArgs) -> CmdResult<StepsOutput> {
    let distro = match &args.node {
        Some(id) => {
            let node = JsonInventory::open_default()?.get_node(id)?;
            node.os.unwrap_or(args.distro)
        }
        None => args.distro,
    };

    let store = Arc::new(DirScriptStore::new(paths::scripts()?));
    let overrides = store.list();
    let resolver = ScriptResolver::new(store);
    let skip = SkipSet::parse(&args.skip);

    Ok((
        StepsOutput {
            command: "steps".to_string(),
            steps: plan(&resolver, &distro, &skip),
            distro,
            overrides,
            unknown_skips: skip.unknown().to_vec(),
        },
        0,
    ))
}
