use clap::Args;
use serde::Serialize;
use std::sync::Arc;

use clusterup::config::Settings;
use clusterup::node::JsonInventory;
use clusterup::JoinCommandReport;

use super::CmdResult;

#[derive(Args)]
pub struct JoinArgs {
    /// Primary node ID (defaults to the inventory's primary)
    pub node_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinOutput {
    pub command: String,
    #[serde(flatten)]
    pub report: JoinCommandReport,
}

pub fn run(args: JoinArgs, _global: &super::GlobalArgs) -> CmdResult<JoinOutput> {
    let settings = Settings::load()?;
    let inventory = Arc::new(JsonInventory::open_default()?);
    let primary = super::primary_node(inventory.as_ref(), args.node_id.as_deref())?;

    let engine = super::open_engine(settings, inventory)?;
    let report = engine.join_command(&primary, None)?;

    Ok((
        JoinOutput {
            command: "join-command".to_string(),
            report,
        },
        0,
    ))
}
