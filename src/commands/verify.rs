use clap::Args;
use serde::Serialize;
use std::sync::Arc;

use clusterup::config::Settings;
use clusterup::node::JsonInventory;
use clusterup::VerifyReport;

use super::CmdResult;

#[derive(Args)]
pub struct VerifyArgs {
    /// Primary node ID (defaults to the inventory's primary)
    pub node_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutput {
    pub command: String,
    #[serde(flatten)]
    pub report: VerifyReport,
}

pub fn run(args: VerifyArgs, _global: &super::GlobalArgs) -> CmdResult<VerifyOutput> {
    let settings = Settings::load()?;
    let inventory = Arc::new(JsonInventory::open_default()?);
    let primary = super::primary_node(inventory.as_ref(), args.node_id.as_deref())?;

    let engine = super::open_engine(settings, inventory)?;
    let report = engine.verify(&primary, None)?;

    Ok((
        VerifyOutput {
            command: "verify".to_string(),
            report,
        },
        0,
    ))
}
