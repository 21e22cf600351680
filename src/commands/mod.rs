use std::sync::Arc;

use clusterup::config::Settings;
use clusterup::logs::SqliteLogSink;
use clusterup::node::{Inventory, JsonInventory, Node, Role};
use clusterup::packages::DirPackageCache;
use clusterup::run::LogCallback;
use clusterup::script::DirScriptStore;
use clusterup::ssh::SshConnector;
use clusterup::{paths, Engine, Error};

pub type CmdResult<T> = clusterup::Result<(T, i32)>;

pub(crate) struct GlobalArgs {}

pub mod deploy;
pub mod join;
pub mod logs;
pub mod nodes;
pub mod steps;
pub mod verify;

/// Engine wired to the on-disk collaborators under the config directory.
pub(crate) fn open_engine(
    settings: Settings,
    inventory: Arc<JsonInventory>,
) -> clusterup::Result<Engine> {
    let connector = Arc::new(SshConnector::from_settings(&settings));
    let scripts = Arc::new(DirScriptStore::new(paths::scripts()?));
    let sink = Arc::new(SqliteLogSink::open(&paths::logs_db()?)?);
    let packages = Arc::new(DirPackageCache::new(paths::packages()?));

    Ok(Engine::new(connector, scripts, sink, packages, settings).with_inventory(inventory))
}

/// The node named by `id`, or the inventory's only primary.
pub(crate) fn primary_node(inventory: &dyn Inventory, id: Option<&str>) -> clusterup::Result<Node> {
    if let Some(id) = id {
        return inventory.get_node(id);
    }

    let mut primaries: Vec<Node> = inventory
        .list_nodes()?
        .into_iter()
        .filter(|n| n.role == Role::Primary)
        .collect();
    match primaries.len() {
        1 => Ok(primaries.remove(0)),
        0 => Err(Error::validation_missing_argument(vec!["node".to_string()])
            .with_hint("The inventory has no primary node; pass a node id")),
        n => Err(Error::validation_invalid_argument(
            "node",
            format!("Inventory has {} primaries; pass a node id", n),
            None,
            Some(primaries.into_iter().map(|n| n.id).collect()),
        )),
    }
}

/// Transcript lines echoed to the terminal as they happen.
pub(crate) fn progress_callback() -> LogCallback {
    Arc::new(|_node_id: &str, label: &str, message: &str| {
        crate::tty::progress(label, message);
    })
}

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (clusterup::Result<serde_json::Value>, i32) {
    crate::tty::status("clusterup is working...");

    match command {
        crate::Commands::Deploy(args) => dispatch!(args, global, deploy),
        crate::Commands::Verify(args) => dispatch!(args, global, verify),
        crate::Commands::Steps(args) => dispatch!(args, global, steps),
        crate::Commands::Nodes(args) => dispatch!(args, global, nodes),
        crate::Commands::JoinCommand(args) => dispatch!(args, global, join),
        crate::Commands::Logs(args) => dispatch!(args, global, logs),
    }
}
