use clap::{Args, Subcommand};
use serde::Serialize;

use clusterup::node::{Credential, Inventory, JsonInventory, Node, NodeStatus, Role};

use super::CmdResult;

#[derive(Args)]
pub struct NodesArgs {
    #[command(subcommand)]
    command: NodesCommand,
}

#[derive(Subcommand)]
enum NodesCommand {
    /// List inventory nodes
    List,
    /// Show one node
    Show {
        /// Node ID
        node_id: String,
    },
}

/// Node record as shown to operators. Passwords never leave the inventory.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub role: Role,
    pub auth: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

impl From<&Node> for NodeSummary {
    fn from(node: &Node) -> Self {
        let (auth, problem) = match node.validate().and_then(|_| node.credential()) {
            Ok(Credential::Password(_)) => ("password", None),
            Ok(Credential::IdentityFile(_)) => ("identity_file", None),
            Err(err) => ("invalid", Some(err.message)),
        };
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            host: node.host.clone(),
            port: node.port,
            user: node.user.clone(),
            role: node.role,
            auth: auth.to_string(),
            identity_file: node.identity_file.clone(),
            os: node.os.clone(),
            status: node.status,
            problem,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodesOutput {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeSummary>,
}

pub fn run(args: NodesArgs, _global: &super::GlobalArgs) -> CmdResult<NodesOutput> {
    let inventory = JsonInventory::open_default()?;
    match args.command {
        NodesCommand::List => list(&inventory),
        NodesCommand::Show { node_id } => show(&inventory, &node_id),
    }
}

fn list(inventory: &dyn Inventory) -> CmdResult<NodesOutput> {
    let nodes = inventory.list_nodes()?;
    Ok((
        NodesOutput {
            command: "nodes.list".to_string(),
            nodes: Some(nodes.iter().map(NodeSummary::from).collect()),
            node: None,
        },
        0,
    ))
}

fn show(inventory: &dyn Inventory, node_id: &str) -> CmdResult<NodesOutput> {
    let node = inventory.get_node(node_id)?;
    Ok((
        NodesOutput {
            command: "nodes.show".to_string(),
            nodes: None,
            node: Some(NodeSummary::from(&node)),
        },
        0,
    ))
}
