use crate::error::{Error, Result, TargetDetails};
use crate::utils::io;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Deploying,
    Ready,
    Joined,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Deploying => "deploying",
            NodeStatus::Ready => "ready",
            NodeStatus::Joined => "joined",
            NodeStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

/// How a node authenticates. Exactly one is configured per node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    IdentityFile(String),
}

impl Node {
    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    pub fn credential(&self) -> Result<Credential> {
        let password = self.password.as_deref().filter(|p| !p.is_empty());
        let identity = self.identity_file.as_deref().filter(|p| !p.is_empty());

        match (password, identity) {
            (Some(p), None) => Ok(Credential::Password(p.to_string())),
            (None, Some(i)) => Ok(Credential::IdentityFile(i.to_string())),
            (Some(_), Some(_)) => Err(Error::validation_invalid_argument(
                "credential",
                format!(
                    "Node '{}' has both password and identityFile; configure exactly one",
                    self.id
                ),
                Some(self.id.clone()),
                None,
            )),
            (None, None) => Err(Error::validation_invalid_argument(
                "credential",
                format!("Node '{}' has no password or identityFile", self.id),
                Some(self.id.clone()),
                None,
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.id.trim().is_empty() {
            missing.push("id".to_string());
        }
        if self.host.trim().is_empty() {
            missing.push("host".to_string());
        }
        if self.user.trim().is_empty() {
            missing.push("user".to_string());
        }
        if !missing.is_empty() {
            return Err(Error::validation_missing_argument(missing));
        }
        self.credential().map(|_| ())
    }

    pub fn target(&self) -> TargetDetails {
        TargetDetails {
            node_id: Some(self.id.clone()),
            host: Some(self.host.clone()),
        }
    }

    /// Display label, falling back to the id when no name is set.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Read access to the node inventory, plus the narrow write-back the engine
/// is allowed: last-known status and detected distribution.
pub trait Inventory: Send + Sync {
    fn list_nodes(&self) -> Result<Vec<Node>>;

    fn get_node(&self, id: &str) -> Result<Node> {
        let nodes = self.list_nodes()?;
        if let Some(node) = nodes.iter().find(|n| n.id == id) {
            return Ok(node.clone());
        }
        let suggestions = nodes
            .iter()
            .filter(|n| n.id.contains(id) || id.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect();
        Err(Error::node_not_found(id, suggestions))
    }

    fn record_status(&self, id: &str, status: NodeStatus, os: Option<&str>) -> Result<()>;
}

/// Inventory backed by a JSON array of node records on disk.
pub struct JsonInventory {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonInventory {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(crate::paths::nodes_json()?))
    }

    fn read(&self) -> Result<Vec<Node>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = io::read_file(&self.path, "read node inventory")?;
        serde_json::from_str(&content)
            .map_err(|e| Error::config_invalid_json(self.path.display().to_string(), e))
    }
}

impl Inventory for JsonInventory {
    fn list_nodes(&self) -> Result<Vec<Node>> {
        self.read()
    }

    fn record_status(&self, id: &str, status: NodeStatus, os: Option<&str>) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::internal_unexpected("inventory lock poisoned"))?;

        let mut nodes = self.read()?;
        let node = nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| Error::node_not_found(id, Vec::new()))?;
        node.status = Some(status);
        if let Some(os) = os {
            node.os = Some(os.to_string());
        }

        let content = serde_json::to_string_pretty(&nodes).map_err(|e| {
            Error::internal_json(e.to_string(), Some("serialize node inventory".to_string()))
        })?;
        io::write_file_atomic(&self.path, &content, "write node inventory")
    }
}

#[derive(Default)]
pub struct MemoryInventory {
    nodes: Mutex<Vec<Node>>,
}

impl MemoryInventory {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes: Mutex::new(nodes),
        }
    }
}

impl Inventory for MemoryInventory {
    fn list_nodes(&self) -> Result<Vec<Node>> {
        self.nodes
            .lock()
            .map(|nodes| nodes.clone())
            .map_err(|_| Error::internal_unexpected("inventory lock poisoned"))
    }

    fn record_status(&self, id: &str, status: NodeStatus, os: Option<&str>) -> Result<()> {
        let mut nodes = self
            .nodes
            .lock()
            .map_err(|_| Error::internal_unexpected("inventory lock poisoned"))?;
        let node = nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| Error::node_not_found(id, Vec::new()))?;
        node.status = Some(status);
        if let Some(os) = os {
            node.os = Some(os.to_string());
        }
        Ok(())
    }
}
