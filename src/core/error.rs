use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingKey,
    ConfigInvalidToml,
    ConfigInvalidJson,
    ConfigInvalidValue,

    ValidationMissingArgument,
    ValidationInvalidArgument,
    ValidationInvalidJson,

    NodeNotFound,

    SshIdentityFileNotFound,
    SshAuthFailed,
    SshConnectFailed,

    RemoteCommandFailed,
    RemoteCommandTimeout,

    ScriptUnsupportedDistribution,
    ScriptIntegrityRejected,

    DeployInvalidTopology,
    DeployStepFailed,
    DeployCancelled,

    JoinNoCredential,

    InternalIoError,
    InternalJsonError,
    InternalDatabaseError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingKey => "config.missing_key",
            ErrorCode::ConfigInvalidToml => "config.invalid_toml",
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",

            ErrorCode::ValidationMissingArgument => "validation.missing_argument",
            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",
            ErrorCode::ValidationInvalidJson => "validation.invalid_json",

            ErrorCode::NodeNotFound => "node.not_found",

            ErrorCode::SshIdentityFileNotFound => "ssh.identity_file_not_found",
            ErrorCode::SshAuthFailed => "ssh.auth_failed",
            ErrorCode::SshConnectFailed => "ssh.connect_failed",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",
            ErrorCode::RemoteCommandTimeout => "remote.command_timeout",

            ErrorCode::ScriptUnsupportedDistribution => "script.unsupported_distribution",
            ErrorCode::ScriptIntegrityRejected => "script.integrity_rejected",

            ErrorCode::DeployInvalidTopology => "deploy.invalid_topology",
            ErrorCode::DeployStepFailed => "deploy.step_failed",
            ErrorCode::DeployCancelled => "deploy.cancelled",

            ErrorCode::JoinNoCredential => "join.no_credential",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalDatabaseError => "internal.database_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotFoundDetails {
    pub id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandFailedDetails {
    pub command: String,
    pub exit_code: i32,
    pub output: String,
    pub target: TargetDetails,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailedDetails {
    pub step: String,
    pub node_id: String,
    pub node_name: String,
    pub cause_code: String,
    pub cause: String,
}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn validation_missing_argument(args: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ValidationMissingArgument,
            "Missing required argument",
            serde_json::json!({ "args": args }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.clone(),
            id,
            tried,
        });

        Self::new(
            ErrorCode::ValidationInvalidArgument,
            format!("Invalid argument: {}", problem),
            details,
        )
    }

    pub fn validation_invalid_json(err: serde_json::Error, context: Option<String>) -> Self {
        let details = serde_json::json!({
            "error": err.to_string(),
            "context": context,
        });

        Self::new(ErrorCode::ValidationInvalidJson, "Invalid JSON", details)
    }

    pub fn node_not_found(id: impl Into<String>, suggestions: Vec<String>) -> Self {
        let id = id.into();
        Self::new(
            ErrorCode::NodeNotFound,
            format!("Node '{}' not found", id),
            to_details(NotFoundDetails { id, suggestions }),
        )
        .with_hint("Run 'clusterup nodes list' to see available nodes")
    }

    pub fn ssh_identity_file_not_found(
        node_id: impl Into<String>,
        identity_file: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCode::SshIdentityFileNotFound,
            "SSH identity file not found",
            serde_json::json!({
                "nodeId": node_id.into(),
                "identityFile": identity_file.into(),
            }),
        )
    }

    pub fn ssh_auth_failed(target: TargetDetails, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorCode::SshAuthFailed,
            format!("SSH authentication failed: {}", reason),
            serde_json::json!({ "target": target, "reason": reason }),
        )
    }

    pub fn ssh_connect_failed(target: TargetDetails, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut err = Self::new(
            ErrorCode::SshConnectFailed,
            format!("SSH connection failed: {}", reason),
            serde_json::json!({ "target": target, "reason": reason }),
        );
        err.retryable = Some(true);
        err
    }

    pub fn remote_command_failed(details: RemoteCommandFailedDetails) -> Self {
        let message = format!("Remote command failed (exit {})", details.exit_code);
        Self::new(ErrorCode::RemoteCommandFailed, message, to_details(details))
    }

    pub fn remote_command_timeout(
        command: impl Into<String>,
        timeout_secs: u64,
        target: TargetDetails,
    ) -> Self {
        let mut err = Self::new(
            ErrorCode::RemoteCommandTimeout,
            format!("Remote command exceeded {}s", timeout_secs),
            serde_json::json!({
                "command": command.into(),
                "timeoutSecs": timeout_secs,
                "target": target,
            }),
        );
        err.retryable = Some(false);
        err
    }

    pub fn script_unsupported_distribution(step: &str, distro: &str) -> Self {
        Self::new(
            ErrorCode::ScriptUnsupportedDistribution,
            format!("No built-in '{}' script for distribution '{}'", step, distro),
            serde_json::json!({ "step": step, "distro": distro }),
        )
        .with_hint(format!(
            "Provide an override script named '{}_{}' or '{}'",
            distro, step, step
        ))
    }

    pub fn script_integrity_rejected(key: &str, missing: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ScriptIntegrityRejected,
            format!(
                "Override '{}' rejected: missing {}",
                key,
                missing.join(", ")
            ),
            serde_json::json!({ "key": key, "missing": missing }),
        )
    }

    pub fn deploy_invalid_topology(problem: impl Into<String>) -> Self {
        let problem = problem.into();
        Self::new(
            ErrorCode::DeployInvalidTopology,
            format!("Invalid cluster topology: {}", problem),
            serde_json::json!({ "problem": problem }),
        )
    }

    pub fn deploy_step_failed(details: StepFailedDetails) -> Self {
        let message = format!(
            "Step '{}' failed on node '{}': {}",
            details.step, details.node_name, details.cause
        );
        Self::new(ErrorCode::DeployStepFailed, message, to_details(details))
    }

    pub fn deploy_cancelled(phase: impl Into<String>) -> Self {
        let phase = phase.into();
        Self::new(
            ErrorCode::DeployCancelled,
            format!("Deployment cancelled during {}", phase),
            serde_json::json!({ "phase": phase }),
        )
    }

    pub fn join_no_credential(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorCode::JoinNoCredential,
            format!("No join credential available: {}", reason),
            serde_json::json!({ "reason": reason }),
        )
        .with_hint(
            "Set CLUSTERUP_JOIN_TOKEN, CLUSTERUP_JOIN_CA_HASH and CLUSTERUP_JOIN_ENDPOINT",
        )
    }

    pub fn config_missing_key(key: impl Into<String>, path: Option<String>) -> Self {
        Self::new(
            ErrorCode::ConfigMissingKey,
            "Missing required configuration key",
            serde_json::json!({ "key": key.into(), "path": path }),
        )
    }

    pub fn config_invalid_toml(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidToml,
            "Invalid TOML in configuration",
            serde_json::json!({ "path": path.into(), "error": err.to_string() }),
        )
    }

    pub fn config_invalid_json(path: impl Into<String>, err: serde_json::Error) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidJson,
            "Invalid JSON in configuration",
            serde_json::json!({ "path": path.into(), "error": err.to_string() }),
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let details = to_details(ConfigInvalidValueDetails {
            key: key.into(),
            value,
            problem: problem.into(),
        });

        Self::new(
            ErrorCode::ConfigInvalidValue,
            "Invalid configuration value",
            details,
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalIoError, "IO error", details)
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalJsonError, "JSON error", details)
    }

    pub fn internal_database(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalDatabaseError, "Database error", details)
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::DeployCancelled
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::internal_database(err.to_string(), None)
    }
}
