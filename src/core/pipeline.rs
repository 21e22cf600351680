//! The deployment step pipeline.
//!
//! Steps run in one fixed order. The common steps run on every node, then
//! the primary is initialized, secondaries join, and the cluster is verified.
//! Each step resolves its script per node distribution (see
//! [`crate::script`]) and runs it over the node's session.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{Error, ErrorCode, RemoteCommandFailedDetails, Result, StepFailedDetails};
use crate::join::mask_tokens;
use crate::node::Node;
use crate::packages::PackageCache;
use crate::run::Transcript;
use crate::script::{builtin, ScriptResolver};
use crate::ssh::{CommandOutput, Session};
use crate::utils::shell;
use crate::utils::template::TemplateVars;

/// Where staged packages are copied to on the node.
const REMOTE_PACKAGE_ROOT: &str = "/tmp/clusterup-packages";

/// Package name looked up in the package cache for component installs.
const COMPONENTS_PACKAGE: &str = "kubernetes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    SystemPreparation,
    IpForwardConfiguration,
    ContainerRuntimeInstall,
    ContainerRuntimeConfigure,
    RepositoryConfiguration,
    ComponentsInstall,
    PrimaryInit,
    SecondaryJoin,
    ClusterVerification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepScope {
    EveryNode,
    Primary,
    Secondaries,
}

impl StepName {
    pub const ALL: [StepName; 9] = [
        StepName::SystemPreparation,
        StepName::IpForwardConfiguration,
        StepName::ContainerRuntimeInstall,
        StepName::ContainerRuntimeConfigure,
        StepName::RepositoryConfiguration,
        StepName::ComponentsInstall,
        StepName::PrimaryInit,
        StepName::SecondaryJoin,
        StepName::ClusterVerification,
    ];

    /// Steps every node runs before any role-specific work.
    pub const COMMON: [StepName; 6] = [
        StepName::SystemPreparation,
        StepName::IpForwardConfiguration,
        StepName::ContainerRuntimeInstall,
        StepName::ContainerRuntimeConfigure,
        StepName::RepositoryConfiguration,
        StepName::ComponentsInstall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::SystemPreparation => "system_preparation",
            StepName::IpForwardConfiguration => "ip_forward_configuration",
            StepName::ContainerRuntimeInstall => "container_runtime_install",
            StepName::ContainerRuntimeConfigure => "container_runtime_configure",
            StepName::RepositoryConfiguration => "repository_configuration",
            StepName::ComponentsInstall => "components_install",
            StepName::PrimaryInit => "primary_init",
            StepName::SecondaryJoin => "secondary_join",
            StepName::ClusterVerification => "cluster_verification",
        }
    }

    /// Parse a canonical or legacy step name. Dashes and case are ignored.
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.trim().to_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|step| {
            step.as_str() == normalized || step.legacy_names().contains(&normalized.as_str())
        })
    }

    /// Older override names still honored during script lookup.
    pub fn legacy_names(&self) -> &'static [&'static str] {
        match self {
            StepName::SystemPreparation => &["prepare_system", "init_system"],
            StepName::IpForwardConfiguration => &["ip_forward", "enable_ip_forward"],
            StepName::ContainerRuntimeInstall => &["install_docker", "install_containerd"],
            StepName::ContainerRuntimeConfigure => &["config_docker", "configure_containerd"],
            StepName::RepositoryConfiguration => &["config_k8s_repo", "setup_repo"],
            StepName::ComponentsInstall => &["install_k8s", "install_kubeadm"],
            StepName::PrimaryInit => &["init_master", "kubeadm_init"],
            StepName::SecondaryJoin => &["join_node", "join_worker"],
            StepName::ClusterVerification => &["verify_cluster", "check_cluster"],
        }
    }

    pub fn scope(&self) -> StepScope {
        match self {
            StepName::PrimaryInit | StepName::ClusterVerification => StepScope::Primary,
            StepName::SecondaryJoin => StepScope::Secondaries,
            _ => StepScope::EveryNode,
        }
    }

    /// Failures of preparatory steps are warnings; the pipeline continues.
    pub fn is_preparatory(&self) -> bool {
        matches!(
            self,
            StepName::SystemPreparation | StepName::IpForwardConfiguration
        )
    }

    /// Overrides for this step must restart, enable and reload the service.
    pub fn requires_integrity_check(&self) -> bool {
        matches!(self, StepName::ContainerRuntimeConfigure)
    }

    /// Steps followed by the settle delay.
    pub fn settles(&self) -> bool {
        matches!(self, StepName::ContainerRuntimeConfigure)
    }

    pub fn description(&self) -> &'static str {
        match self {
            StepName::SystemPreparation => "Disable swap, load kernel modules, set hostname",
            StepName::IpForwardConfiguration => "Enable and persist IPv4 forwarding",
            StepName::ContainerRuntimeInstall => "Install the container runtime",
            StepName::ContainerRuntimeConfigure => "Configure and restart the container runtime",
            StepName::RepositoryConfiguration => "Add the Kubernetes package repository",
            StepName::ComponentsInstall => "Install kubelet, kubeadm and kubectl",
            StepName::PrimaryInit => "Initialize the control plane and network add-on",
            StepName::SecondaryJoin => "Join the cluster as a worker",
            StepName::ClusterVerification => "List nodes and system pods",
        }
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Steps the caller asked to skip. Unknown names are kept for reporting and
/// otherwise ignored.
#[derive(Debug, Clone, Default)]
pub struct SkipSet {
    steps: BTreeSet<StepName>,
    unknown: Vec<String>,
}

impl SkipSet {
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Self {
        let mut set = Self::default();
        for name in names {
            let name = name.as_ref();
            if name.trim().is_empty() {
                continue;
            }
            match StepName::parse(name) {
                Some(step) => {
                    set.steps.insert(step);
                }
                None => set.unknown.push(name.to_string()),
            }
        }
        set
    }

    pub fn contains(&self, step: StepName) -> bool {
        self.steps.contains(&step)
    }

    pub fn unknown(&self) -> &[String] {
        &self.unknown
    }

    pub fn steps(&self) -> impl Iterator<Item = StepName> + '_ {
        self.steps.iter().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    /// Failed, but the step is preparatory so the pipeline went on.
    Warning,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step: StepName,
    pub node_id: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn new(step: StepName, node: &Node, status: StepStatus) -> Self {
        Self {
            step,
            node_id: node.id.clone(),
            status,
            script: None,
            error: None,
        }
    }
}

/// Values fixed for the whole run and substituted into every script.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub run_id: String,
    /// Full version without a leading `v`, e.g. `1.28.2`.
    pub version: String,
    /// Repository channel, e.g. `v1.28`.
    pub minor: String,
    pub arch: String,
    pub pod_cidr: String,
    pub image_repository: Option<String>,
    pub network_addon_manifest: String,
}

impl RunParams {
    pub fn new(run_id: &str, version: &str, arch: &str, settings: &Settings) -> Result<Self> {
        let (version, minor) = normalize_version(version)?;
        Ok(Self {
            run_id: run_id.to_string(),
            version,
            minor,
            arch: normalize_arch(arch)?,
            pod_cidr: settings.pod_cidr.clone(),
            image_repository: settings
                .image_repository
                .clone()
                .filter(|r| !r.trim().is_empty()),
            network_addon_manifest: settings.network_addon_manifest.clone(),
        })
    }

    /// Parameters for steps that do not depend on a Kubernetes version,
    /// such as verification of an existing cluster.
    pub fn unversioned(run_id: &str, settings: &Settings) -> Self {
        Self {
            run_id: run_id.to_string(),
            version: String::new(),
            minor: String::new(),
            arch: String::new(),
            pod_cidr: settings.pod_cidr.clone(),
            image_repository: settings.image_repository.clone(),
            network_addon_manifest: settings.network_addon_manifest.clone(),
        }
    }

    /// Template variables for `node` running on `distro`.
    pub fn vars(&self, node: &Node, distro: &str) -> Vec<(&'static str, String)> {
        let image_repository = self.image_repository.clone().unwrap_or_default();
        let image_repository_flag = self
            .image_repository
            .as_ref()
            .map(|r| format!("--image-repository={}", r))
            .unwrap_or_default();

        vec![
            (TemplateVars::VERSION, self.version.clone()),
            (TemplateVars::MINOR, self.minor.clone()),
            (TemplateVars::ARCH, self.arch.clone()),
            (TemplateVars::DISTRO, distro.to_string()),
            (TemplateVars::NODE_NAME, node.label().to_string()),
            (TemplateVars::HOST, node.host.clone()),
            (TemplateVars::POD_CIDR, self.pod_cidr.clone()),
            (TemplateVars::IMAGE_REPOSITORY, image_repository),
            (TemplateVars::IMAGE_REPOSITORY_FLAG, image_repository_flag),
            (
                TemplateVars::NETWORK_ADDON_MANIFEST,
                self.network_addon_manifest.clone(),
            ),
        ]
    }
}

/// Validate a Kubernetes version and derive its repository channel.
///
/// `v1.28.2` and `1.28.2` both yield `("1.28.2", "v1.28")`.
pub fn normalize_version(version: &str) -> Result<(String, String)> {
    let trimmed = version.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let parsed = semver::Version::parse(bare).map_err(|e| {
        Error::validation_invalid_argument(
            "version",
            format!("'{}' is not a full Kubernetes version ({})", version, e),
            None,
            Some(vec!["1.28.2".to_string(), "v1.29.0".to_string()]),
        )
    })?;
    Ok((
        parsed.to_string(),
        format!("v{}.{}", parsed.major, parsed.minor),
    ))
}

/// Canonical architecture name as used by package repositories.
pub fn normalize_arch(arch: &str) -> Result<String> {
    match arch.trim().to_lowercase().as_str() {
        "amd64" | "x86_64" | "x64" => Ok("amd64".to_string()),
        "arm64" | "aarch64" => Ok("arm64".to_string()),
        _ => Err(Error::validation_invalid_argument(
            "arch",
            format!("Unsupported architecture '{}'", arch),
            None,
            Some(vec!["amd64".to_string(), "arm64".to_string()]),
        )),
    }
}

/// A connected node. The distribution is detected on first use and cached.
pub struct NodeTarget {
    pub session: Session,
    distro: Option<String>,
}

impl NodeTarget {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            distro: None,
        }
    }

    pub fn node(&self) -> &Node {
        self.session.node()
    }

    pub fn detected_distro(&self) -> Option<&str> {
        self.distro.as_deref()
    }

    pub fn distro(&mut self) -> Result<String> {
        if let Some(distro) = &self.distro {
            return Ok(distro.clone());
        }

        let detected = match self.session.run_buffered("detect_distro", builtin::DETECT_DISTRO) {
            Ok(out) if out.success => parse_distro(&out.output),
            Ok(_) => None,
            Err(err) if err.code == ErrorCode::RemoteCommandTimeout => return Err(err),
            Err(err) if err.code == ErrorCode::SshConnectFailed => return Err(err),
            Err(_) => None,
        };

        let distro = detected
            .or_else(|| self.node().os.clone().filter(|os| !os.trim().is_empty()))
            .ok_or_else(|| {
                Error::remote_command_failed(RemoteCommandFailedDetails {
                    command: "detect_distro".to_string(),
                    exit_code: -1,
                    output: "could not read /etc/os-release".to_string(),
                    target: self.node().target(),
                })
            })?;

        self.distro = Some(distro.clone());
        Ok(distro)
    }
}

fn parse_distro(output: &str) -> Option<String> {
    output
        .lines()
        .rev()
        .map(|l| l.trim().trim_matches('"').to_lowercase())
        .find(|l| !l.is_empty())
}

/// Runs pipeline steps against connected nodes.
pub struct StepRunner<'a> {
    resolver: &'a ScriptResolver,
    packages: &'a dyn PackageCache,
    params: &'a RunParams,
    settings: &'a Settings,
    transcript: &'a Transcript,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        resolver: &'a ScriptResolver,
        packages: &'a dyn PackageCache,
        params: &'a RunParams,
        settings: &'a Settings,
        transcript: &'a Transcript,
    ) -> Self {
        Self {
            resolver,
            packages,
            params,
            settings,
            transcript,
        }
    }

    pub fn note(&self, node: &Node, message: impl AsRef<str>) {
        self.transcript.node(node, message);
    }

    /// Run the common steps on one node, in order.
    ///
    /// Returns the first fatal failure. Preparatory failures only produce a
    /// warning result.
    pub fn run_common(&self, target: &mut NodeTarget, skip: &SkipSet) -> Result<Vec<StepResult>> {
        let node = target.node().clone();
        let mut results = Vec::with_capacity(StepName::COMMON.len());

        for step in StepName::COMMON {
            if skip.contains(step) {
                self.transcript.node(&node, format!("{}: skipped", step));
                results.push(StepResult::new(step, &node, StepStatus::Skipped));
                continue;
            }

            let mut result = StepResult::new(step, &node, StepStatus::Success);
            match self.run_step(target, step, &[]) {
                Ok((_, script)) => {
                    result.script = Some(script);
                    self.transcript.node(&node, format!("{}: done", step));
                    if step.settles() && !self.settings.settle_delay().is_zero() {
                        std::thread::sleep(self.settings.settle_delay());
                    }
                }
                Err(err) if step.is_preparatory() && !is_fatal_for_node(&err) => {
                    self.transcript.node(
                        &node,
                        format!("{}: warning: {} (continuing)", step, err.message),
                    );
                    result.status = StepStatus::Warning;
                    result.error = Some(err.message);
                }
                Err(err) => {
                    self.transcript
                        .node(&node, format!("{}: failed: {}", step, err.message));
                    return Err(step_failed(step, &node, err));
                }
            }
            results.push(result);
        }

        Ok(results)
    }

    /// Resolve, render and run one step, streaming output into the transcript.
    ///
    /// Returns the command output and the script description. A non-zero exit
    /// becomes a `remote.command_failed` error.
    pub fn run_step(
        &self,
        target: &mut NodeTarget,
        step: StepName,
        extra: &[(&str, &str)],
    ) -> Result<(CommandOutput, String)> {
        self.run_step_with(target, step, extra, &mut |_| {})
    }

    /// Like [`run_step`](Self::run_step), also handing each output line to `observe`.
    pub fn run_step_with(
        &self,
        target: &mut NodeTarget,
        step: StepName,
        extra: &[(&str, &str)],
        observe: &mut dyn FnMut(&str),
    ) -> Result<(CommandOutput, String)> {
        let node = target.node().clone();
        let distro = target.distro()?;
        let resolved = self.resolver.resolve(step, &distro)?;
        for rejected in &resolved.rejected {
            self.transcript
                .node(&node, format!("{}: warning: {}", step, rejected.message));
        }
        let description = resolved.describe();
        self.transcript
            .node(&node, format!("{}: running {} on {}", step, description, distro));

        let package_dir = if step == StepName::ComponentsInstall {
            self.stage_packages(target, &distro)?
        } else {
            String::new()
        };

        let mut vars = self.params.vars(&node, &distro);
        vars.push((TemplateVars::PACKAGE_DIR, package_dir));
        let mut pairs: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        pairs.extend_from_slice(extra);
        let script = resolved.render(&pairs);

        let transcript = self.transcript;
        let output = target
            .session
            .run_streaming(step.as_str(), &script, &mut |line| {
                transcript.node(&node, mask_tokens(line));
                observe(line);
            })?;

        if !output.success {
            return Err(command_failed(step.as_str(), &node, &output));
        }
        Ok((output, description))
    }

    /// Copy cached packages to the node. Returns the remote directory, or an
    /// empty string when the cache has nothing for this node.
    fn stage_packages(&self, target: &mut NodeTarget, distro: &str) -> Result<String> {
        let Some(local_dir) = self.packages.resolve_path(
            COMPONENTS_PACKAGE,
            &self.params.version,
            &self.params.arch,
            distro,
        ) else {
            return Ok(String::new());
        };

        let files = package_files(&local_dir)?;
        if files.is_empty() {
            return Ok(String::new());
        }

        let node = target.node().clone();
        let remote_dir = format!("{}/{}", REMOTE_PACKAGE_ROOT, self.params.version);
        let mkdir = format!("mkdir -p {}", shell::quote_path(&remote_dir));
        let out = target.session.run_buffered("stage_packages", &mkdir)?;
        if !out.success {
            return Err(command_failed("stage_packages", &node, &out));
        }

        for file in &files {
            let Some(file_name) = file.file_name() else {
                continue;
            };
            let remote_path = format!("{}/{}", remote_dir, file_name.to_string_lossy());
            let out = target.session.upload(file, &remote_path)?;
            if !out.success {
                return Err(command_failed("stage_packages", &node, &out));
            }
        }

        self.transcript.node(
            &node,
            format!(
                "staged {} cached package(s) from {} to {}",
                files.len(),
                local_dir.display(),
                remote_dir
            ),
        );
        Ok(remote_dir)
    }
}

fn package_files(dir: &std::path::Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("read {}", dir.display())))
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

/// Errors that end a node's pipeline even on a preparatory step.
fn is_fatal_for_node(err: &Error) -> bool {
    matches!(
        err.code,
        ErrorCode::ScriptUnsupportedDistribution
            | ErrorCode::SshConnectFailed
            | ErrorCode::SshAuthFailed
    )
}

/// Keep the tail of long outputs in error details.
fn output_tail(output: &str) -> String {
    const MAX_LINES: usize = 20;
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(MAX_LINES);
    lines[start..].join("\n")
}

pub fn command_failed(command: &str, node: &Node, output: &CommandOutput) -> Error {
    Error::remote_command_failed(RemoteCommandFailedDetails {
        command: command.to_string(),
        exit_code: output.exit_code,
        output: output_tail(&output.output),
        target: node.target(),
    })
}

pub fn step_failed(step: StepName, node: &Node, cause: Error) -> Error {
    Error::deploy_step_failed(StepFailedDetails {
        step: step.as_str().to_string(),
        node_id: node.id.clone(),
        node_name: node.label().to_string(),
        cause_code: cause.code.as_str().to_string(),
        cause: cause.message,
    })
}

/// How one step would run for a given distribution, without executing it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStep {
    pub step: StepName,
    pub scope: StepScope,
    pub description: &'static str,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resolve every step for `distro` and report which script would run.
pub fn plan(resolver: &ScriptResolver, distro: &str, skip: &SkipSet) -> Vec<PlannedStep> {
    StepName::ALL
        .into_iter()
        .map(|step| {
            let mut planned = PlannedStep {
                step,
                scope: step.scope(),
                description: step.description(),
                skipped: skip.contains(step),
                script: None,
                warnings: Vec::new(),
                error: None,
            };
            match resolver.resolve(step, distro) {
                Ok(resolved) => {
                    planned.script = Some(resolved.describe());
                    planned.warnings = resolved.rejected.into_iter().map(|e| e.message).collect();
                }
                Err(err) => planned.error = Some(err.message),
            }
            planned
        })
        .collect()
}
