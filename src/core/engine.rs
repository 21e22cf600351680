//! Deployment orchestration.
//!
//! A run validates the topology, prepares every node in turn, initializes
//! the primary, joins secondaries concurrently and finally verifies the
//! cluster. The caller always gets the transcript back, with the first
//! fatal error, if any, alongside it.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::fanout::{FanOut, JoinOutcome};
use crate::join::{JoinCapture, JoinResolver, JoinSource};
use crate::logs::LogSink;
use crate::node::{Inventory, Node, NodeStatus};
use crate::packages::PackageCache;
use crate::pipeline::{
    step_failed, NodeTarget, RunParams, SkipSet, StepName, StepResult, StepRunner, StepStatus,
};
use crate::run::{CancelSignal, LogCallback, Transcript};
use crate::script::{ScriptResolver, ScriptSource};
use crate::ssh::{Connector, Session};

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub nodes: Vec<Node>,
    /// Kubernetes version, with or without a leading `v`.
    pub version: String,
    pub arch: String,
    /// Step names to skip on every node. Unknown names are ignored.
    pub skip_steps: Vec<String>,
    pub cancel: CancelSignal,
}

impl DeployRequest {
    pub fn new(nodes: Vec<Node>, version: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            nodes,
            version: version.into(),
            arch: arch.into(),
            skip_steps: Vec::new(),
            cancel: CancelSignal::new(),
        }
    }

    pub fn skip(mut self, steps: &[&str]) -> Self {
        self.skip_steps = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployReport {
    pub run_id: String,
    pub success: bool,
    pub transcript: Vec<String>,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_source: Option<JoinSource>,
    pub join_outcomes: BTreeMap<String, JoinOutcome>,
    #[serde(skip)]
    pub error: Option<Error>,
}

impl DeployReport {
    pub fn transcript_text(&self) -> String {
        self.transcript.join("\n")
    }

    /// Secondaries that did not end up joined.
    pub fn failed_joins(&self) -> usize {
        self.join_outcomes.values().filter(|o| !o.is_joined()).count()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub run_id: String,
    pub node_id: String,
    pub script: String,
    pub output: String,
    pub transcript: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCommandReport {
    pub run_id: String,
    pub node_id: String,
    pub source: JoinSource,
    pub endpoint: String,
    pub join_command: String,
    pub transcript: Vec<String>,
}

#[derive(Default)]
struct RunState {
    steps: Vec<StepResult>,
    join_source: Option<JoinSource>,
    join_outcomes: BTreeMap<String, JoinOutcome>,
}

/// The orchestration engine. Collaborators are injected so every remote and
/// storage concern can be swapped.
pub struct Engine {
    connector: Arc<dyn Connector>,
    resolver: Arc<ScriptResolver>,
    sink: Arc<dyn LogSink>,
    packages: Arc<dyn PackageCache>,
    settings: Arc<Settings>,
    inventory: Option<Arc<dyn Inventory>>,
}

impl Engine {
    pub fn new(
        connector: Arc<dyn Connector>,
        scripts: Arc<dyn ScriptSource>,
        sink: Arc<dyn LogSink>,
        packages: Arc<dyn PackageCache>,
        settings: Settings,
    ) -> Self {
        Self {
            connector,
            resolver: Arc::new(ScriptResolver::new(scripts)),
            sink,
            packages,
            settings: Arc::new(settings),
            inventory: None,
        }
    }

    /// Write node status and detected distribution back to `inventory`.
    pub fn with_inventory(mut self, inventory: Arc<dyn Inventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn resolver(&self) -> &ScriptResolver {
        &self.resolver
    }

    pub fn deploy(&self, request: DeployRequest, on_log: Option<LogCallback>) -> DeployReport {
        let run_id = Uuid::new_v4().to_string();
        let transcript = Arc::new(Transcript::new(on_log));
        let mut state = RunState::default();

        let error = self
            .execute(&run_id, &request, &transcript, &mut state)
            .err();
        match &error {
            Some(err) => {
                transcript.cluster(format!("deployment failed: {}", err.message));
                log_status!("deploy", "Run {} failed: {}", run_id, err.message);
            }
            None => {
                transcript.cluster("deployment finished");
                log_status!("deploy", "Run {} finished", run_id);
            }
        }

        DeployReport {
            run_id,
            success: error.is_none(),
            transcript: transcript.lines(),
            steps: state.steps,
            join_source: state.join_source,
            join_outcomes: state.join_outcomes,
            error,
        }
    }

    fn execute(
        &self,
        run_id: &str,
        request: &DeployRequest,
        transcript: &Arc<Transcript>,
        state: &mut RunState,
    ) -> Result<()> {
        validate_topology(&request.nodes)?;
        let params = Arc::new(RunParams::new(
            run_id,
            &request.version,
            &request.arch,
            &self.settings,
        )?);

        let skip = SkipSet::parse(&request.skip_steps);
        if !skip.unknown().is_empty() {
            transcript.cluster(format!(
                "ignoring unknown step name(s): {}",
                skip.unknown().join(", ")
            ));
        }
        transcript.cluster(format!(
            "run {}: Kubernetes {} ({}) on {} node(s)",
            run_id,
            params.version,
            params.arch,
            request.nodes.len()
        ));

        let runner = StepRunner::new(
            &self.resolver,
            self.packages.as_ref(),
            &params,
            &self.settings,
            transcript,
        );
        let cancel = &request.cancel;

        // Common steps, one node at a time.
        let mut primary: Option<NodeTarget> = None;
        let mut secondaries: Vec<Node> = Vec::new();
        for node in &request.nodes {
            check_cancel(cancel, transcript, "node preparation")?;
            self.record_status(node, NodeStatus::Deploying, None);

            let mut target = match self.connect(node, run_id, transcript) {
                Ok(target) => target,
                Err(err) if !node.is_primary() => {
                    transcript.node(node, format!("excluded: {}", err.message));
                    state
                        .join_outcomes
                        .insert(node.id.clone(), JoinOutcome::failed(&err));
                    self.record_status(node, NodeStatus::Failed, None);
                    continue;
                }
                Err(err) => {
                    self.record_status(node, NodeStatus::Failed, None);
                    return Err(err);
                }
            };

            match runner.run_common(&mut target, &skip) {
                Ok(results) => state.steps.extend(results),
                Err(err) => {
                    self.record_status(node, NodeStatus::Failed, target.detected_distro());
                    return Err(err);
                }
            }

            let mut node = node.clone();
            if let Some(distro) = target.detected_distro() {
                node.os = Some(distro.to_string());
            }
            self.record_status(&node, NodeStatus::Deploying, node.os.as_deref());

            if node.is_primary() {
                primary = Some(target);
            } else {
                secondaries.push(node);
            }
        }

        check_cancel(cancel, transcript, "primary initialization")?;
        let captured = match primary.as_mut() {
            Some(target) => self.init_primary(&runner, target, &skip, state)?,
            None => None,
        };

        if !secondaries.is_empty() {
            check_cancel(cancel, transcript, "secondary join")?;
            self.join_secondaries(
                &secondaries,
                primary.as_mut(),
                captured.as_deref(),
                &params,
                &skip,
                transcript,
                cancel,
                state,
            );
        }

        check_cancel(cancel, transcript, "cluster verification")?;
        if let Some(target) = primary.as_mut() {
            let node = target.node().clone();
            if skip.contains(StepName::ClusterVerification) {
                transcript.node(&node, "cluster_verification: skipped");
                state.steps.push(StepResult::new(
                    StepName::ClusterVerification,
                    &node,
                    StepStatus::Skipped,
                ));
            } else {
                let mut result =
                    StepResult::new(StepName::ClusterVerification, &node, StepStatus::Success);
                match runner.run_step(target, StepName::ClusterVerification, &[]) {
                    Ok((_, script)) => {
                        result.script = Some(script);
                        state.steps.push(result);
                    }
                    Err(err) => {
                        result.status = StepStatus::Failed;
                        result.error = Some(err.message.clone());
                        state.steps.push(result);
                        self.record_status(&node, NodeStatus::Failed, target.detected_distro());
                        return Err(step_failed(StepName::ClusterVerification, &node, err));
                    }
                }
            }
            self.record_status(&node, NodeStatus::Ready, target.detected_distro());
        }

        Ok(())
    }

    /// Re-assert forwarding, then run primary init. Returns the join command
    /// seen in its output, if any.
    fn init_primary(
        &self,
        runner: &StepRunner<'_>,
        target: &mut NodeTarget,
        skip: &SkipSet,
        state: &mut RunState,
    ) -> Result<Option<String>> {
        let node = target.node().clone();
        if skip.contains(StepName::PrimaryInit) {
            runner.note(&node, "primary_init: skipped");
            state.steps.push(StepResult::new(
                StepName::PrimaryInit,
                &node,
                StepStatus::Skipped,
            ));
            return Ok(None);
        }

        // kubeadm preflight fails on a disabled ip_forward; other steps may have reset it
        if !skip.contains(StepName::IpForwardConfiguration) {
            if let Err(err) = runner.run_step(target, StepName::IpForwardConfiguration, &[]) {
                log_status!("deploy", "Re-applying IP forwarding on '{}' failed: {}", node.label(), err.message);
            }
        }

        let mut capture = JoinCapture::new();
        let mut result = StepResult::new(StepName::PrimaryInit, &node, StepStatus::Success);
        match runner.run_step_with(target, StepName::PrimaryInit, &[], &mut |line| {
            capture.observe(line)
        }) {
            Ok((_, script)) => {
                result.script = Some(script);
                state.steps.push(result);
            }
            Err(err) => {
                result.status = StepStatus::Failed;
                result.error = Some(err.message.clone());
                state.steps.push(result);
                self.record_status(&node, NodeStatus::Failed, target.detected_distro());
                return Err(step_failed(StepName::PrimaryInit, &node, err));
            }
        }

        Ok(capture.captured().map(str::to_string))
    }

    #[allow(clippy::too_many_arguments)]
    fn join_secondaries(
        &self,
        secondaries: &[Node],
        primary: Option<&mut NodeTarget>,
        captured: Option<&str>,
        params: &Arc<RunParams>,
        skip: &SkipSet,
        transcript: &Arc<Transcript>,
        cancel: &CancelSignal,
        state: &mut RunState,
    ) {
        if skip.contains(StepName::SecondaryJoin) {
            for node in secondaries {
                transcript.node(node, "secondary_join: skipped");
                state
                    .join_outcomes
                    .insert(node.id.clone(), JoinOutcome::Skipped);
            }
            return;
        }

        let resolver = JoinResolver::new(&self.settings, transcript);
        let resolved = match primary {
            Some(target) => resolver
                .resolve(captured, &mut target.session)
                .ok_or_else(|| Error::join_no_credential("the primary could not provide a join command")),
            None => match resolver.external() {
                Ok(Some(join)) => Ok(join),
                Ok(None) => Err(Error::join_no_credential(
                    "no primary in this deployment and no external credential configured",
                )),
                Err(err) => Err(Error::join_no_credential(format!(
                    "external credential rejected: {}: {}",
                    err.details["key"].as_str().unwrap_or("join"),
                    err.details["problem"].as_str().unwrap_or(&err.message)
                ))),
            },
        };

        let join = match resolved {
            Ok(join) => join,
            Err(err) => {
                log_status!("join", "{}", err.message);
                transcript.cluster(&err.message);
                for node in secondaries {
                    state
                        .join_outcomes
                        .insert(node.id.clone(), JoinOutcome::NoCredential);
                    self.record_status(node, NodeStatus::Failed, node.os.as_deref());
                }
                return;
            }
        };
        state.join_source = Some(join.source);

        let fanout = FanOut {
            connector: Arc::clone(&self.connector),
            resolver: Arc::clone(&self.resolver),
            sink: Arc::clone(&self.sink),
            packages: Arc::clone(&self.packages),
            params: Arc::clone(params),
            settings: Arc::clone(&self.settings),
            transcript: Arc::clone(transcript),
        };
        let outcomes = fanout.join_all(secondaries, &join.credential.command(), cancel);

        for node in secondaries {
            match outcomes.get(&node.id) {
                Some(JoinOutcome::Joined) => {
                    self.record_status(node, NodeStatus::Joined, node.os.as_deref())
                }
                Some(JoinOutcome::Cancelled) | None => {}
                Some(_) => self.record_status(node, NodeStatus::Failed, node.os.as_deref()),
            }
        }
        state.join_outcomes.extend(outcomes);
    }

    /// Run cluster verification against `node`. Read-only; safe to repeat.
    pub fn verify(&self, node: &Node, on_log: Option<LogCallback>) -> Result<VerifyReport> {
        if !node.is_primary() {
            return Err(Error::validation_invalid_argument(
                "node",
                format!("Node '{}' is not the primary; verification runs on the primary", node.id),
                Some(node.id.clone()),
                None,
            ));
        }
        node.validate()?;

        let run_id = Uuid::new_v4().to_string();
        let transcript = Transcript::new(on_log);
        let params = RunParams::unversioned(&run_id, &self.settings);
        let runner = StepRunner::new(
            &self.resolver,
            self.packages.as_ref(),
            &params,
            &self.settings,
            &transcript,
        );

        let mut target = self.connect(node, &run_id, &transcript)?;
        let (output, script) = runner
            .run_step(&mut target, StepName::ClusterVerification, &[])
            .map_err(|err| step_failed(StepName::ClusterVerification, node, err))?;

        Ok(VerifyReport {
            run_id,
            node_id: node.id.clone(),
            script,
            output: output.output,
            transcript: transcript.lines(),
        })
    }

    /// Ask an already initialized primary for a fresh join command, querying
    /// first and synthesizing from token and CA hash when that fails.
    pub fn join_command(
        &self,
        node: &Node,
        on_log: Option<LogCallback>,
    ) -> Result<JoinCommandReport> {
        if !node.is_primary() {
            return Err(Error::validation_invalid_argument(
                "node",
                format!("Node '{}' is not the primary; join commands come from the primary", node.id),
                Some(node.id.clone()),
                None,
            ));
        }
        node.validate()?;

        let run_id = Uuid::new_v4().to_string();
        let transcript = Transcript::new(on_log);
        let mut target = self.connect(node, &run_id, &transcript)?;

        let resolved = JoinResolver::new(&self.settings, &transcript)
            .resolve(None, &mut target.session)
            .ok_or_else(|| {
                Error::join_no_credential(format!("primary '{}' did not provide one", node.id))
            })?;

        Ok(JoinCommandReport {
            run_id,
            node_id: node.id.clone(),
            source: resolved.source,
            endpoint: resolved.credential.endpoint.clone(),
            join_command: resolved.credential.command(),
            transcript: transcript.lines(),
        })
    }

    fn connect(&self, node: &Node, run_id: &str, transcript: &Transcript) -> Result<NodeTarget> {
        transcript.node(
            node,
            format!("connecting to {}@{}:{}", node.user, node.host, node.port),
        );
        let session = self.connector.connect(node)?;
        Ok(NodeTarget::new(Session::new(
            session,
            Arc::clone(&self.sink),
            Some(run_id.to_string()),
        )))
    }

    fn record_status(&self, node: &Node, status: NodeStatus, os: Option<&str>) {
        let Some(inventory) = &self.inventory else {
            return;
        };
        if let Err(err) = inventory.record_status(&node.id, status, os) {
            log_status!(
                "deploy",
                "Could not record status '{}' for '{}': {}",
                status.as_str(),
                node.id,
                err.message
            );
        }
    }
}

fn check_cancel(cancel: &CancelSignal, transcript: &Transcript, phase: &str) -> Result<()> {
    if cancel.is_cancelled() {
        transcript.cluster(format!("cancelled before {}", phase));
        return Err(Error::deploy_cancelled(phase));
    }
    Ok(())
}

/// Checked before any remote command runs.
pub fn validate_topology(nodes: &[Node]) -> Result<()> {
    if nodes.is_empty() {
        return Err(Error::deploy_invalid_topology("at least one node is required"));
    }

    let primaries: Vec<&str> = nodes
        .iter()
        .filter(|n| n.is_primary())
        .map(|n| n.id.as_str())
        .collect();
    if primaries.len() > 1 {
        return Err(Error::deploy_invalid_topology(format!(
            "at most one primary is allowed, found {} ({})",
            primaries.len(),
            primaries.join(", ")
        )));
    }

    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(Error::deploy_invalid_topology(format!(
                "node id '{}' appears more than once",
                node.id
            )));
        }
        node.validate()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::{MemoryLogSink, NullLogSink};
    use crate::node::{MemoryInventory, Role};
    use crate::packages::MemoryPackageCache;
    use crate::script::MemoryScriptStore;
    use crate::ssh::fake::{FakeConnector, Reply};
    use std::sync::Mutex;

    const TOKEN: &str = "abcdef.0123456789abcdef";
    const HASH: &str = "sha256:2222222222222222222222222222222222222222222222222222222222222222";

    fn node(id: &str, role: Role) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            host: format!("10.0.0.{}", 10 + id.len()),
            port: 22,
            user: "root".to_string(),
            password: Some("pw".to_string()),
            identity_file: None,
            role,
            os: None,
            status: None,
        }
    }

    fn init_output() -> String {
        format!(
            "Your Kubernetes control-plane has initialized successfully!\n\
             kubeadm join 10.0.0.12:6443 --token {} \\\n\
             \t--discovery-token-ca-cert-hash {}\n",
            TOKEN, HASH
        )
    }

    fn engine(connector: &FakeConnector, scripts: MemoryScriptStore) -> Engine {
        Engine::new(
            Arc::new(connector.clone()),
            Arc::new(scripts),
            Arc::new(NullLogSink),
            Arc::new(MemoryPackageCache::new()),
            Settings::without_delays(),
        )
    }

    fn cluster() -> Vec<Node> {
        vec![
            node("m1", Role::Primary),
            node("w1", Role::Secondary),
            node("w2", Role::Secondary),
            node("w3", Role::Secondary),
        ]
    }

    #[test]
    fn two_primaries_fail_before_any_remote_command() {
        let connector = FakeConnector::new();
        let e = engine(&connector, MemoryScriptStore::new());
        let nodes = vec![node("m1", Role::Primary), node("m2", Role::Primary)];

        let report = e.deploy(DeployRequest::new(nodes, "1.28.2", "amd64"), None);

        assert!(!report.success);
        assert_eq!(report.error.unwrap().code.as_str(), "deploy.invalid_topology");
        assert!(connector.calls().is_empty());
        assert!(!report.transcript.is_empty());
    }

    #[test]
    fn empty_topology_is_rejected() {
        let connector = FakeConnector::new();
        let e = engine(&connector, MemoryScriptStore::new());
        let report = e.deploy(DeployRequest::new(Vec::new(), "1.28.2", "amd64"), None);
        assert_eq!(report.error.unwrap().code.as_str(), "deploy.invalid_topology");
        assert!(connector.calls().is_empty());
    }

    #[test]
    fn bad_credentials_and_version_fail_validation() {
        let connector = FakeConnector::new();
        let e = engine(&connector, MemoryScriptStore::new());

        let mut bad = node("m1", Role::Primary);
        bad.identity_file = Some("~/.ssh/id".to_string());
        let report = e.deploy(DeployRequest::new(vec![bad], "1.28.2", "amd64"), None);
        assert_eq!(
            report.error.unwrap().code.as_str(),
            "validation.invalid_argument"
        );

        let report = e.deploy(
            DeployRequest::new(vec![node("m1", Role::Primary)], "latest", "amd64"),
            None,
        );
        assert_eq!(
            report.error.unwrap().code.as_str(),
            "validation.invalid_argument"
        );
        assert!(connector.calls().is_empty());
    }

    #[test]
    fn full_deploy_captures_join_and_joins_every_secondary() {
        let connector = FakeConnector::new();
        connector.reply(Some("m1"), "kubeadm init", Reply::Ok(init_output()));
        let inventory = Arc::new(MemoryInventory::new(cluster()));
        let e = engine(&connector, MemoryScriptStore::new()).with_inventory(inventory.clone());

        let report = e.deploy(DeployRequest::new(cluster(), "v1.28.2", "amd64"), None);

        assert!(report.success, "{}", report.transcript_text());
        assert_eq!(report.join_source, Some(JoinSource::Captured));
        assert_eq!(report.join_outcomes.len(), 3);
        assert!(report.join_outcomes.values().all(|o| o.is_joined()));
        assert!(!connector.ran("m1", "--print-join-command"));
        assert!(connector.ran("w1", &format!("--token {}", TOKEN)));
        assert!(connector.ran("m1", "kubectl get nodes"));

        let nodes = inventory.list_nodes().unwrap();
        let status = |id: &str| nodes.iter().find(|n| n.id == id).unwrap().status;
        assert_eq!(status("m1"), Some(NodeStatus::Ready));
        assert_eq!(status("w2"), Some(NodeStatus::Joined));
        assert_eq!(
            nodes.iter().find(|n| n.id == "w2").unwrap().os.as_deref(),
            Some("ubuntu")
        );
    }

    #[test]
    fn ip_forward_is_reasserted_right_before_primary_init() {
        let connector = FakeConnector::new();
        connector.reply(Some("m1"), "kubeadm init", Reply::Ok(init_output()));
        let e = engine(&connector, MemoryScriptStore::new());

        e.deploy(
            DeployRequest::new(vec![node("m1", Role::Primary)], "1.28.2", "amd64"),
            None,
        );

        let commands = connector.commands_for("m1");
        let init = commands.iter().position(|c| c.contains("kubeadm init")).unwrap();
        assert!(commands[init - 1].contains("net.ipv4.ip_forward=1"));
    }

    #[test]
    fn skipped_steps_never_run_on_any_node() {
        let connector = FakeConnector::new();
        connector.reply(Some("m1"), "kubeadm init", Reply::Ok(init_output()));
        let e = engine(&connector, MemoryScriptStore::new());

        let request = DeployRequest::new(cluster(), "1.28.2", "amd64")
            .skip(&["repository_configuration", "container_runtime_install", "not_a_step"]);
        let report = e.deploy(request, None);

        assert!(report.success, "{}", report.transcript_text());
        assert!(!connector
            .calls()
            .iter()
            .any(|(_, c)| c.contains("pkgs.k8s.io") || c.contains("apt-get install -y containerd")));
        let skipped = report
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .count();
        assert_eq!(skipped, 8);
        assert!(report.transcript.iter().any(|l| l.contains("not_a_step")));
    }

    #[test]
    fn one_failing_join_leaves_other_secondaries_joined() {
        let connector = FakeConnector::new();
        connector.reply(Some("m1"), "kubeadm init", Reply::Ok(init_output()));
        connector.reply(Some("w2"), "kubeadm join", Reply::Fail(1, "preflight".to_string()));
        let e = engine(&connector, MemoryScriptStore::new());

        let report = e.deploy(DeployRequest::new(cluster(), "1.28.2", "amd64"), None);

        assert!(report.success);
        assert!(report.join_outcomes["w1"].is_joined());
        assert!(report.join_outcomes["w3"].is_joined());
        assert!(matches!(report.join_outcomes["w2"], JoinOutcome::Failed { .. }));
        assert_eq!(report.failed_joins(), 1);
        assert!(connector.ran("m1", "kubectl get nodes"));
    }

    #[test]
    fn install_failure_aborts_before_primary_init() {
        let connector = FakeConnector::new();
        connector.reply(Some("w1"), "kubelet=1.28.2", Reply::Fail(100, "E: not found".to_string()));
        let e = engine(&connector, MemoryScriptStore::new());

        let report = e.deploy(DeployRequest::new(cluster(), "1.28.2", "amd64"), None);

        let err = report.error.unwrap();
        assert_eq!(err.code.as_str(), "deploy.step_failed");
        assert_eq!(err.details["nodeId"], "w1");
        assert!(!connector.ran("m1", "kubeadm init"));
        assert!(connector.commands_for("w2").is_empty());
    }

    #[test]
    fn unreachable_secondary_is_excluded_not_fatal() {
        let connector = FakeConnector::new();
        connector.reply(Some("m1"), "kubeadm init", Reply::Ok(init_output()));
        connector.unreachable("w3");
        let e = engine(&connector, MemoryScriptStore::new());

        let report = e.deploy(DeployRequest::new(cluster(), "1.28.2", "amd64"), None);

        assert!(report.success);
        assert!(matches!(
            &report.join_outcomes["w3"],
            JoinOutcome::Failed { code, .. } if code == "ssh.connect_failed"
        ));
        assert!(report.join_outcomes["w1"].is_joined());
    }

    #[test]
    fn unreachable_primary_is_fatal() {
        let connector = FakeConnector::new();
        connector.unreachable("m1");
        let e = engine(&connector, MemoryScriptStore::new());
        let report = e.deploy(DeployRequest::new(cluster(), "1.28.2", "amd64"), None);
        assert_eq!(report.error.unwrap().code.as_str(), "ssh.connect_failed");
        assert!(connector.calls().is_empty());
    }

    #[test]
    fn cancel_between_nodes_stops_further_work() {
        let connector = FakeConnector::new();
        let cancel = CancelSignal::new();
        // trips while the first node is being prepared
        connector.cancel_on("swapoff", cancel.clone());
        let e = engine(&connector, MemoryScriptStore::new());

        let request = DeployRequest::new(cluster(), "1.28.2", "amd64").with_cancel(cancel);
        let report = e.deploy(request, None);

        let err = report.error.unwrap();
        assert!(err.is_cancelled());
        assert!(!connector.commands_for("m1").is_empty());
        assert!(connector.commands_for("w1").is_empty());
        assert!(report.transcript.iter().any(|l| l.contains("cancelled")));
        assert!(report.steps.iter().all(|s| s.node_id == "m1"));
    }

    #[test]
    fn join_command_is_queried_when_init_prints_none() {
        let connector = FakeConnector::new();
        connector.reply(
            Some("m1"),
            "--print-join-command",
            Reply::Ok(format!(
                "kubeadm join 10.0.0.12:6443 --token {} --discovery-token-ca-cert-hash {}\n",
                TOKEN, HASH
            )),
        );
        let e = engine(&connector, MemoryScriptStore::new());

        let report = e.deploy(DeployRequest::new(cluster(), "1.28.2", "amd64"), None);
        assert_eq!(report.join_source, Some(JoinSource::Queried));
        assert!(report.join_outcomes.values().all(|o| o.is_joined()));
    }

    #[test]
    fn secondaries_without_primary_use_external_credential() {
        let connector = FakeConnector::new();
        let mut settings = Settings::without_delays();
        settings.join.token = Some(TOKEN.to_string());
        settings.join.ca_hash = Some(HASH.to_string());
        settings.join.endpoint = Some("10.0.0.100:6443".to_string());
        let e = Engine::new(
            Arc::new(connector.clone()),
            Arc::new(MemoryScriptStore::new()),
            Arc::new(NullLogSink),
            Arc::new(MemoryPackageCache::new()),
            settings,
        );

        let nodes = vec![node("w1", Role::Secondary)];
        let report = e.deploy(DeployRequest::new(nodes, "1.28.2", "amd64"), None);

        assert!(report.success);
        assert_eq!(report.join_source, Some(JoinSource::External));
        assert!(connector.ran("w1", "kubeadm join 10.0.0.100:6443"));
    }

    #[test]
    fn secondaries_without_any_credential_report_no_credential() {
        let connector = FakeConnector::new();
        let e = engine(&connector, MemoryScriptStore::new());
        let nodes = vec![node("w1", Role::Secondary), node("w2", Role::Secondary)];

        let report = e.deploy(DeployRequest::new(nodes, "1.28.2", "amd64"), None);

        assert!(report
            .join_outcomes
            .values()
            .all(|o| matches!(o, JoinOutcome::NoCredential)));
        assert!(!connector.ran("w1", "kubeadm join"));
        assert!(report.transcript.iter().any(|l| l.contains("No join credential")));
    }

    #[test]
    fn malformed_external_credential_is_reported_by_field() {
        let connector = FakeConnector::new();
        let mut settings = Settings::without_delays();
        settings.join.token = Some(TOKEN.to_string());
        settings.join.ca_hash = Some("sha256:deadbeef".to_string());
        settings.join.endpoint = Some("10.0.0.100:6443".to_string());
        let e = Engine::new(
            Arc::new(connector.clone()),
            Arc::new(MemoryScriptStore::new()),
            Arc::new(NullLogSink),
            Arc::new(MemoryPackageCache::new()),
            settings,
        );

        let nodes = vec![node("w1", Role::Secondary)];
        let report = e.deploy(DeployRequest::new(nodes, "1.28.2", "amd64"), None);

        assert!(matches!(report.join_outcomes["w1"], JoinOutcome::NoCredential));
        assert!(!connector.ran("w1", "kubeadm join"));
        assert!(report
            .transcript
            .iter()
            .any(|l| l.contains("external credential rejected: join.ca_hash")));
    }

    #[test]
    fn primary_without_any_join_source_leaves_secondaries_uncredentialed() {
        let connector = FakeConnector::new();
        connector.reply(Some("m1"), "kubeadm init", Reply::Ok("initialized\n".to_string()));
        connector.reply(Some("m1"), "--print-join-command", Reply::Fail(1, "error".to_string()));
        connector.reply(Some("m1"), "kubeadm token create", Reply::Fail(1, "error".to_string()));
        connector.reply(Some("m1"), "openssl", Reply::Fail(1, "no ca".to_string()));
        let e = engine(&connector, MemoryScriptStore::new());

        let report = e.deploy(DeployRequest::new(cluster(), "1.28.2", "amd64"), None);

        assert_eq!(report.join_source, None);
        assert_eq!(report.join_outcomes.len(), 3);
        assert!(report
            .join_outcomes
            .values()
            .all(|o| matches!(o, JoinOutcome::NoCredential)));
        assert!(!connector.ran("w1", "kubeadm join"));
        assert!(report
            .transcript
            .iter()
            .any(|l| l.contains("the primary could not provide a join command")));
    }

    #[test]
    fn primary_init_timeout_is_a_step_failure() {
        let connector = FakeConnector::new();
        connector.reply(Some("m1"), "kubeadm init", Reply::Timeout);
        let e = engine(&connector, MemoryScriptStore::new());

        let report = e.deploy(DeployRequest::new(cluster(), "1.28.2", "amd64"), None);

        let err = report.error.unwrap();
        assert_eq!(err.code.as_str(), "deploy.step_failed");
        assert_eq!(err.details["step"], "primary_init");
        assert_eq!(err.details["causeCode"], "remote.command_timeout");
        assert!(!connector.ran("w1", "kubeadm join"));
    }

    #[test]
    fn join_token_never_reaches_logs_or_transcript() {
        let connector = FakeConnector::new();
        connector.reply(Some("m1"), "kubeadm init", Reply::Ok(init_output()));
        let sink = Arc::new(MemoryLogSink::new());
        let e = Engine::new(
            Arc::new(connector.clone()),
            Arc::new(MemoryScriptStore::new()),
            sink.clone(),
            Arc::new(MemoryPackageCache::new()),
            Settings::without_delays(),
        );

        let report = e.deploy(DeployRequest::new(cluster(), "1.28.2", "amd64"), None);

        assert!(report.success, "{}", report.transcript_text());
        assert!(connector.ran("w1", &format!("--token {}", TOKEN)));
        let records = sink.records();
        assert!(records.iter().any(|r| r.operation == "secondary_join"));
        assert!(records
            .iter()
            .all(|r| !r.command.contains(TOKEN) && !r.output.contains(TOKEN)));
        assert!(report.transcript.iter().all(|l| !l.contains(TOKEN)));
        assert!(report.transcript.iter().any(|l| l.contains("abcdef.****")));
    }

    #[test]
    fn distro_override_is_used_and_logged() {
        let connector = FakeConnector::new();
        connector.reply(Some("m1"), "kubeadm init", Reply::Ok(init_output()));
        let scripts = MemoryScriptStore::from_pairs(&[
            ("ubuntu_components_install", "echo ubuntu-components {{version}}"),
            ("components_install", "echo generic-components"),
        ]);
        let sink = Arc::new(MemoryLogSink::new());
        let e = Engine::new(
            Arc::new(connector.clone()),
            Arc::new(scripts),
            sink.clone(),
            Arc::new(MemoryPackageCache::new()),
            Settings::without_delays(),
        );

        let report = e.deploy(
            DeployRequest::new(vec![node("m1", Role::Primary)], "1.28.2", "amd64"),
            None,
        );

        assert!(connector.ran("m1", "echo ubuntu-components 1.28.2"));
        assert!(!connector.ran("m1", "generic-components"));
        let records = sink.records();
        assert!(records
            .iter()
            .all(|r| r.run_id.as_deref() == Some(report.run_id.as_str())));
        assert!(records.iter().any(|r| r.operation == "components_install"));
    }

    #[test]
    fn progress_callback_sees_every_transcript_line() {
        let connector = FakeConnector::new();
        connector.reply(Some("m1"), "kubeadm init", Reply::Ok(init_output()));
        let e = engine(&connector, MemoryScriptStore::new());
        let count = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&count);
        let on_log: LogCallback = Arc::new(move |_: &str, _: &str, _: &str| {
            *counter.lock().unwrap() += 1;
        });

        let report = e.deploy(
            DeployRequest::new(vec![node("m1", Role::Primary)], "1.28.2", "amd64"),
            Some(on_log),
        );
        assert_eq!(*count.lock().unwrap(), report.transcript.len());
    }

    #[test]
    fn verification_is_repeatable_and_read_only() {
        let connector = FakeConnector::new();
        connector.reply(Some("m1"), "kubectl get nodes", Reply::Ok("m1 Ready\n".to_string()));
        let e = engine(&connector, MemoryScriptStore::new());
        let primary = node("m1", Role::Primary);

        let first = e.verify(&primary, None).unwrap();
        let second = e.verify(&primary, None).unwrap();

        assert_eq!(first.output, second.output);
        assert_ne!(first.run_id, second.run_id);
        assert!(connector
            .commands_for("m1")
            .iter()
            .all(|c| c.contains("os-release") || c.contains("kubectl get")));
        assert!(e.verify(&node("w1", Role::Secondary), None).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn deploys_to_localhost_with_override_scripts() {
        use crate::logs::SqliteLogSink;
        use crate::ssh::SshConnector;
        use std::time::Duration;

        let init = format!(
            "echo 'kubeadm join 127.0.0.1:6443 --token {} \\'\necho '    --discovery-token-ca-cert-hash {}'",
            TOKEN, HASH
        );
        let scripts = MemoryScriptStore::from_pairs(&[
            ("system_preparation", "echo prepare {{node_name}}"),
            ("ip_forward_configuration", "echo forward"),
            ("container_runtime_install", "echo runtime"),
            (
                "container_runtime_configure",
                "echo daemon-reload; echo enable; echo restart",
            ),
            ("repository_configuration", "echo repo {{minor}}"),
            ("components_install", "echo components {{version}}"),
            ("primary_init", init.as_str()),
            ("join_priming", "true"),
            ("secondary_join", "echo joining {{join_command}}"),
            ("cluster_verification", "echo verified"),
        ]);
        let sink = Arc::new(SqliteLogSink::open_in_memory().unwrap());
        let e = Engine::new(
            Arc::new(SshConnector::new(
                Duration::from_secs(5),
                Duration::from_secs(30),
            )),
            Arc::new(scripts),
            sink.clone(),
            Arc::new(MemoryPackageCache::new()),
            Settings::without_delays(),
        );

        let mut primary = node("m1", Role::Primary);
        primary.host = "localhost".to_string();
        primary.os = Some("ubuntu".to_string());
        let mut worker = node("w1", Role::Secondary);
        worker.host = "127.0.0.1".to_string();
        worker.os = Some("ubuntu".to_string());

        let report = e.deploy(
            DeployRequest::new(vec![primary, worker], "1.29.1", "amd64"),
            None,
        );

        assert!(report.success, "{}", report.transcript_text());
        assert_eq!(report.join_source, Some(JoinSource::Captured));
        assert!(report.join_outcomes["w1"].is_joined());
        assert!(report.transcript.iter().any(|l| l.contains("repo v1.29")));
        assert!(report.transcript.iter().any(|l| l.contains("joining kubeadm join 127.0.0.1:6443")));
        assert!(!sink.recent(Some("w1"), 50).unwrap().is_empty());
    }

    #[test]
    fn join_command_queries_the_primary() {
        let connector = FakeConnector::new();
        connector.reply(
            Some("m1"),
            "--print-join-command",
            Reply::Ok(format!(
                "kubeadm join 10.0.0.12:6443 --token {} --discovery-token-ca-cert-hash {}\n",
                TOKEN, HASH
            )),
        );
        let e = engine(&connector, MemoryScriptStore::new());

        let report = e.join_command(&node("m1", Role::Primary), None).unwrap();
        assert_eq!(report.source, JoinSource::Queried);
        assert_eq!(report.endpoint, "10.0.0.12:6443");
        assert!(report.join_command.contains(TOKEN));
        assert!(report.transcript.iter().all(|l| !l.contains(TOKEN)));
    }

    #[test]
    fn join_command_without_credential_is_an_error() {
        let connector = FakeConnector::new();
        connector.reply(Some("m1"), "kubeadm", Reply::Fail(1, "not initialized".to_string()));
        let e = engine(&connector, MemoryScriptStore::new());

        let err = e.join_command(&node("m1", Role::Primary), None).unwrap_err();
        assert_eq!(err.code.as_str(), "join.no_credential");
        assert!(e.join_command(&node("w1", Role::Secondary), None).is_err());
    }
}
