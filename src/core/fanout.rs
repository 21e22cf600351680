//! Concurrent secondary join.
//!
//! Every secondary gets its own worker thread and its own session. A failing
//! worker only affects its own outcome.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::config::Settings;
use crate::error::Error;
use crate::logs::LogSink;
use crate::node::Node;
use crate::packages::PackageCache;
use crate::pipeline::{step_failed, NodeTarget, RunParams, StepName, StepRunner};
use crate::run::{CancelSignal, Transcript};
use crate::script::{builtin, ScriptResolver};
use crate::ssh::{Connector, Session};
use crate::utils::template::TemplateVars;

/// How often the collector wakes up to look at the cancel signal.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Override key for the kernel priming run before each join.
pub const PRIMING_SCRIPT: &str = "join_priming";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JoinOutcome {
    Joined,
    Failed {
        code: String,
        message: String,
    },
    Skipped,
    NoCredential,
    Cancelled,
}

impl JoinOutcome {
    pub fn failed(err: &Error) -> Self {
        JoinOutcome::Failed {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
        }
    }

    pub fn is_joined(&self) -> bool {
        matches!(self, JoinOutcome::Joined)
    }
}

/// Everything a join worker needs, shared across threads.
#[derive(Clone)]
pub struct FanOut {
    pub connector: Arc<dyn Connector>,
    pub resolver: Arc<ScriptResolver>,
    pub sink: Arc<dyn LogSink>,
    pub packages: Arc<dyn PackageCache>,
    pub params: Arc<RunParams>,
    pub settings: Arc<Settings>,
    pub transcript: Arc<Transcript>,
}

impl FanOut {
    /// Join every secondary concurrently with `join_command`.
    ///
    /// Returns one outcome per node id. When `cancel` trips while workers
    /// are running, collection stops and only the outcomes gathered so far
    /// are returned.
    pub fn join_all(
        &self,
        secondaries: &[Node],
        join_command: &str,
        cancel: &CancelSignal,
    ) -> BTreeMap<String, JoinOutcome> {
        let mut outcomes = BTreeMap::new();
        if secondaries.is_empty() {
            return outcomes;
        }

        let (tx, rx) = mpsc::sync_channel::<(String, JoinOutcome)>(secondaries.len());
        let mut expected = 0usize;

        for node in secondaries {
            let worker = self.clone();
            let node = node.clone();
            let join_command = join_command.to_string();
            let cancel = cancel.clone();
            let tx = tx.clone();
            let node_id = node.id.clone();

            let spawned = thread::Builder::new()
                .name(format!("join-{}", node.id))
                .spawn(move || {
                    let outcome = worker.join_one(&node, &join_command, &cancel);
                    let _ = tx.send((node.id.clone(), outcome));
                });

            match spawned {
                Ok(_) => expected += 1,
                Err(e) => {
                    let err = Error::internal_unexpected(format!(
                        "failed to start join worker for '{}': {}",
                        node_id, e
                    ));
                    outcomes.insert(node_id, JoinOutcome::failed(&err));
                }
            }
        }
        drop(tx);

        let mut received = 0usize;
        while received < expected {
            if cancel.is_cancelled() {
                for (node_id, outcome) in rx.try_iter() {
                    received += 1;
                    outcomes.insert(node_id, outcome);
                }
                if received < expected {
                    self.transcript.cluster(format!(
                        "join: cancelled with {} of {} worker(s) still running",
                        expected - received,
                        expected
                    ));
                }
                break;
            }
            match rx.recv_timeout(CANCEL_POLL) {
                Ok((node_id, outcome)) => {
                    received += 1;
                    outcomes.insert(node_id, outcome);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        outcomes
    }

    fn join_one(&self, node: &Node, join_command: &str, cancel: &CancelSignal) -> JoinOutcome {
        if cancel.is_cancelled() {
            return JoinOutcome::Cancelled;
        }

        let session = match self.connector.connect(node) {
            Ok(session) => session,
            Err(err) => {
                self.transcript
                    .node(node, format!("secondary_join: cannot connect: {}", err.message));
                return JoinOutcome::failed(&err);
            }
        };
        let mut target = NodeTarget::new(Session::new(
            session,
            Arc::clone(&self.sink),
            Some(self.params.run_id.clone()),
        ));

        self.prime(&mut target);

        let runner = StepRunner::new(
            &self.resolver,
            self.packages.as_ref(),
            &self.params,
            &self.settings,
            &self.transcript,
        );
        match runner.run_step(
            &mut target,
            StepName::SecondaryJoin,
            &[(TemplateVars::JOIN_COMMAND, join_command)],
        ) {
            Ok(_) => {
                self.transcript.node(node, "secondary_join: joined");
                JoinOutcome::Joined
            }
            Err(err) => {
                let err = step_failed(StepName::SecondaryJoin, node, err);
                self.transcript.node(node, format!("secondary_join: {}", err.message));
                JoinOutcome::failed(&err)
            }
        }
    }

    /// Best-effort kernel preparation; failures are only noted.
    fn prime(&self, target: &mut NodeTarget) {
        let node = target.node().clone();
        let script = self.resolver.auxiliary(PRIMING_SCRIPT, builtin::JOIN_PRIMING);
        match target.session.run_buffered(PRIMING_SCRIPT, &script) {
            Ok(out) if out.success => {}
            Ok(out) => self.transcript.node(
                &node,
                format!("join priming exited with {} (continuing)", out.exit_code),
            ),
            Err(err) => self.transcript.node(
                &node,
                format!("join priming failed: {} (continuing)", err.message),
            ),
        }
    }
}
