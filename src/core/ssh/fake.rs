//! Scripted remote sessions for tests.

use super::{CommandOutput, Connector, RemoteSession};
use crate::error::{Error, Result};
use crate::node::Node;
use crate::run::CancelSignal;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Reply {
    Ok(String),
    Fail(i32, String),
    Timeout,
    /// Succeed with the output after sleeping.
    Delay(Duration, String),
}

struct Rule {
    node_id: Option<String>,
    needle: String,
    reply: Reply,
}

#[derive(Default)]
struct State {
    rules: Vec<Rule>,
    unreachable: HashSet<String>,
    cancel_triggers: Vec<(String, CancelSignal)>,
    calls: Vec<(String, String)>,
}

/// Answers commands by substring match. The most recently added matching
/// rule wins; unmatched commands succeed with no output.
#[derive(Clone)]
pub struct FakeConnector {
    state: Arc<Mutex<State>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        let connector = Self {
            state: Arc::new(Mutex::new(State::default())),
        };
        connector.reply(None, "/etc/os-release", Reply::Ok("ubuntu\n".to_string()));
        connector
    }

    pub fn reply(&self, node_id: Option<&str>, needle: &str, reply: Reply) {
        self.state.lock().unwrap().rules.push(Rule {
            node_id: node_id.map(str::to_string),
            needle: needle.to_string(),
            reply,
        });
    }

    pub fn unreachable(&self, node_id: &str) {
        self.state
            .lock()
            .unwrap()
            .unreachable
            .insert(node_id.to_string());
    }

    /// Trip `signal` as soon as a command containing `needle` runs.
    pub fn cancel_on(&self, needle: &str, signal: CancelSignal) {
        self.state
            .lock()
            .unwrap()
            .cancel_triggers
            .push((needle.to_string(), signal));
    }

    /// Every `(node_id, command)` seen, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn commands_for(&self, node_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| id == node_id)
            .map(|(_, cmd)| cmd)
            .collect()
    }

    pub fn ran(&self, node_id: &str, needle: &str) -> bool {
        self.commands_for(node_id).iter().any(|c| c.contains(needle))
    }
}

impl Connector for FakeConnector {
    fn connect(&self, node: &Node) -> Result<Box<dyn RemoteSession>> {
        if self.state.lock().unwrap().unreachable.contains(&node.id) {
            return Err(Error::ssh_connect_failed(
                node.target(),
                "connection refused",
            ));
        }
        Ok(Box::new(FakeSession {
            node: node.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    node: Node,
    state: Arc<Mutex<State>>,
}

impl FakeSession {
    fn answer(&self, command: &str) -> Reply {
        let mut state = self.state.lock().unwrap();
        state.calls.push((self.node.id.clone(), command.to_string()));
        for (needle, signal) in &state.cancel_triggers {
            if command.contains(needle.as_str()) {
                signal.cancel();
            }
        }
        state
            .rules
            .iter()
            .rev()
            .find(|r| {
                command.contains(r.needle.as_str())
                    && r.node_id.as_deref().map_or(true, |id| id == self.node.id)
            })
            .map(|r| r.reply.clone())
            .unwrap_or(Reply::Ok(String::new()))
    }
}

impl RemoteSession for FakeSession {
    fn node(&self) -> &Node {
        &self.node
    }

    fn run_buffered(&mut self, command: &str) -> Result<CommandOutput> {
        self.run_streaming(command, &mut |_| {})
    }

    fn run_streaming(
        &mut self,
        command: &str,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput> {
        let (output, exit_code) = match self.answer(command) {
            Reply::Ok(output) => (output, 0),
            Reply::Fail(code, output) => (output, code),
            Reply::Delay(pause, output) => {
                thread::sleep(pause);
                (output, 0)
            }
            Reply::Timeout => {
                return Err(Error::remote_command_timeout(command, 1, self.node.target()))
            }
        };
        for line in output.lines() {
            on_line(line);
        }
        Ok(CommandOutput {
            output,
            success: exit_code == 0,
            exit_code,
        })
    }

    fn upload(&mut self, _local_path: &Path, remote_path: &str) -> Result<CommandOutput> {
        self.run_buffered(&format!("upload {}", remote_path))
    }
}
