use super::{CommandOutput, Connector, RemoteSession};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::node::{Credential, Node};
use crate::utils::shell;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Opens [`SshSession`]s using the system `ssh` client.
pub struct SshConnector {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.connect_timeout(), settings.command_timeout())
    }
}

impl Connector for SshConnector {
    fn connect(&self, node: &Node) -> Result<Box<dyn RemoteSession>> {
        let session = SshSession::open(node, self.connect_timeout, self.command_timeout)?;
        Ok(Box::new(session))
    }
}

enum Auth {
    Password(String),
    IdentityFile(String),
}

pub struct SshSession {
    node: Node,
    auth: Auth,
    connect_timeout: Duration,
    command_timeout: Duration,
    /// When true, commands run locally instead of over SSH.
    is_local: bool,
}

impl SshSession {
    /// Resolve the node's credential and prove the connection works.
    pub fn open(node: &Node, connect_timeout: Duration, command_timeout: Duration) -> Result<Self> {
        let auth = match node.credential()? {
            Credential::Password(password) => Auth::Password(password),
            Credential::IdentityFile(path) => {
                let expanded = shellexpand::tilde(&path).to_string();
                if !std::path::Path::new(&expanded).exists() {
                    return Err(Error::ssh_identity_file_not_found(node.id.clone(), expanded));
                }
                Auth::IdentityFile(expanded)
            }
        };

        let is_local = is_local_host(&node.host);
        if is_local {
            log_status!("ssh", "Node '{}' is localhost, using local execution", node.id);
        }

        let session = Self {
            node: node.clone(),
            auth,
            connect_timeout,
            command_timeout,
            is_local,
        };
        session.probe()?;
        Ok(session)
    }

    fn probe(&self) -> Result<()> {
        if self.is_local {
            return Ok(());
        }
        let mut child = self.spawn("true", None)?;
        let mut stderr = String::new();
        if let Some(pipe) = child.stderr.take() {
            for line in BufReader::new(pipe).lines().map_while(|l| l.ok()) {
                stderr.push_str(&line);
                stderr.push('\n');
            }
        }
        let status = child
            .wait()
            .map_err(|e| Error::ssh_connect_failed(self.node.target(), e.to_string()))?;
        if status.success() {
            return Ok(());
        }
        // sshpass exits 5 on a rejected password
        let sshpass_rejected = matches!(self.auth, Auth::Password(_)) && status.code() == Some(5);
        if sshpass_rejected || is_auth_failure(&stderr) {
            return Err(Error::ssh_auth_failed(self.node.target(), stderr.trim()));
        }
        let reason = if stderr.trim().is_empty() {
            format!("ssh exited with {}", status.code().unwrap_or(-1))
        } else {
            stderr.trim().to_string()
        };
        Err(Error::ssh_connect_failed(self.node.target(), reason))
    }

    fn build_ssh_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = Vec::new();

        if let Auth::IdentityFile(identity_file) = &self.auth {
            args.push("-i".to_string());
            args.push(identity_file.clone());
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }

        if self.node.port != 22 {
            args.push("-p".to_string());
            args.push(self.node.port.to_string());
        }

        args.extend([
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        args.push(format!("{}@{}", self.node.user, self.node.host));
        args.push(remote_command.to_string());
        args
    }

    fn spawn(&self, command: &str, stdin: Option<File>) -> Result<Child> {
        // stderr is folded into stdout on the remote side so lines keep their order
        let wrapped = format!("bash -c {} 2>&1", shell::escape_command_for_shell(command));

        let mut cmd = if self.is_local {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", wrapped.as_str()]);
            cmd
        } else {
            match &self.auth {
                Auth::Password(password) => {
                    let mut cmd = Command::new("sshpass");
                    cmd.args(["-e", "ssh"]);
                    cmd.env("SSHPASS", password);
                    cmd.args(self.build_ssh_args(&wrapped));
                    cmd
                }
                Auth::IdentityFile(_) => {
                    let mut cmd = Command::new("ssh");
                    cmd.args(self.build_ssh_args(&wrapped));
                    cmd
                }
            }
        };

        match stdin {
            Some(file) => cmd.stdin(file),
            None => cmd.stdin(Stdio::null()),
        };
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        cmd.spawn().map_err(|e| {
            let program = match (&self.auth, self.is_local) {
                (_, true) => "sh",
                (Auth::Password(_), false) => "sshpass",
                (Auth::IdentityFile(_), false) => "ssh",
            };
            Error::ssh_connect_failed(
                self.node.target(),
                format!("failed to launch {}: {}", program, e),
            )
        })
    }

    fn execute(
        &self,
        command: &str,
        stdin: Option<File>,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput> {
        let mut child = self.spawn(command, stdin)?;
        let deadline = Instant::now() + self.command_timeout;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut output = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(line) => {
                    on_line(&line);
                    output.push_str(&line);
                    output.push('\n');
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => return Err(self.timed_out(&mut child, command)),
            }
        }

        let exit_code = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status.code().unwrap_or(-1),
                Ok(None) if Instant::now() >= deadline => {
                    return Err(self.timed_out(&mut child, command));
                }
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(e) => {
                    return Err(Error::internal_io(
                        e.to_string(),
                        Some("wait for ssh process".to_string()),
                    ))
                }
            }
        };

        // ssh reports its own failures with 255; the remote command never ran
        if exit_code == 255 && !self.is_local {
            return Err(Error::ssh_connect_failed(
                self.node.target(),
                last_line(&output).unwrap_or("ssh exited with 255").to_string(),
            ));
        }

        Ok(CommandOutput {
            output,
            success: exit_code == 0,
            exit_code,
        })
    }

    fn timed_out(&self, child: &mut Child, command: &str) -> Error {
        let _ = child.kill();
        let _ = child.wait();
        log_status!(
            "ssh",
            "Command on '{}' exceeded {}s and was stopped",
            self.node.label(),
            self.command_timeout.as_secs()
        );
        Error::remote_command_timeout(command, self.command_timeout.as_secs(), self.node.target())
    }
}

impl RemoteSession for SshSession {
    fn node(&self) -> &Node {
        &self.node
    }

    fn run_buffered(&mut self, command: &str) -> Result<CommandOutput> {
        self.execute(command, None, &mut |_| {})
    }

    fn run_streaming(
        &mut self,
        command: &str,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput> {
        self.execute(command, None, on_line)
    }

    fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<CommandOutput> {
        let file = File::open(local_path).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("open {}", local_path.display())))
        })?;
        let command = format!("cat > {}", shell::quote_path(remote_path));
        self.execute(&command, Some(file), &mut |_| {})
    }
}

/// Check if a host address refers to the local machine.
pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

fn is_auth_failure(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    [
        "permission denied",
        "authentication failed",
        "too many authentication failures",
        "no supported authentication methods",
    ]
    .iter()
    .any(|p| stderr.contains(p))
}

fn last_line(output: &str) -> Option<&str> {
    output.lines().rev().find(|l| !l.trim().is_empty())
}
