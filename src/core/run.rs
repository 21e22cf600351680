//! Per-run shared state: cancellation and the human-readable transcript.

use crate::node::Node;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Progress callback: `(node_id, node_name, message)`. Cluster-wide events
/// use an empty node id and the name `cluster`.
pub type LogCallback = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

/// Cooperative cancellation flag, checked between nodes and between phases.
///
/// Clones share the same flag, so the caller keeps one and hands another to
/// the engine.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Ordered progress lines for one run. Safe to append from fan-out workers.
pub struct Transcript {
    lines: Mutex<Vec<String>>,
    on_log: Option<LogCallback>,
}

impl Transcript {
    pub fn new(on_log: Option<LogCallback>) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            on_log,
        }
    }

    /// Append a line attributed to `node`.
    pub fn node(&self, node: &Node, message: impl AsRef<str>) {
        let message = message.as_ref();
        self.push(format!("[{}] {}", node.label(), message));
        if let Some(on_log) = &self.on_log {
            on_log(&node.id, node.label(), message);
        }
    }

    /// Append a cluster-wide line.
    pub fn cluster(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        self.push(format!("[cluster] {}", message));
        if let Some(on_log) = &self.on_log {
            on_log("", "cluster", message);
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn text(&self) -> String {
        self.lines().join("\n")
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }

    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Role;

    #[test]
    fn cancel_is_shared_between_clones() {
        let signal = CancelSignal::new();
        let handle = signal.clone();
        assert!(!signal.is_cancelled());
        handle.cancel();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn transcript_prefixes_lines_and_forwards_to_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: LogCallback = Arc::new(move |id: &str, name: &str, msg: &str| {
            sink.lock()
                .unwrap()
                .push(format!("{}|{}|{}", id, name, msg));
        });
        let transcript = Transcript::new(Some(callback));

        let node = Node {
            id: "n1".to_string(),
            name: "master".to_string(),
            host: "10.0.0.1".to_string(),
            port: 22,
            user: "root".to_string(),
            password: Some("pw".to_string()),
            identity_file: None,
            role: Role::Primary,
            os: None,
            status: None,
        };
        transcript.node(&node, "hello");
        transcript.cluster("phase done");

        assert_eq!(
            transcript.lines(),
            vec!["[master] hello", "[cluster] phase done"]
        );
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["n1|master|hello", "|cluster|phase done"]
        );
    }
}
