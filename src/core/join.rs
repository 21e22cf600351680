//! Join credential discovery.
//!
//! A secondary needs a bootstrap token, the primary's CA certificate hash and
//! the API endpoint. They are obtained, in order of preference, from:
//! 1. the join command printed by primary init, captured while streaming
//! 2. asking the primary to print a fresh join command (retried)
//! 3. creating a token and computing the CA hash on the primary
//! 4. externally supplied settings, only when no primary is deployed

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::config::{JoinSettings, Settings};
use crate::error::{Error, Result};
use crate::run::Transcript;
use crate::script::builtin;
use crate::ssh::Session;

const API_SERVER_PORT: u16 = 6443;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSource {
    Captured,
    Queried,
    Synthesized,
    External,
}

impl JoinSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinSource::Captured => "captured from primary init",
            JoinSource::Queried => "queried from primary",
            JoinSource::Synthesized => "synthesized on primary",
            JoinSource::External => "supplied externally",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCredential {
    pub endpoint: String,
    pub token: String,
    /// Always carries the `sha256:` prefix.
    pub ca_cert_hash: String,
}

static ENDPOINT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"kubeadm\s+join\s+(\S+)").unwrap());

static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--token[=\s]+([a-z0-9]{6}\.[a-z0-9]{16})").unwrap());

static HASH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"--discovery-token-ca-cert-hash[=\s]+(sha256:[0-9a-fA-F]{64})").unwrap()
});

static BARE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]{6}\.[a-z0-9]{16}$").unwrap());

static BARE_HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(sha256:)?[0-9a-fA-F]{64}$").unwrap());

static ANY_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([a-z0-9]{6})\.[a-z0-9]{16}\b").unwrap());

/// Replace the secret half of every bootstrap token in `text` with `****`.
/// The token id stays visible.
pub fn mask_tokens(text: &str) -> Cow<'_, str> {
    ANY_TOKEN.replace_all(text, "${1}.****")
}

impl JoinCredential {
    pub fn new(endpoint: &str, token: &str, ca_cert_hash: &str) -> Option<Self> {
        let endpoint = endpoint.trim();
        let token = token.trim();
        let hash = ca_cert_hash.trim();
        if endpoint.is_empty() || !BARE_TOKEN.is_match(token) || !BARE_HASH.is_match(hash) {
            return None;
        }
        let hash = if hash.starts_with("sha256:") {
            hash.to_string()
        } else {
            format!("sha256:{}", hash)
        };
        Some(Self {
            endpoint: endpoint.to_string(),
            token: token.to_string(),
            ca_cert_hash: hash,
        })
    }

    /// Extract a credential from `kubeadm join ...` text. All three parts
    /// must be present.
    pub fn parse(command: &str) -> Option<Self> {
        let endpoint = ENDPOINT_PATTERN.captures(command)?.get(1)?.as_str();
        let token = TOKEN_PATTERN.captures(command)?.get(1)?.as_str();
        let hash = HASH_PATTERN.captures(command)?.get(1)?.as_str();
        Self::new(endpoint, token, hash)
    }

    /// Credential from `[join]` settings. `Ok(None)` when none of the three
    /// values is set; an error naming the field when only some are set or one
    /// is malformed.
    pub fn from_settings(join: &JoinSettings) -> Result<Option<Self>> {
        let endpoint = non_blank(&join.endpoint);
        let token = non_blank(&join.token);
        let hash = non_blank(&join.ca_hash);
        if endpoint.is_none() && token.is_none() && hash.is_none() {
            return Ok(None);
        }

        let endpoint = endpoint.ok_or_else(|| missing_field("join.endpoint"))?;
        let token = token.ok_or_else(|| missing_field("join.token"))?;
        let hash = hash.ok_or_else(|| missing_field("join.ca_hash"))?;

        if !BARE_TOKEN.is_match(token) {
            return Err(Error::config_invalid_value(
                "join.token",
                None,
                "expected a bootstrap token like abcdef.0123456789abcdef",
            ));
        }
        if !BARE_HASH.is_match(hash) {
            return Err(Error::config_invalid_value(
                "join.ca_hash",
                Some(hash.to_string()),
                "expected 64 hex digits, optionally prefixed with sha256:",
            ));
        }

        Ok(Self::new(endpoint, token, hash))
    }

    /// The worker join command.
    pub fn command(&self) -> String {
        format!(
            "kubeadm join {} --token {} --discovery-token-ca-cert-hash {}",
            self.endpoint, self.token, self.ca_cert_hash
        )
    }

    /// Token masked for display.
    pub fn redacted(&self) -> String {
        let visible = self.token.split('.').next().unwrap_or("");
        format!(
            "kubeadm join {} --token {}.**** --discovery-token-ca-cert-hash {}",
            self.endpoint, visible, self.ca_cert_hash
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedJoin {
    pub credential: JoinCredential,
    pub source: JoinSource,
}

/// Watches primary-init output for the worker join command.
///
/// kubeadm wraps the command over two lines with a trailing `\`; the
/// continuation is folded in. Control-plane join commands are ignored.
#[derive(Debug, Default)]
pub struct JoinCapture {
    pending: Option<String>,
    captured: Option<String>,
}

impl JoinCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, line: &str) {
        if self.captured.is_some() {
            return;
        }
        let trimmed = line.trim();

        let text = match self.pending.take() {
            Some(mut pending) => {
                pending.push(' ');
                pending.push_str(trimmed);
                pending
            }
            None if trimmed.starts_with("kubeadm join") => trimmed.to_string(),
            None => return,
        };

        if let Some(head) = text.strip_suffix('\\') {
            self.pending = Some(head.trim_end().to_string());
            return;
        }
        if !text.contains("--control-plane") {
            self.captured = Some(text);
        }
    }

    pub fn captured(&self) -> Option<&str> {
        self.captured.as_deref()
    }
}

/// Works down the credential ladder against a connected primary.
pub struct JoinResolver<'a> {
    settings: &'a Settings,
    transcript: &'a Transcript,
}

impl<'a> JoinResolver<'a> {
    pub fn new(settings: &'a Settings, transcript: &'a Transcript) -> Self {
        Self {
            settings,
            transcript,
        }
    }

    pub fn resolve(&self, captured: Option<&str>, primary: &mut Session) -> Option<ResolvedJoin> {
        if let Some(credential) = captured.and_then(JoinCredential::parse) {
            return Some(self.found(credential, JoinSource::Captured));
        }

        if let Some(credential) = self.query(primary) {
            return Some(self.found(credential, JoinSource::Queried));
        }

        if let Some(credential) = self.synthesize(primary) {
            return Some(self.found(credential, JoinSource::Synthesized));
        }

        self.transcript
            .cluster("join credential: primary could not provide one");
        None
    }

    /// Credential for secondaries joining a cluster that was not deployed in
    /// this run. A partial or malformed `[join]` section is an error.
    pub fn external(&self) -> Result<Option<ResolvedJoin>> {
        let credential = JoinCredential::from_settings(&self.settings.join)?;
        Ok(credential.map(|c| self.found(c, JoinSource::External)))
    }

    fn found(&self, credential: JoinCredential, source: JoinSource) -> ResolvedJoin {
        self.transcript.cluster(format!(
            "join credential {}: {}",
            source.as_str(),
            credential.redacted()
        ));
        ResolvedJoin { credential, source }
    }

    fn query(&self, primary: &mut Session) -> Option<JoinCredential> {
        let attempts = self.settings.join_query_attempts.max(1);
        for attempt in 1..=attempts {
            match primary.run_buffered("join_query", builtin::PRINT_JOIN_COMMAND) {
                Ok(out) if out.success => {
                    let credential = out
                        .output
                        .lines()
                        .filter(|l| l.trim().starts_with("kubeadm join"))
                        .find_map(JoinCredential::parse);
                    if credential.is_some() {
                        return credential;
                    }
                }
                Ok(out) => log_status!(
                    "join",
                    "Join command query attempt {}/{} exited with {}",
                    attempt,
                    attempts,
                    out.exit_code
                ),
                Err(err) => log_status!(
                    "join",
                    "Join command query attempt {}/{} failed: {}",
                    attempt,
                    attempts,
                    err.message
                ),
            }
            if attempt < attempts && !self.settings.join_query_delay().is_zero() {
                std::thread::sleep(self.settings.join_query_delay());
            }
        }
        None
    }

    fn synthesize(&self, primary: &mut Session) -> Option<JoinCredential> {
        let token_out = primary
            .run_buffered("join_token_create", builtin::CREATE_TOKEN)
            .ok()
            .filter(|o| o.success)?;
        let token = last_matching(&token_out.output, &BARE_TOKEN)?;

        let hash_out = primary
            .run_buffered("join_ca_hash", builtin::CA_CERT_HASH)
            .ok()
            .filter(|o| o.success)?;
        let hash = last_matching(&hash_out.output, &BARE_HASH)?;

        let endpoint = format!("{}:{}", primary.node().host, API_SERVER_PORT);
        JoinCredential::new(&endpoint, &token, &hash)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn missing_field(key: &str) -> Error {
    Error::config_invalid_value(
        key,
        None,
        "join.token, join.ca_hash and join.endpoint must be set together",
    )
}

fn last_matching(output: &str, pattern: &Regex) -> Option<String> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| pattern.is_match(l))
        .map(str::to_string)
}
