//! nftables backend
//!
//! The daemon owns one `ip` table holding a NAT prerouting chain. A
//! transaction is an nft script that flushes the chain and re-adds every
//! redirect; `nft -f -` applies a script atomically, so a failed commit
//! leaves the previous rules untouched.

use super::{BackendError, FirewallBackend, RedirectRule};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

/// Chain holding the redirect rules
const CHAIN: &str = "prerouting";

/// Firewall backend driving the `nft` command
#[derive(Debug)]
pub struct NftBackend {
    table: String,
    nft: PathBuf,
    script: Option<String>,
}

impl NftBackend {
    /// Manage rules in the given table using `nft` from `PATH`
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            nft: PathBuf::from("nft"),
            script: None,
        }
    }

    /// Use a specific `nft` binary
    pub fn with_binary(mut self, nft: impl Into<PathBuf>) -> Self {
        self.nft = nft.into();
        self
    }

    /// Script header creating the table and emptying the chain
    fn transaction_header(&self) -> String {
        format!(
            "add table ip {table}\n\
             add chain ip {table} {CHAIN} {{ type nat hook prerouting priority -100; policy accept; }}\n\
             flush chain ip {table} {CHAIN}\n",
            table = self.table
        )
    }

    /// Script removing the daemon's table
    ///
    /// Adding first makes the delete succeed when the table does not exist.
    fn reset_script(&self) -> String {
        format!(
            "add table ip {table}\ndelete table ip {table}\n",
            table = self.table
        )
    }

    /// One `add rule` line for a redirect
    fn render_rule(&self, rule: &RedirectRule) -> String {
        format!(
            "add rule ip {table} {CHAIN} ip daddr {ext_ip} {proto} dport {ext_port} dnat to {internal}\n",
            table = self.table,
            ext_ip = rule.external.ip(),
            proto = rule.protocol.as_str(),
            ext_port = rule.external.port(),
            internal = rule.internal,
        )
    }

    /// Feed a script to `nft -f -`
    fn apply(&self, script: &str) -> Result<(), BackendError> {
        debug!("Applying nft script:\n{}", script);

        let mut child = Command::new(&self.nft)
            .args(["-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        // The child is reaped even when feeding it failed
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(script.as_bytes()),
            None => Ok(()),
        };
        let output = child.wait_with_output()?;
        written?;

        if output.status.success() {
            return Ok(());
        }

        Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
    }
}

/// Map nft's error output onto a backend error
fn classify_failure(stderr: &str) -> BackendError {
    if stderr.contains("Device or resource busy") {
        BackendError::Busy
    } else {
        BackendError::Failed(stderr.trim().to_string())
    }
}

impl FirewallBackend for NftBackend {
    fn reset(&mut self) -> Result<(), BackendError> {
        self.script = None;
        let script = self.reset_script();
        self.apply(&script)
    }

    fn begin_transaction(&mut self) -> Result<(), BackendError> {
        self.script = Some(self.transaction_header());
        Ok(())
    }

    fn add_redirect(&mut self, rule: &RedirectRule) -> Result<(), BackendError> {
        let line = self.render_rule(rule);
        let script = self
            .script
            .as_mut()
            .ok_or_else(|| BackendError::Failed("no open transaction".to_string()))?;
        script.push_str(&line);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        let script = self
            .script
            .as_deref()
            .ok_or_else(|| BackendError::Failed("no open transaction".to_string()))?;
        self.apply(script)?;
        self.script = None;
        Ok(())
    }

    fn rollback(&mut self) {
        self.script = None;
    }
}
