//! nftables interception rules
//!
//! Builds, installs, removes and detects the two rules that send traffic to
//! a netfilter queue:
//!
//! - [`RuleKind::DnsResponses`]: `udp sport 53` in the `input` chain, so DNS
//!   answers can be inspected before connections are attempted
//! - [`RuleKind::Intercept`]: new and related connections in the `output`
//!   chain
//!
//! Both rules live in a dedicated `inet` table and carry a fixed comment,
//! which is how [`InterceptionRules::are_loaded`] recognizes them. The rule
//! watchdog consumes `are_loaded` and `install` as its check and reload
//! callbacks.
//!
//! Set `FWWATCH_NFT_COMMAND` to use a different `nft` binary (tests point it
//! at `tests/mock_nft.sh`).

use crate::core::error::{Error, Result};
use serde_json::{Value, json};
use std::fmt::Write as _;
use strum::IntoEnumIterator;
use tracing::{debug, error, info};

/// Environment variable overriding the `nft` binary
pub const NFT_COMMAND_ENV: &str = "FWWATCH_NFT_COMMAND";

/// Table used when none is configured
pub const DEFAULT_TABLE: &str = "fwwatch";

/// UDP source port of DNS responses
const DNS_PORT: u16 = 53;

/// The interception rules, named by the comment they carry in the ruleset
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumIter)]
pub enum RuleKind {
    #[strum(serialize = "fwwatch-dns-responses")]
    DnsResponses,
    #[strum(serialize = "fwwatch-intercept")]
    Intercept,
}

impl RuleKind {
    pub fn chain(self) -> &'static str {
        match self {
            RuleKind::DnsResponses => "input",
            RuleKind::Intercept => "output",
        }
    }
}

/// Base chains of the interception table: (name/hook, priority)
const CHAINS: [(&str, i32); 2] = [
    ("input", 0),
    // mangle priority, so queued verdicts precede regular filtering
    ("output", -150),
];

/// Interception rules bound to one table and queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptionRules {
    table: String,
    queue: u16,
}

impl InterceptionRules {
    pub fn new(table: impl Into<String>, queue: u16) -> Self {
        Self {
            table: table.into(),
            queue,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn queue(&self) -> u16 {
        self.queue
    }

    fn table_ref(&self) -> Value {
        json!({ "family": "inet", "name": self.table })
    }

    fn rule_expr(&self, kind: RuleKind) -> Vec<Value> {
        let queue = json!({ "queue": { "num": self.queue, "flags": ["bypass"] } });
        match kind {
            RuleKind::DnsResponses => vec![
                json!({ "match": {
                    "left": { "payload": { "protocol": "udp", "field": "sport" } },
                    "op": "==",
                    "right": DNS_PORT
                } }),
                queue,
            ],
            RuleKind::Intercept => vec![
                json!({ "match": {
                    "left": { "ct": { "key": "state" } },
                    "op": "==",
                    "right": { "set": ["new", "related"] }
                } }),
                queue,
            ],
        }
    }

    /// Generates the nftables JSON batch that (re)creates the table.
    ///
    /// The table is flushed first, so applying the batch twice never
    /// duplicates rules.
    pub fn to_nftables_json(&self) -> Value {
        let mut nft_rules = Vec::with_capacity(2 + CHAINS.len() + 2);

        nft_rules.push(json!({ "add": { "table": self.table_ref() } }));
        nft_rules.push(json!({ "flush": { "table": self.table_ref() } }));

        for (name, priority) in CHAINS {
            nft_rules.push(json!({
                "add": {
                    "chain": {
                        "family": "inet",
                        "table": self.table,
                        "name": name,
                        "type": "filter",
                        "hook": name,
                        "prio": priority,
                        "policy": "accept"
                    }
                }
            }));
        }

        for kind in RuleKind::iter() {
            nft_rules.push(json!({
                "add": {
                    "rule": {
                        "family": "inet",
                        "table": self.table,
                        "chain": kind.chain(),
                        "expr": self.rule_expr(kind),
                        "comment": kind.to_string()
                    }
                }
            }));
        }

        json!({ "nftables": nft_rules })
    }

    /// Renders the same ruleset in nft text syntax, for display
    pub fn to_nft_text(&self) -> String {
        let mut out = format!("table inet {} {{\n", self.table);
        for (name, priority) in CHAINS {
            let _ = writeln!(out, "    chain {name} {{");
            let _ = writeln!(
                out,
                "        type filter hook {name} priority {priority}; policy accept;"
            );
            for kind in RuleKind::iter().filter(|k| k.chain() == name) {
                let matcher = match kind {
                    RuleKind::DnsResponses => format!("udp sport {DNS_PORT}"),
                    RuleKind::Intercept => "ct state { new, related }".to_string(),
                };
                let _ = writeln!(
                    out,
                    "        {matcher} queue num {} bypass comment \"{kind}\"",
                    self.queue
                );
            }
            out.push_str("    }\n");
        }
        out.push_str("}\n");
        out
    }

    /// Installs (or reinstalls) both interception rules.
    ///
    /// # Errors
    ///
    /// Returns `Err` if nft cannot be spawned or rejects the batch
    pub async fn install(&self) -> Result<()> {
        let payload = serde_json::to_string(&self.to_nftables_json())?;
        info!(table = %self.table, queue = self.queue, "Installing interception rules");
        run_nft(&["--json", "-f", "-"], Some(payload)).await?;
        Ok(())
    }

    /// Removes the interception table. A missing table is not an error.
    ///
    /// # Errors
    ///
    /// Returns `Err` if nft cannot be spawned or fails for another reason
    pub async fn remove(&self) -> Result<()> {
        info!(table = %self.table, "Removing interception rules");
        match run_nft(&["delete", "table", "inet", &self.table], None).await {
            Ok(_) => Ok(()),
            Err(Error::Nftables {
                stderr: Some(stderr),
                ..
            }) if stderr.contains("No such file or directory") => {
                debug!(table = %self.table, "Interception table already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Lists the interception table as nftables JSON.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the table does not exist or nft output is not JSON
    pub async fn list(&self) -> Result<Value> {
        let stdout = run_nft(&["--json", "list", "table", "inet", &self.table], None).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    /// Returns `true` when both interception rules are present.
    ///
    /// Any failure to query nftables reads as "not loaded".
    pub async fn are_loaded(&self) -> bool {
        match self.list().await {
            Ok(listing) => {
                let found = self.loaded_rules(&listing);
                RuleKind::iter().all(|kind| found.contains(&kind))
            }
            Err(e) => {
                debug!(table = %self.table, "Interception table not readable: {e}");
                false
            }
        }
    }

    /// Interception rules present in an nftables JSON listing
    pub fn loaded_rules(&self, listing: &Value) -> Vec<RuleKind> {
        let Some(items) = listing.get("nftables").and_then(Value::as_array) else {
            return Vec::new();
        };

        let rules: Vec<&Value> = items
            .iter()
            .filter_map(|item| item.get("rule"))
            .filter(|rule| rule.get("table").and_then(Value::as_str) == Some(self.table.as_str()))
            .collect();

        RuleKind::iter()
            .filter(|kind| {
                let comment = kind.to_string();
                rules.iter().any(|rule| {
                    rule.get("chain").and_then(Value::as_str) == Some(kind.chain())
                        && rule.get("comment").and_then(Value::as_str) == Some(comment.as_str())
                })
            })
            .collect()
    }
}

impl Default for InterceptionRules {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE, 0)
    }
}

fn nft_command(args: &[&str]) -> tokio::process::Command {
    let program = std::env::var(NFT_COMMAND_ENV).unwrap_or_else(|_| "nft".to_string());
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    cmd
}

/// Runs nft and returns its stdout
async fn run_nft(args: &[&str], stdin: Option<String>) -> Result<Vec<u8>> {
    let mut child = nft_command(args)
        .stdin(if stdin.is_some() {
            std::process::Stdio::piped()
        } else {
            std::process::Stdio::null()
        })
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| {
            error!("Failed to spawn nft: {e}");
            e
        })?;

    if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
        use tokio::io::AsyncWriteExt;
        pipe.write_all(payload.as_bytes()).await?;
        // Close stdin so nft sees EOF
        drop(pipe);
    }

    let output = child.wait_with_output().await?;

    if output.status.success() {
        Ok(output.stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        debug!("nft {} failed: {}", args.join(" "), stderr.trim());
        Err(Error::Nftables {
            message: stderr.trim().to_string(),
            stderr: Some(stderr),
            exit_code: output.status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{setup_mock_nft, wipe_mock_table};

    #[test]
    fn test_rule_comments() {
        assert_eq!(RuleKind::DnsResponses.to_string(), "fwwatch-dns-responses");
        assert_eq!(RuleKind::Intercept.to_string(), "fwwatch-intercept");
    }

    #[test]
    fn test_batch_structure() {
        let rules = InterceptionRules::new("fwwatch", 3);
        let json = rules.to_nftables_json();
        let nft = json["nftables"].as_array().unwrap();

        // table + flush + 2 chains + 2 rules
        assert_eq!(nft.len(), 6);
        assert_eq!(nft[0]["add"]["table"]["name"], "fwwatch");
        assert!(nft[1].get("flush").is_some());
        assert_eq!(nft[2]["add"]["chain"]["hook"], "input");
        assert_eq!(nft[3]["add"]["chain"]["prio"], -150);

        let dns = &nft[4]["add"]["rule"];
        assert_eq!(dns["chain"], "input");
        assert_eq!(dns["comment"], "fwwatch-dns-responses");
        assert_eq!(dns["expr"][0]["match"]["right"], 53);
        assert_eq!(dns["expr"][1]["queue"]["num"], 3);

        let intercept = &nft[5]["add"]["rule"];
        assert_eq!(intercept["chain"], "output");
        assert_eq!(intercept["expr"][1]["queue"]["flags"][0], "bypass");
    }

    #[test]
    fn test_nft_text_output() {
        let text = InterceptionRules::new("guard", 7).to_nft_text();
        assert!(text.starts_with("table inet guard {"));
        assert!(text.contains("udp sport 53 queue num 7 bypass comment \"fwwatch-dns-responses\""));
        assert!(text.contains("type filter hook output priority -150; policy accept;"));
        assert!(text.contains("ct state { new, related } queue num 7 bypass"));
    }

    #[test]
    fn test_loaded_rules_from_listing() {
        let rules = InterceptionRules::new("fwwatch", 0);
        let listing = json!({ "nftables": [
            { "metainfo": { "json_schema_version": 1 } },
            { "table": { "family": "inet", "name": "fwwatch", "handle": 1 } },
            { "rule": { "family": "inet", "table": "fwwatch", "chain": "input",
                        "handle": 3, "comment": "fwwatch-dns-responses", "expr": [] } },
            { "rule": { "family": "inet", "table": "fwwatch", "chain": "output",
                        "handle": 4, "comment": "fwwatch-intercept", "expr": [] } }
        ] });

        assert_eq!(
            rules.loaded_rules(&listing),
            vec![RuleKind::DnsResponses, RuleKind::Intercept]
        );
    }

    #[test]
    fn test_loaded_rules_ignores_wrong_chain_and_table() {
        let rules = InterceptionRules::new("fwwatch", 0);
        let listing = json!({ "nftables": [
            { "rule": { "table": "fwwatch", "chain": "output", "comment": "fwwatch-dns-responses" } },
            { "rule": { "table": "other", "chain": "output", "comment": "fwwatch-intercept" } }
        ] });
        assert!(rules.loaded_rules(&listing).is_empty());
    }

    #[test]
    fn test_loaded_rules_garbage_listing() {
        let rules = InterceptionRules::default();
        assert!(rules.loaded_rules(&json!({})).is_empty());
        assert!(rules.loaded_rules(&json!({ "nftables": "nope" })).is_empty());
    }

    #[tokio::test]
    async fn test_install_and_detect_with_mock() {
        setup_mock_nft();
        let rules = InterceptionRules::new("unit_install", 0);
        rules.remove().await.unwrap();
        assert!(!rules.are_loaded().await);

        rules.install().await.unwrap();
        assert!(rules.are_loaded().await);

        wipe_mock_table("unit_install");
        assert!(!rules.are_loaded().await);
    }

    #[tokio::test]
    async fn test_remove_missing_table_is_ok() {
        setup_mock_nft();
        let rules = InterceptionRules::new("unit_never_installed", 0);
        assert!(rules.remove().await.is_ok());
        assert!(rules.list().await.is_err());
    }
}
