//! Audit logging for firewall changes
//!
//! Records every install, watchdog-driven reload and removal of the
//! interception rules, and watchdog start/stop, as JSON lines in the state
//! directory.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InstallRules,
    ReloadRules,
    RemoveRules,
    WatchdogStarted,
    WatchdogStopped,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates an audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Creates an audit log at an explicit path
    pub fn at(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.log_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect();

        Ok(events)
    }

    /// Returns the path to the audit log file
    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }
}

/// Records an event in the default audit log. Failures are logged, never
/// returned.
pub async fn record(
    event_type: EventType,
    success: bool,
    details: serde_json::Value,
    error: Option<String>,
) {
    match AuditLog::new() {
        Ok(audit) => {
            let event = AuditEvent::new(event_type, success, details, error);
            if let Err(e) = audit.log(event).await {
                tracing::warn!("Failed to write audit log: {}", e);
            }
        }
        Err(e) => tracing::warn!("Audit log unavailable: {}", e),
    }
}

/// Logs a rule install or reload
pub async fn log_rules_applied(
    reload: bool,
    table: &str,
    queue: u16,
    success: bool,
    error: Option<String>,
) {
    let event_type = if reload {
        EventType::ReloadRules
    } else {
        EventType::InstallRules
    };
    record(
        event_type,
        success,
        serde_json::json!({ "table": table, "queue": queue }),
        error,
    )
    .await;
}

/// Logs a rule removal
pub async fn log_rules_removed(table: &str, success: bool, error: Option<String>) {
    record(
        EventType::RemoveRules,
        success,
        serde_json::json!({ "table": table }),
        error,
    )
    .await;
}

/// Logs a watchdog start or stop
pub async fn log_watchdog(started: bool, interval_secs: u64) {
    let event_type = if started {
        EventType::WatchdogStarted
    } else {
        EventType::WatchdogStopped
    };
    record(
        event_type,
        true,
        serde_json::json!({ "interval_secs": interval_secs }),
        None,
    )
    .await;
}
