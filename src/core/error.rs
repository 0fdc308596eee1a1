use thiserror::Error;

/// Core error types for fwwatch
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// nftables command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Configuration could not be read or written
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of nftables error patterns and their translations
pub struct NftablesErrorPattern;

impl NftablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run fwwatch as root or with CAP_NET_ADMIN")
                .with_suggestion("Verify nftables is accessible: nft list tables");
        }

        // `queue` statements need nfnetlink_queue support in the kernel
        if lower.contains("queue") && lower.contains("not supported") {
            return ErrorTranslation::new("The kernel does not support netfilter queues")
                .with_suggestion("Load the module: modprobe nfnetlink_queue")
                .with_suggestion("Check kernel config for CONFIG_NETFILTER_NETLINK_QUEUE");
        }

        // nft prefixes its own errors, so this catches a missing table or
        // chain before the missing-binary check below
        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("nftables rejected the interception rules")
                .with_suggestion("Check that the queue number is between 0 and 65535")
                .with_suggestion("Inspect the generated batch with: fwwatch show --format json");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("nftables is not installed or not found in PATH")
                .with_suggestion("Install nftables: sudo apt install nftables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install nftables  (Fedora/RHEL)")
                .with_suggestion("Or set FWWATCH_NFT_COMMAND to the nft binary");
        }

        ErrorTranslation::new(msg.trim().to_string())
    }
}

impl Error {
    /// Returns a translated, user-facing description of this error
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Error::Nftables { message, stderr, .. } => {
                NftablesErrorPattern::match_error(stderr.as_deref().unwrap_or(message))
            }
            Error::Io(e) => NftablesErrorPattern::match_error(&e.to_string()),
            other => ErrorTranslation::new(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
