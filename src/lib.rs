//! fwwatch - interception rule watchdog
//!
//! Keeps the nftables rules that send traffic to a netfilter queue in place.
//! A background watchdog checks for the rules on a fixed interval and
//! reinstalls them when another process, a firewall reload or a crash has
//! removed them.
//!
//! # Architecture
//!
//! - [`core`] - Status flags, the rule watchdog, and the nftables backend
//! - [`audit`] - Audit log of rule installs, reloads and removals
//! - [`config`] - Configuration persistence
//! - [`utils`] - XDG directory helpers

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod utils;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::nft::InterceptionRules;
pub use core::status::{StatusQuery, StatusStore};
pub use core::watchdog::{RuleWatchdog, WatchdogConfig, WatchdogState};
