//! Core interception-control functionality
//!
//! - [`status`]: Thread-safe operational flags and the interception queue number
//! - [`watchdog`]: Periodic verification and reinstallation of interception rules
//! - [`nft`]: nftables backend providing the watchdog's check and reload actions
//! - [`error`]: Error types for firewall operations

pub mod error;
pub mod nft;
pub mod status;
pub mod watchdog;

#[cfg(test)]
pub mod test_helpers;
