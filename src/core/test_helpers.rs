//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use std::path::PathBuf;
use std::sync::Once;

/// One-time initialization flag for mock nft setup
static MOCK_NFT_INIT: Once = Once::new();

/// Directory where the mock nft keeps its tables for this test binary
pub fn mock_state_dir() -> PathBuf {
    std::env::temp_dir().join(format!("fwwatch-mock-nft-{}", std::process::id()))
}

/// Sets up the mock nft script for testing.
///
/// Sets `FWWATCH_NFT_COMMAND` to `tests/mock_nft.sh` and gives the mock a
/// state directory private to this process. Safe to call from every test;
/// tests isolate themselves by using distinct table names.
pub fn setup_mock_nft() {
    MOCK_NFT_INIT.call_once(|| {
        let mock_path = format!("{}/tests/mock_nft.sh", env!("CARGO_MANIFEST_DIR"));
        // SAFETY: This is only called once due to Once, and only in test code.
        unsafe {
            std::env::set_var(crate::core::nft::NFT_COMMAND_ENV, &mock_path);
            std::env::set_var("FWWATCH_MOCK_STATE", mock_state_dir());
        }
    });
}

/// Simulates another process deleting the interception table
pub fn wipe_mock_table(table: &str) {
    let _ = std::fs::remove_file(mock_state_dir().join(format!("{table}.json")));
}
