//! Integration tests for fwwatch
//!
//! These tests drive the rule watchdog end to end against the mock nft
//! script, which keeps its tables in a private temporary directory and never
//! touches real nftables:
//!
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use fwwatch::core::nft::{NFT_COMMAND_ENV, RuleKind};
use fwwatch::{InterceptionRules, RuleWatchdog, StatusQuery, StatusStore, WatchdogConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

static MOCK_NFT_INIT: Once = Once::new();

fn mock_state_dir() -> PathBuf {
    std::env::temp_dir().join(format!("fwwatch-it-mock-nft-{}", std::process::id()))
}

/// Set up environment to use mock nft
fn setup_mock_nft() {
    MOCK_NFT_INIT.call_once(|| {
        let mut mock = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        mock.push("tests");
        mock.push("mock_nft.sh");
        unsafe {
            std::env::set_var(NFT_COMMAND_ENV, mock);
            std::env::set_var("FWWATCH_MOCK_STATE", mock_state_dir());
        }
    });
}

/// Another process flushing our table
fn wipe_table(table: &str) {
    let _ = std::fs::remove_file(mock_state_dir().join(format!("{table}.json")));
}

/// Makes every install into `table` fail until cleared
fn set_install_failing(table: &str, failing: bool) {
    let marker = mock_state_dir().join(format!("{table}.fail"));
    if failing {
        std::fs::create_dir_all(mock_state_dir()).unwrap();
        std::fs::write(marker, "").unwrap();
    } else {
        let _ = std::fs::remove_file(marker);
    }
}

fn fast_config() -> WatchdogConfig {
    WatchdogConfig {
        check_interval: Duration::from_millis(50),
        ..WatchdogConfig::default()
    }
}

/// Polls `condition` until it holds or `timeout` elapses
async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Starts the watchdog with nftables-backed callbacks, counting reloads
async fn start_nft_watchdog(
    watchdog: &RuleWatchdog,
    rules: &InterceptionRules,
    reloads: &Arc<AtomicUsize>,
) {
    let runtime = tokio::runtime::Handle::current();
    let check_runtime = runtime.clone();
    let check_rules = rules.clone();
    let reload_rules = rules.clone();
    let reloads = Arc::clone(reloads);

    watchdog
        .start(
            move || check_runtime.block_on(check_rules.are_loaded()),
            move || {
                reloads.fetch_add(1, Ordering::SeqCst);
                let _ = runtime.block_on(reload_rules.install());
            },
        )
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watchdog_reinstalls_wiped_rules() {
    setup_mock_nft();
    let rules = InterceptionRules::new("it_reinstall", 4);
    rules.install().await.unwrap();

    let watchdog = RuleWatchdog::new(fast_config());
    let reloads = Arc::new(AtomicUsize::new(0));
    start_nft_watchdog(&watchdog, &rules, &reloads).await;

    wipe_table("it_reinstall");
    assert!(!rules.are_loaded().await);

    let healed = eventually(Duration::from_secs(5), || rules.are_loaded()).await;
    watchdog.stop().await;

    assert!(healed, "watchdog never reinstalled the rules");
    assert!(reloads.load(Ordering::SeqCst) >= 1);

    let listing = rules.list().await.unwrap();
    assert_eq!(
        rules.loaded_rules(&listing),
        vec![RuleKind::DnsResponses, RuleKind::Intercept]
    );
    rules.remove().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watchdog_leaves_present_rules_alone() {
    setup_mock_nft();
    let rules = InterceptionRules::new("it_present", 0);
    rules.install().await.unwrap();

    let watchdog = RuleWatchdog::new(fast_config());
    let reloads = Arc::new(AtomicUsize::new(0));
    start_nft_watchdog(&watchdog, &rules, &reloads).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    watchdog.stop().await;

    assert_eq!(reloads.load(Ordering::SeqCst), 0);
    rules.remove().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_reload_is_retried_on_next_tick() {
    setup_mock_nft();
    let rules = InterceptionRules::new("it_retry", 0);
    set_install_failing("it_retry", true);
    assert!(rules.install().await.is_err());

    let watchdog = RuleWatchdog::new(fast_config());
    let reloads = Arc::new(AtomicUsize::new(0));
    start_nft_watchdog(&watchdog, &rules, &reloads).await;

    let retried = eventually(Duration::from_secs(5), || {
        let reloads = Arc::clone(&reloads);
        async move { reloads.load(Ordering::SeqCst) >= 2 }
    })
    .await;
    assert!(retried, "reload was not retried");
    assert!(!rules.are_loaded().await);

    set_install_failing("it_retry", false);
    let healed = eventually(Duration::from_secs(5), || rules.are_loaded()).await;
    watchdog.stop().await;

    assert!(healed);
    rules.remove().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopped_watchdog_no_longer_heals() {
    setup_mock_nft();
    let rules = InterceptionRules::new("it_stopped", 0);
    rules.install().await.unwrap();

    let watchdog = RuleWatchdog::new(fast_config());
    let reloads = Arc::new(AtomicUsize::new(0));
    start_nft_watchdog(&watchdog, &rules, &reloads).await;
    watchdog.stop().await;
    assert!(!watchdog.is_active().await);

    wipe_table("it_stopped");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!rules.are_loaded().await);
    assert_eq!(reloads.load(Ordering::SeqCst), 0);
    assert_eq!(watchdog.running_tasks(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_inflight_reload_before_removal() {
    setup_mock_nft();
    let rules = InterceptionRules::new("it_shutdown", 0);

    let watchdog = RuleWatchdog::new(fast_config());
    let runtime = tokio::runtime::Handle::current();
    let check_runtime = runtime.clone();
    let check_rules = rules.clone();
    let reload_rules = rules.clone();
    watchdog
        .start(
            move || check_runtime.block_on(check_rules.are_loaded()),
            move || {
                std::thread::sleep(Duration::from_millis(200));
                let _ = runtime.block_on(reload_rules.install());
            },
        )
        .await;

    // First tick at 50ms starts the slow reload
    tokio::time::sleep(Duration::from_millis(100)).await;
    watchdog.stop().await;
    assert_eq!(watchdog.running_tasks(), 1);

    assert!(watchdog.wait_idle(Duration::from_secs(5)).await);
    rules.remove().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!rules.are_loaded().await, "rules reinstalled after shutdown");
    assert_eq!(watchdog.running_tasks(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_switches_queue() {
    setup_mock_nft();
    let old_rules = InterceptionRules::new("it_restart", 1);
    let new_rules = InterceptionRules::new("it_restart", 2);
    old_rules.install().await.unwrap();

    let watchdog = RuleWatchdog::new(fast_config());
    let old_reloads = Arc::new(AtomicUsize::new(0));
    let new_reloads = Arc::new(AtomicUsize::new(0));
    start_nft_watchdog(&watchdog, &old_rules, &old_reloads).await;
    start_nft_watchdog(&watchdog, &new_rules, &new_reloads).await;

    let settled = eventually(Duration::from_secs(2), || async {
        watchdog.running_tasks() == 1
    })
    .await;
    assert!(settled);

    wipe_table("it_restart");
    let healed = eventually(Duration::from_secs(5), || new_rules.are_loaded()).await;
    watchdog.stop().await;

    assert!(healed);
    assert_eq!(old_reloads.load(Ordering::SeqCst), 0);
    assert!(new_reloads.load(Ordering::SeqCst) >= 1);
    new_rules.remove().await.unwrap();
}

#[tokio::test]
async fn test_rejected_install_translates_to_permission_error() {
    setup_mock_nft();
    let rules = InterceptionRules::new("it_denied", 0);
    set_install_failing("it_denied", true);

    let err = rules.install().await.unwrap_err();
    let translation = err.translate();
    assert!(translation.user_message.contains("permissions"));
    assert!(!rules.are_loaded().await);

    set_install_failing("it_denied", false);
}

#[test]
fn test_status_store_public_api() {
    let store = StatusStore::new();
    store.set_queue_number(Some(10));
    store.set_running(true);

    assert_eq!(store.queue_number(), 10);
    assert!(Some(&store).is_running());

    let gone: Option<&StatusStore> = None;
    assert!(!gone.is_running());
    assert!(!gone.is_intercepting());
    assert!(!gone.is_firewall_enabled());
}
