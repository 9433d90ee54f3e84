//! Environment-driven sync settings

use serial_test::serial;
use std::env;
use std::time::Duration;
use syncpipe_server::config::SyncSettings;

const VARS: &[&str] = &[
    "SYNC_ENABLED",
    "SYNC_TICK_INTERVAL_SECS",
    "SYNC_BASE_DELAY_SECS",
    "SYNC_MAX_DELAY_SECS",
    "SYNC_MAX_RETRIES",
    "SYNC_JOBS_FILE",
];

fn clear() {
    for var in VARS {
        env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_defaults_without_environment() {
    clear();
    let settings = SyncSettings::from_env();

    assert!(settings.enabled);
    assert!(settings.jobs_file.is_none());
    assert!(settings.validate().is_ok());
    assert_eq!(settings.default_retry_policy().base_delay, Duration::from_secs(settings.base_delay_secs));
}

#[test]
#[serial]
fn test_environment_overrides_retry_policy() {
    clear();
    env::set_var("SYNC_ENABLED", "false");
    env::set_var("SYNC_BASE_DELAY_SECS", "5");
    env::set_var("SYNC_MAX_DELAY_SECS", "40");
    env::set_var("SYNC_MAX_RETRIES", "2");
    env::set_var("SYNC_JOBS_FILE", "/etc/syncpipe/jobs.toml");

    let settings = SyncSettings::from_env();
    let policy = settings.default_retry_policy();

    assert!(!settings.enabled);
    assert_eq!(policy.delay_for(0), Duration::from_secs(5));
    assert_eq!(policy.delay_for(5), Duration::from_secs(40));
    assert!(policy.can_retry(1));
    assert!(!policy.can_retry(2));
    assert_eq!(settings.jobs_file.unwrap().to_str(), Some("/etc/syncpipe/jobs.toml"));
    clear();
}

#[test]
#[serial]
fn test_unparseable_values_fall_back_to_defaults() {
    clear();
    env::set_var("SYNC_TICK_INTERVAL_SECS", "soon");
    assert_eq!(SyncSettings::from_env().tick_interval_secs, SyncSettings::default().tick_interval_secs);
    clear();
}

#[test]
#[serial]
fn test_base_delay_above_max_is_rejected() {
    clear();
    env::set_var("SYNC_BASE_DELAY_SECS", "600");
    env::set_var("SYNC_MAX_DELAY_SECS", "60");
    assert!(SyncSettings::from_env().validate().is_err());
    clear();
}
