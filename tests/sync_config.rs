use std::time::Duration;

use aviary_sync::runtime::config::SyncConfig;

#[test]
fn default_backoff_doubles_until_the_cap() {
    let config = SyncConfig::default();
    let delays: Vec<u64> = (1..=8).map(|n| config.backoff_delay_ms(n)).collect();
    assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000]);
    assert_eq!(config.backoff_delay_ms(u32::MAX), 60_000);
}

#[test]
fn partial_json_keeps_defaults_for_absent_keys() {
    let config = SyncConfig::from_json(r#"{ "maxAttempts": 3, "backoffCapMs": 10000, "resubscribeDelayMs": 250 }"#)
        .expect("parse");
    assert_eq!(
        config,
        SyncConfig {
            max_attempts: 3,
            backoff_cap_ms: 10_000,
            resubscribe_delay_ms: 250,
            ..SyncConfig::default()
        }
    );
    assert_eq!(config.resubscribe_delay(), Duration::from_millis(250));
    assert_eq!(config.backoff_delay_ms(6), 10_000);

    assert_eq!(SyncConfig::from_json("{}").expect("empty"), SyncConfig::default());
}

#[test]
fn malformed_json_is_an_error() {
    assert!(SyncConfig::from_json(r#"{ "maxAttempts": "five" }"#).is_err());
    assert!(SyncConfig::from_json("not json").is_err());
}

#[test]
fn zero_reap_interval_is_clamped() {
    let config = SyncConfig {
        reap_interval_ms: 0,
        ..SyncConfig::default()
    };
    assert_eq!(config.reap_interval(), Duration::from_millis(1));
}
