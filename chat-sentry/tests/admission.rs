//! Integration tests for the admission-control subsystem.
//!
//! These drive the public `Sentry` surface with explicit timestamps the way
//! the request, handshake, and ingestion layers would, covering the
//! cross-component contracts: access-list precedence, quota accounting
//! across denials, and the janitor-independent self-healing of expiry.

use chat_sentry::{Denial, Sentry, SentryConfig, chat_user_key};
use std::time::Duration;

fn config() -> SentryConfig {
    let mut config = SentryConfig::default();
    // Small, fast policies for the API category: 3 per second, 2s lockout
    config.api.window = Duration::from_millis(1_000);
    config.api.max_count = 3;
    config.api.block_duration = Duration::from_millis(2_000);
    config
}

#[test]
fn test_end_to_end_rate_limit_scenario() {
    let sentry = Sentry::new(config()).unwrap();

    // Calls at t=0,100,200 are admitted with remaining 2,1,0
    let c = sentry.check_api_at("1.2.3.4", 0).unwrap();
    assert_eq!((c.remaining, c.resets_at_ms), (2, 1_000));
    let c = sentry.check_api_at("1.2.3.4", 100).unwrap();
    assert_eq!(c.remaining, 1);
    let c = sentry.check_api_at("1.2.3.4", 200).unwrap();
    assert_eq!(c.remaining, 0);

    // The fourth call is denied and engages the 2s block
    match sentry.check_api_at("1.2.3.4", 300) {
        Err(Denial::RateLimited { retry_after_ms }) => assert_eq!(retry_after_ms, 2_000),
        other => panic!("expected RateLimited, got {other:?}"),
    }

    // While blocked, retry hints shrink and the count does not grow
    match sentry.check_api_at("1.2.3.4", 1_300) {
        Err(Denial::RateLimited { retry_after_ms }) => assert_eq!(retry_after_ms, 1_000),
        other => panic!("expected RateLimited, got {other:?}"),
    }

    // At t=2300 the block has lapsed; a fresh window starts with count 1
    let c = sentry.check_api_at("1.2.3.4", 2_300).unwrap();
    assert_eq!((c.remaining, c.resets_at_ms), (2, 3_300));
}

#[test]
fn test_whitelisted_identity_is_never_limited() {
    let sentry = Sentry::new(config()).unwrap();
    sentry.whitelist("10.0.0.1");

    for i in 0..100 {
        assert!(sentry.check_api_at("10.0.0.1", i).is_ok());
    }
}

#[test]
fn test_blacklist_beats_simultaneous_whitelist() {
    let sentry = Sentry::new(config()).unwrap();
    sentry.whitelist("10.0.0.1");
    sentry.blacklist_at("10.0.0.1", "operator ban", Some(Duration::from_secs(60)), 0);

    assert!(matches!(
        sentry.check_api_at("10.0.0.1", 10),
        Err(Denial::Blacklisted { .. })
    ));

    // The ban expires; whitelist membership resumes
    assert!(sentry.check_api_at("10.0.0.1", 61_000).is_ok());
}

#[test]
fn test_seeded_whitelist_from_config() {
    let mut config = config();
    config.whitelist = vec!["172.16.0.9".to_owned()];
    let sentry = Sentry::new(config).unwrap();

    for i in 0..50 {
        assert!(sentry.check_api_at("172.16.0.9", i).is_ok());
    }
    assert_eq!(sentry.stats().whitelist_entries, 1);
}

#[test]
fn test_broadcast_cap_spares_quota() {
    let mut config = config();
    config.broadcast.max_recipients = 500;
    config.broadcast.max_count = 1;
    let sentry = Sentry::new(config).unwrap();

    assert!(matches!(
        sentry.check_broadcast_at("sess-1", 501, 0),
        Err(Denial::TooManyRecipients {
            max: 500,
            requested: 501
        })
    ));

    // The oversized attempt consumed nothing: the single window unit remains
    let clearance = sentry.check_broadcast_at("sess-1", 400, 10).unwrap();
    assert_eq!(clearance.remaining, 0);
    assert_eq!(clearance.per_message_delay, Duration::from_secs(3));

    assert!(matches!(
        sentry.check_broadcast_at("sess-1", 400, 20),
        Err(Denial::BroadcastLimited { .. })
    ));
}

#[test]
fn test_spam_to_blacklist_promotion_flow() {
    let mut config = config();
    config.chat_user.max_messages = 5;
    config.chat_user.warn_threshold = 3;
    let sentry = Sentry::new(config).unwrap();

    // The ingestion layer observes a flood from one chat user
    let mut warned = false;
    let mut spam = false;
    for i in 0..10 {
        let verdict = sentry.observe_chat_user_at("sess-1", "+5511999", i);
        warned |= verdict.should_warn;
        spam = verdict.is_spam;
    }
    assert!(warned);
    assert!(spam);

    // Its policy decision: promote the composite identity to the blacklist
    let key = chat_user_key("sess-1", "+5511999");
    sentry.blacklist_at(&key, "repeated spam", Some(Duration::from_secs(3600)), 10);
    assert!(sentry.is_blacklisted_at(&key, 1_000));

    // A different chat user in the same session is unaffected
    assert!(!sentry.is_blacklisted_at(&chat_user_key("sess-1", "+5511000"), 1_000));
}

#[test]
fn test_connection_lifecycle_visible_in_stats() {
    let mut config = config();
    config.socket.max_connections = 2;
    let sentry = Sentry::new(config).unwrap();

    sentry.admit_connection_at("9.9.9.9", "ws-1", 0).unwrap();
    sentry.admit_connection_at("9.9.9.9", "ws-2", 0).unwrap();
    assert!(matches!(
        sentry.admit_connection_at("9.9.9.9", "ws-3", 0),
        Err(Denial::TooManyConnections { max: 2 })
    ));

    sentry.release_connection("9.9.9.9", "ws-1");
    sentry.admit_connection_at("9.9.9.9", "ws-3", 0).unwrap();

    assert_eq!(sentry.stats().connection_identities, 1);
    sentry.release_connection("9.9.9.9", "ws-2");
    sentry.release_connection("9.9.9.9", "ws-3");
    assert_eq!(sentry.stats().connection_identities, 0);
    assert_eq!(sentry.stats().open_connections, 0);
}

#[test]
fn test_expiry_self_heals_without_janitor() {
    let sentry = Sentry::new(config()).unwrap();

    // Exhaust the window and engage the block; never run a sweep
    for i in 0..3 {
        sentry.check_api_at("k", i).unwrap();
    }
    assert!(sentry.check_api_at("k", 3).is_err());

    // Long after everything expired, the read path alone recovers the key
    let clearance = sentry.check_api_at("k", 1_000_000).unwrap();
    assert_eq!(clearance.remaining, 2);
}

#[test]
fn test_clear_all_limits_unblocks_without_unbanning() {
    let sentry = Sentry::new(config()).unwrap();

    for i in 0..4 {
        let _ = sentry.check_api_at("k", i);
    }
    assert!(sentry.check_api_at("k", 10).is_err());
    sentry.blacklist_at("banned", "spam", None, 0);

    sentry.clear_all_limits();

    assert!(sentry.check_api_at("k", 20).is_ok());
    assert!(sentry.is_blacklisted_at("banned", 20));
}
