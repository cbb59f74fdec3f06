use chrono::{Duration, TimeZone, Utc};
use community_gate::{
    clock::ManualClock,
    rate_limit::{MemoryRateLimitStore, RateLimitStore},
};
use std::sync::Arc;

fn store_at_epoch() -> (Arc<ManualClock>, MemoryRateLimitStore) {
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let store = MemoryRateLimitStore::with_clock(clock.clone());
    (clock, store)
}

#[tokio::test]
async fn test_rate_limit_basic_functionality() {
    let (_clock, store) = store_at_epoch();

    let first = store.check_limit("x", 3, 60_000, "cat");
    let second = store.check_limit("x", 3, 60_000, "cat");
    let third = store.check_limit("x", 3, 60_000, "cat");

    assert!(first.allowed && second.allowed && third.allowed);
    assert_eq!(
        (first.remaining, second.remaining, third.remaining),
        (2, 1, 0)
    );

    // 4回目は拒否される
    let fourth = store.check_limit("x", 3, 60_000, "cat");
    assert!(!fourth.allowed);
    assert_eq!(fourth.remaining, 0);
    assert_eq!(fourth.total_requests, 4);
}

#[tokio::test]
async fn test_rate_limit_shares_reset_time_within_window() {
    let (clock, store) = store_at_epoch();

    let first = store.check_limit("shared", 5, 60_000, "cat");
    clock.advance(Duration::seconds(20));
    let second = store.check_limit("shared", 5, 60_000, "cat");

    assert_eq!(first.reset_time, second.reset_time);
    assert_eq!(first.reset_time, clock.now_minus(Duration::seconds(20)) + Duration::minutes(1));
}

#[tokio::test]
async fn test_rate_limit_never_admits_more_than_max() {
    let (_clock, store) = store_at_epoch();

    let allowed = (0..25)
        .map(|_| store.check_limit("burst", 7, 60_000, "cat"))
        .filter(|r| r.allowed)
        .count();
    assert_eq!(allowed, 7);
}

#[tokio::test]
async fn test_rate_limit_window_reset() {
    let (clock, store) = store_at_epoch();

    assert!(store.check_limit("window", 2, 1_000, "cat").allowed);
    assert!(store.check_limit("window", 2, 1_000, "cat").allowed);
    assert!(!store.check_limit("window", 2, 1_000, "cat").allowed);

    // ウィンドウ終了ちょうどで新しいウィンドウが始まる
    clock.advance(Duration::milliseconds(1_000));
    let fresh = store.check_limit("window", 2, 1_000, "cat");
    assert!(fresh.allowed);
    assert_eq!(fresh.total_requests, 1);
    assert_eq!(fresh.remaining, 1);
    assert_eq!(fresh.reset_time, clock.now_plus(Duration::milliseconds(1_000)));
}

#[tokio::test]
async fn test_rate_limit_different_identifiers() {
    let (_clock, store) = store_at_epoch();

    assert!(store.check_limit("admin:10.0.0.1", 1, 60_000, "admin").allowed);
    assert!(!store.check_limit("admin:10.0.0.1", 1, 60_000, "admin").allowed);

    // 別の識別子は独立してカウントされる
    assert!(store.check_limit("apikey:10.0.0.1", 1, 60_000, "apikey").allowed);
    assert!(store.check_limit("admin:10.0.0.2", 1, 60_000, "admin").allowed);
}

#[tokio::test]
async fn test_get_usage_is_read_only() {
    let (clock, store) = store_at_epoch();

    assert!(store.get_usage("reader").is_none());
    store.check_limit("reader", 10, 60_000, "reads");

    let usage = store.get_usage("reader").expect("usage recorded");
    assert_eq!(usage.count, 1);
    assert_eq!(usage.remaining, 9);
    assert_eq!(usage.category, "reads");

    let again = store.get_usage("reader").expect("usage recorded");
    assert_eq!(again.count, 1);

    clock.advance(Duration::minutes(1));
    assert!(store.get_usage("reader").is_none());
    // 期限切れでも読み取りだけでは削除されない
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_get_all_limits_sorted_by_count() {
    let (_clock, store) = store_at_epoch();

    for _ in 0..2 {
        store.check_limit("medium", 10, 60_000, "cat");
    }
    store.check_limit("light", 10, 60_000, "cat");
    for _ in 0..5 {
        store.check_limit("heavy", 10, 60_000, "cat");
    }

    let order: Vec<(String, u32)> = store
        .get_all_limits()
        .into_iter()
        .map(|u| (u.identifier, u.count))
        .collect();
    assert_eq!(
        order,
        vec![
            ("heavy".to_string(), 5),
            ("medium".to_string(), 2),
            ("light".to_string(), 1),
        ]
    );
}

#[tokio::test]
async fn test_reset_behaves_like_first_call() {
    let (clock, store) = store_at_epoch();

    for _ in 0..4 {
        store.check_limit("resettable", 3, 60_000, "cat");
    }
    clock.advance(Duration::seconds(10));

    assert!(store.reset("resettable"));
    assert!(!store.reset("resettable"));

    let after = store.check_limit("resettable", 3, 60_000, "cat");
    assert!(after.allowed);
    assert_eq!(after.total_requests, 1);
    assert_eq!(after.remaining, 2);
    assert_eq!(after.reset_time, clock.now_plus(Duration::minutes(1)));
}

#[tokio::test]
async fn test_rate_limit_cleanup() {
    let (clock, store) = store_at_epoch();

    store.check_limit("short", 5, 1_000, "cat");
    store.check_limit("long", 5, 60_000, "cat");
    clock.advance(Duration::seconds(1));

    assert_eq!(store.cleanup(), 1);
    assert!(store.get_usage("short").is_none());
    assert_eq!(store.get_usage("long").map(|u| u.count), Some(1));

    // 冪等
    assert_eq!(store.cleanup(), 0);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_concurrent_checks_respect_limit() {
    let store = Arc::new(MemoryRateLimitStore::new());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || {
                (0..50)
                    .filter(|_| store.check_limit("contended", 100, 60_000, "cat").allowed)
                    .count()
            })
        })
        .collect();

    let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(allowed, 100);
    assert_eq!(store.get_usage("contended").unwrap().count, 400);
}

trait ClockExt {
    fn now_plus(&self, by: Duration) -> chrono::DateTime<Utc>;
    fn now_minus(&self, by: Duration) -> chrono::DateTime<Utc>;
}

impl ClockExt for ManualClock {
    fn now_plus(&self, by: Duration) -> chrono::DateTime<Utc> {
        community_gate::Clock::now(self) + by
    }

    fn now_minus(&self, by: Duration) -> chrono::DateTime<Utc> {
        community_gate::Clock::now(self) - by
    }
}
