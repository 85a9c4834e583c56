use rand::rngs::StdRng;
use rand::SeedableRng;

use cubesat_obc::reconnect::*;

fn expected_nominal(n: u32) -> u64 {
    (1_000u64 << (n - 1)).min(60_000)
}

#[test]
fn test_backoff_delays_for_first_eight_attempts() {
    for seed in 0..50 {
        let mut mgr =
            ReconnectManager::with_rng(BackoffPolicy::default(), None, StdRng::seed_from_u64(seed));
        mgr.on_connected();

        let mut now = 1_000_000;
        let mut deadline = mgr.on_disconnected(now).expect("first retry scheduled");
        for n in 1..=8u32 {
            let delay = deadline - now;
            let nominal = expected_nominal(n);
            let low = nominal * 8 / 10;
            let high = nominal * 12 / 10;
            assert!(
                (low..=high).contains(&delay),
                "seed {seed}, attempt {n}: delay {delay} outside {low}..={high}"
            );
            assert_eq!(mgr.retry_count(), n - 1);

            now = deadline;
            assert!(mgr.begin_attempt(now));
            deadline = mgr.on_disconnected(now).expect("retry rescheduled");
        }
    }
}

#[test]
fn test_delay_is_capped() {
    let policy = BackoffPolicy::default();
    for n in 7..40 {
        assert_eq!(policy.nominal_delay_ms(n), 60_000);
    }
}

#[test]
fn test_retrying_continues_past_max_attempts() {
    let mut mgr =
        ReconnectManager::with_rng(BackoffPolicy::default(), Some(2), StdRng::seed_from_u64(9));
    mgr.begin_initial_attempt();

    let mut now = 0;
    for _ in 0..20 {
        now = mgr.on_disconnected(now).expect("always rescheduled");
        assert!(mgr.begin_attempt(now));
    }
    assert_eq!(mgr.severity(), RetrySeverity::Critical);
    assert_eq!(mgr.state(), ConnectionState::Reconnecting);

    let outcome = mgr.on_connected();
    assert_eq!(outcome.outage_retries, 20);
    assert!(!outcome.reconnected);
    assert_eq!(mgr.retry_count(), 0);
    assert_eq!(mgr.severity(), RetrySeverity::Routine);
}

#[test]
fn test_initial_connect_failure_schedules_retry() {
    let mut mgr =
        ReconnectManager::with_rng(BackoffPolicy::default(), None, StdRng::seed_from_u64(1));
    mgr.begin_initial_attempt();
    assert_eq!(mgr.state(), ConnectionState::Disconnected);

    let deadline = mgr.on_disconnected(0).unwrap();
    assert_eq!(mgr.retry_count(), 1);
    // Second failure overall, so the second step of the sequence.
    assert!((1_600..=2_400).contains(&deadline));
}
