//! Retention tests: clock-driven segment rolling and purging observed
//! through the public producer/consumer surface.

use rill_log::ManualClock;

use crate::support::TestEnv;

/// One record per cycle under a `<n>s` policy.
fn fill_cycles(env: &TestEnv, clock: &ManualClock, name: &str, cycles: u64) {
    let appender = env.manager.appender(name).unwrap();
    for i in 0..cycles {
        clock.set_ms(i64::try_from(i).unwrap() * 1_000);
        appender.append(0, format!("cycle-{i}").as_bytes()).unwrap();
    }
}

#[test]
fn test_retention_purge_drops_oldest_records() {
    let clock = ManualClock::new(0);
    let env = TestEnv::with_manual_clock("2s", clock.clone()).unwrap();
    env.manager.create("q", 1).unwrap();
    fill_cycles(&env, &clock, "q", 5);

    let appender = env.manager.appender("q").unwrap();
    // 2 retained cycles: records 0..3 are gone.
    assert_eq!(appender.first_offset(0).unwrap(), 3);
    assert_eq!(appender.end_offset(0).unwrap(), 5);

    let mut tailer = env.manager.acquire_tailer_all("g", "q").unwrap();
    assert_eq!(
        tailer.read().unwrap().unwrap().payload.as_ref(),
        b"cycle-3"
    );
    assert_eq!(
        tailer.read().unwrap().unwrap().payload.as_ref(),
        b"cycle-4"
    );
    assert!(tailer.read().unwrap().is_none());
}

#[test]
fn test_retention_floor_survives_long_idle() {
    let clock = ManualClock::new(0);
    let env = TestEnv::with_manual_clock("3s", clock.clone()).unwrap();
    env.manager.create("q", 1).unwrap();
    fill_cycles(&env, &clock, "q", 3);

    // Far in the future every segment is past its nominal age, but the
    // newest 3 are still kept.
    clock.set_ms(3_600_000);
    env.manager.appender("q").unwrap().append(0, b"late").unwrap();

    let appender = env.manager.appender("q").unwrap();
    assert_eq!(appender.first_offset(0).unwrap(), 1);
    assert_eq!(appender.end_offset(0).unwrap(), 4);
}

#[test]
fn test_retention_count_messages_reports_purged_range_empty() {
    let clock = ManualClock::new(0);
    let env = TestEnv::with_manual_clock("2s", clock.clone()).unwrap();
    env.manager.create("q", 1).unwrap();
    fill_cycles(&env, &clock, "q", 6);

    let appender = env.manager.appender("q").unwrap();
    let first = appender.first_offset(0).unwrap();
    assert_eq!(first, 4);
    assert_eq!(appender.count_messages(0, 0, 4).unwrap(), 0);
    assert_eq!(appender.count_messages(0, first, 6).unwrap(), 2);
}

#[test]
fn test_retention_stale_commit_clamps_to_first_retained() {
    let clock = ManualClock::new(0);
    let env = TestEnv::with_manual_clock("2s", clock.clone()).unwrap();
    env.manager.create("q", 1).unwrap();

    // Commit early, then let purging run past the committed position.
    {
        let appender = env.manager.appender("q").unwrap();
        clock.set_ms(0);
        appender.append(0, b"cycle-0").unwrap();
        let mut tailer = env.manager.acquire_tailer_all("g", "q").unwrap();
        tailer.read().unwrap().unwrap();
        tailer.commit().unwrap(); // committed = 1
    }
    let appender = env.manager.appender("q").unwrap();
    for i in 1..6 {
        clock.set_ms(i * 2_000);
        appender.append(0, format!("cycle-{i}").as_bytes()).unwrap();
    }
    assert_eq!(appender.first_offset(0).unwrap(), 4);

    // The stale cursor resumes at the oldest retained record, not at an
    // offset that no longer exists.
    let mut tailer = env.manager.acquire_tailer_all("g", "q").unwrap();
    assert_eq!(
        tailer.read().unwrap().unwrap().payload.as_ref(),
        b"cycle-4"
    );

    // Lag never counts purged records the group can no longer consume.
    let lag = env.manager.lag("q", "g").unwrap();
    assert_eq!(lag.lag(), 2);
    assert_eq!(lag.total(), 2);
}

#[test]
fn test_retention_same_cycle_appends_share_a_segment() {
    let clock = ManualClock::new(0);
    let env = TestEnv::with_manual_clock("4s", clock.clone()).unwrap();
    env.manager.create("q", 1).unwrap();
    let appender = env.manager.appender("q").unwrap();

    for i in 0..10 {
        clock.set_ms(i * 50); // all within the first cycle
        appender.append(0, b"m").unwrap();
    }
    assert_eq!(appender.first_offset(0).unwrap(), 0);
    assert_eq!(appender.end_offset(0).unwrap(), 10);

    let mut tailer = env.manager.acquire_tailer_all("g", "q").unwrap();
    let mut count = 0;
    while tailer.read().unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 10);
}

#[test]
fn test_retention_reader_follows_across_roll() {
    let clock = ManualClock::new(0);
    let env = TestEnv::with_manual_clock("4s", clock.clone()).unwrap();
    env.manager.create("q", 1).unwrap();
    let appender = env.manager.appender("q").unwrap();
    let mut tailer = env.manager.acquire_tailer_all("g", "q").unwrap();

    appender.append(0, b"before").unwrap();
    assert_eq!(tailer.read().unwrap().unwrap().payload.as_ref(), b"before");
    assert!(tailer.read().unwrap().is_none());

    // Roll to a new segment while the reader is parked at the tail.
    clock.set_ms(4_000);
    appender.append(0, b"after").unwrap();
    let record = tailer.read().unwrap().unwrap();
    assert_eq!(record.payload.as_ref(), b"after");
    assert_eq!(record.offset.offset.get(), 1);
}
