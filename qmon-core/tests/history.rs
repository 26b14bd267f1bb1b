use chrono::{Duration, Utc};
use qmon_core::{HistoryStore, Reading};
use tempfile::TempDir;

fn reading(offset: Duration, value: f64) -> Reading {
    Reading::new(Utc::now() - offset)
        .with_metric("uat.successRate", value)
        .with_system_stat("memoryMb", 256.0 + value)
}

#[test]
fn save_then_load_reproduces_series() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("monitoring/history.json");

    let store = HistoryStore::open(&path);
    assert!(store.is_empty());
    for i in 0..12 {
        store.append(reading(Duration::minutes(60 - i), i as f64 / 10.0));
    }
    store.save().unwrap();

    let reopened = HistoryStore::open(&path);
    assert_eq!(reopened.snapshot(), store.snapshot());
    let values: Vec<f64> = reopened
        .snapshot()
        .iter()
        .filter_map(|r| r.value("uat.successRate"))
        .collect();
    assert_eq!(values.len(), 12);
    assert!(values.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn missing_file_starts_empty() {
    let dir = TempDir::new().unwrap();
    let store = HistoryStore::open(dir.path().join("absent.json"));
    assert!(store.is_empty());
    assert!(store.latest().is_none());
}

#[test]
fn forty_readings_over_thirty_five_days_keep_last_thirty() {
    let now = Utc::now();
    let start = now - Duration::days(35);
    let step = Duration::days(35) / 39;
    let store = HistoryStore::in_memory();
    let mut timestamps = Vec::new();
    for i in 0..40 {
        let timestamp = start + step * i;
        timestamps.push(timestamp);
        store.append(Reading::new(timestamp).with_metric("uat.successRate", 0.8));
    }

    let cutoff = now - Duration::days(30);
    let expected = timestamps.iter().filter(|t| **t >= cutoff).count();
    let removed = store.prune(30, now);

    assert_eq!(removed, 40 - expected);
    assert_eq!(store.len(), expected);
    assert!(store
        .snapshot()
        .iter()
        .all(|r| now - r.timestamp <= Duration::days(30)));
}

#[test]
fn prune_removes_exactly_the_expired_readings() {
    let now = Utc::now();
    for (count, step_hours, retention) in [(1, 1, 1), (25, 13, 3), (100, 7, 10), (60, 48, 30)] {
        let store = HistoryStore::in_memory();
        let start = now - Duration::hours(step_hours * count);
        for i in 0..count {
            store.append(Reading::new(start + Duration::hours(step_hours * i)));
        }
        let before = store.snapshot();
        let bound = Duration::days(i64::from(retention));
        let within = before.iter().filter(|r| now - r.timestamp <= bound).count();

        store.prune(retention, now);
        let after = store.snapshot();

        assert_eq!(after.len(), within, "count={count} step={step_hours}h");
        assert!(after.iter().all(|r| now - r.timestamp <= bound));
        assert!(after.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
    }
}

#[test]
fn append_and_prune_are_safe_across_threads() {
    let store = std::sync::Arc::new(HistoryStore::in_memory());
    let now = Utc::now();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = std::sync::Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    store.append_and_prune(Reading::new(now), 30, now);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let series = store.snapshot();
    assert_eq!(series.len(), 200);
    assert!(series.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
}
