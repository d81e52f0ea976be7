use std::fs;
use std::thread;
use std::time::Duration;

use feedlease::clock::{ManualClock, Millis};
use feedlease::feed::file::FileFeed;
use feedlease::store::FileLeaseStore;
use feedlease::{
    ChangeEvent, ChangeFeed, Config, Error, Filter, LeaseRecord, LeaseStore, OperationKind,
    Renewal, Result, Shutdown, Subscription, worker,
};
use serde_json::json;
use tempfile::tempdir;

const NOW: Millis = 1_700_000_000_000;
const KEY: &str = "orders-worker";

fn config(host: &str) -> Config {
    Config::builder(KEY, host)
        .health_check_interval(Duration::from_millis(10))
        .lease_stale_interval(Duration::from_secs(185))
        .poll_interval(Duration::from_millis(2))
        .build()
        .expect("config")
}

/// Runs one worker "process" over `dir` until it has delivered `count`
/// orders. Every call opens fresh handles, as a restarted process would.
fn run_worker(dir: &std::path::Path, host: &str, clock: &ManualClock, count: usize) -> Vec<u64> {
    let feed = FileFeed::open(dir.join("orders")).expect("open feed");
    let store = FileLeaseStore::open_with_clock(dir.join("leases"), clock.clone()).expect("open store");
    let shutdown = Shutdown::new();
    let mut delivered = Vec::new();
    let mut handler = |event: &ChangeEvent| -> Result<()> {
        delivered.push(event.document["order"].as_u64().expect("order"));
        if delivered.len() == count {
            shutdown.trigger();
        }
        Ok(())
    };
    worker::run(&feed, &store.feed(), &store, &config(host), clock, &mut handler, &shutdown)
        .expect("worker");
    delivered
}

#[test]
fn lease_is_shared_between_handles() {
    let dir = tempdir().expect("tempdir");
    let a = FileLeaseStore::open(dir.path()).expect("open a");
    let b = FileLeaseStore::open(dir.path()).expect("open b");

    let created = a.create_if_absent(KEY, "hostA").expect("create");
    assert!(matches!(
        b.create_if_absent(KEY, "hostB"),
        Err(Error::AlreadyExists(_))
    ));
    assert_eq!(b.get(KEY).expect("get"), Some(created));
    assert_eq!(
        b.try_renew(KEY, "hostB", None).expect("renew"),
        Renewal::OwnershipLost {
            holder: "hostA".into()
        }
    );
}

#[test]
fn lease_mutations_reach_the_lease_feed() {
    let dir = tempdir().expect("tempdir");
    let clock = ManualClock::new(NOW);
    let store = FileLeaseStore::open_with_clock(dir.path(), clock.clone()).expect("open");
    store.create_if_absent(KEY, "hostA").expect("create");

    let filter = Filter::new().field_eq("ownerKey", KEY);
    let mut sub = store.feed().subscribe_from_now(&filter).expect("subscribe");
    assert_eq!(sub.try_next().expect("poll"), None);

    clock.advance(Duration::from_secs(5));
    store.try_renew(KEY, "hostA", None).expect("renew");
    let event = sub.try_next().expect("poll").expect("notification");
    assert_eq!(event.operation, OperationKind::Replace);
    let record: LeaseRecord = serde_json::from_value(event.document).expect("decode");
    assert_eq!(record.last_health_check_at, NOW + 5_000);
    sub.close();
}

#[test]
fn restarted_worker_resumes_from_the_durable_checkpoint() {
    let dir = tempdir().expect("tempdir");
    let clock = ManualClock::new(NOW);
    let orders = FileFeed::open(dir.path().join("orders")).expect("open feed");
    let events: Vec<ChangeEvent> = (1..=4)
        .map(|n| {
            orders
                .append(OperationKind::Insert, json!({ "order": n }))
                .expect("append")
        })
        .collect();

    assert_eq!(run_worker(dir.path(), "hostA", &clock, 2), vec![1, 2]);
    let store = FileLeaseStore::open(dir.path().join("leases")).expect("open store");
    let lease = store.get(KEY).expect("get").expect("lease");
    assert_eq!(lease.host_name, "hostA");
    assert_eq!(lease.resume_token.as_ref(), Some(&events[0].token));

    // hostA's process is gone; its lease goes stale and hostB takes over
    // from the token hostA stored, byte for byte.
    clock.advance(Duration::from_secs(200));
    assert_eq!(run_worker(dir.path(), "hostB", &clock, 3), vec![2, 3, 4]);
    let lease = store.get(KEY).expect("get").expect("lease");
    assert_eq!(lease.host_name, "hostB");
    assert_eq!(lease.resume_token.as_ref(), Some(&events[1].token));
}

#[test]
fn filtered_worker_skips_other_operations() {
    let dir = tempdir().expect("tempdir");
    let orders = FileFeed::open(dir.path()).expect("open feed");
    orders
        .append(OperationKind::Insert, json!({ "order": 1, "tier": "gold" }))
        .expect("append");
    orders
        .append(OperationKind::Update, json!({ "order": 2, "tier": "gold" }))
        .expect("append");
    orders
        .append(OperationKind::Insert, json!({ "order": 3, "tier": "basic" }))
        .expect("append");
    orders
        .append(OperationKind::Insert, json!({ "order": 4, "tier": "gold" }))
        .expect("append");

    let clock = ManualClock::new(NOW);
    let store = FileLeaseStore::open_with_clock(dir.path().join("leases"), clock.clone())
        .expect("open store");
    let config = Config::builder(KEY, "hostA")
        .filter(
            Filter::new()
                .operations([OperationKind::Insert])
                .field_eq("tier", "gold"),
        )
        .poll_interval(Duration::from_millis(2))
        .build()
        .expect("config");
    let shutdown = Shutdown::new();
    let mut delivered = Vec::new();
    let mut handler = |event: &ChangeEvent| -> Result<()> {
        delivered.push(event.document["order"].as_u64().expect("order"));
        if delivered.len() == 2 {
            shutdown.trigger();
        }
        Ok(())
    };
    worker::run(&orders, &store.feed(), &store, &config, &clock, &mut handler, &shutdown)
        .expect("worker");
    assert_eq!(delivered, vec![1, 4]);
}

#[test]
fn worker_waits_out_a_missing_change_log() {
    let dir = tempdir().expect("tempdir");
    let clock = ManualClock::new(NOW);
    let orders = FileFeed::open(dir.path().join("orders")).expect("open feed");
    fs::remove_file(orders.path()).expect("remove log");
    let store = FileLeaseStore::open_with_clock(dir.path().join("leases"), clock.clone())
        .expect("open store");
    let shutdown = Shutdown::new();
    let mut delivered = Vec::new();
    let mut handler = |event: &ChangeEvent| -> Result<()> {
        delivered.push(event.document["order"].as_u64().expect("order"));
        shutdown.trigger();
        Ok(())
    };

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(30));
            orders
                .append(OperationKind::Insert, json!({ "order": 1 }))
                .expect("append recreates the log");
        });
        worker::run(&orders, &store.feed(), &store, &config("hostA"), &clock, &mut handler, &shutdown)
            .expect("worker keeps running while the log is missing");
    });
    assert_eq!(delivered, vec![1]);
}
