#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gdpr_contracts::{FieldMap, RecordKey, Status, TableName, UnixSeconds};
use gdpr_dispatch::{
    AuditSink, AuditSinkRuntime, ConvergenceOutcome, DefaultConnector, DispatchConfig,
    DispatchError, OperationDispatcher,
};
use gdpr_storage::MemoryStore;
use parking_lot::Mutex;

fn device(id: i64) -> FieldMap {
    let mut f = FieldMap::new();
    f.insert("device_id".to_string(), id.to_string());
    f
}

fn ttl_client(
    store: &MemoryStore,
    max_wait: Option<Duration>,
) -> OperationDispatcher {
    let mut config = DispatchConfig::for_endpoints([store.endpoint()]).unwrap();
    config.ttl.poll_interval = Duration::from_millis(5);
    config.ttl.max_wait = max_wait;
    OperationDispatcher::init_with(
        config,
        &DefaultConnector::new().with_store(store.clone()),
        AuditSink::new(AuditSinkRuntime::Recording),
    )
    .unwrap()
}

#[test]
fn at_ttl_db_01_scripted_counts_converge_on_fourth_poll() {
    let store = MemoryStore::new("ttl01");
    let script = Mutex::new(VecDeque::from(vec![12u64, 9, 7, 5]));
    let oracle = move || -> Result<u64, DispatchError> { Ok(script.lock().pop_front().unwrap_or(0)) };
    let c = ttl_client(&store, None).with_live_count_oracle(Box::new(oracle));
    let out = c.verify_ttl(5);
    assert_eq!(out.status, Status::Ok);
    assert_eq!(
        out.value,
        Some(ConvergenceOutcome::Converged { polls: 4, observed: 5 })
    );
    let last = c.read_log(1);
    assert!(last[0].query.starts_with("VERIFY TTL"));
}

#[test]
fn at_ttl_db_02_blocks_until_sweep_expires_every_policy() {
    let store = MemoryStore::new("ttl02");
    let c = ttl_client(&store, Some(Duration::from_secs(10)));
    let ttl = UnixSeconds::now().saturating_add_secs(3_600);
    for i in 0..6 {
        let out = c.insert_with_expiry("usertable", &format!("o{i}"), &device(i), ttl);
        assert_eq!(out.combined(), Status::Ok);
    }
    assert_eq!(c.live_policy_count().unwrap(), 6);

    let sweeper_store = store.clone();
    let sweeper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        sweeper_store.expire_policies(
            &TableName::new("user_policy").unwrap(),
            &TableName::new("usertable").unwrap(),
            UnixSeconds(u64::MAX),
        )
    });
    let started = Instant::now();
    let out = c.verify_ttl(0);
    assert_eq!(sweeper.join().unwrap(), 6);
    assert_eq!(out.status, Status::Ok);
    assert!(out.value.unwrap().polls() > 1);
    assert!(started.elapsed() >= Duration::from_millis(50));

    // The sweep tombstones the governed data rows too.
    assert_eq!(c.read("usertable", "o0").status, Status::NotFound);
    assert!(store
        .record(&TableName::new("usertable").unwrap(), &RecordKey::new("o3").unwrap())
        .unwrap()
        .tombstone);
}

#[test]
fn at_ttl_db_03_bounded_wait_reports_error_with_last_count() {
    let store = MemoryStore::new("ttl03");
    let c = ttl_client(&store, Some(Duration::from_millis(40)));
    let ttl = UnixSeconds::now().saturating_add_secs(3_600);
    c.insert_with_expiry("usertable", "o1", &device(1), ttl);
    c.insert_with_expiry("usertable", "o2", &device(2), ttl);
    let out = c.verify_ttl(0);
    assert_eq!(out.status, Status::Error);
    match out.value.unwrap() {
        ConvergenceOutcome::TimedOut { last_observed, .. } => assert_eq!(last_observed, Some(2)),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn at_ttl_db_04_expired_ttl_is_not_live() {
    let store = MemoryStore::new("ttl04");
    let c = ttl_client(&store, None);
    let past = UnixSeconds(UnixSeconds::now().0.saturating_sub(1));
    let future = UnixSeconds::now().saturating_add_secs(600);
    c.insert_with_expiry("usertable", "o1", &device(1), past);
    c.insert_with_expiry("usertable", "o2", &device(2), future);
    c.insert_with_expiry("usertable", "o3", &device(3), future);
    assert_eq!(c.live_policy_count().unwrap(), 2);

    let out = c.verify_ttl(2);
    assert_eq!(
        out.value,
        Some(ConvergenceOutcome::Converged { polls: 1, observed: 2 })
    );
}

#[test]
fn at_ttl_db_05_injected_count_converges_across_threads() {
    let store = MemoryStore::new("ttl05");
    let live = Arc::new(Mutex::new(10u64));
    let reader = live.clone();
    let oracle = move || -> Result<u64, DispatchError> { Ok(*reader.lock()) };
    let c = ttl_client(&store, None).with_live_count_oracle(Box::new(oracle));
    let injector = thread::spawn(move || {
        for n in (0..10).rev() {
            thread::sleep(Duration::from_millis(3));
            *live.lock() = n;
        }
    });
    let out = c.verify_ttl(0);
    injector.join().unwrap();
    assert_eq!(out.status, Status::Ok);
    assert!(out.value.unwrap().is_converged());
}
