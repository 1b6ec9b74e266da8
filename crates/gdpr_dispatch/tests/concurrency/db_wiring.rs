#![forbid(unsafe_code)]

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use gdpr_contracts::{FieldMap, RecordKey, Status, TableName, UnixSeconds};
use gdpr_dispatch::{
    AuditSink, AuditSinkRuntime, DefaultConnector, DispatchConfig, OperationDispatcher,
};
use gdpr_storage::MemoryStore;

const DATA: &str = "usertable";

fn device_fields(device: &str) -> FieldMap {
    let mut f = FieldMap::new();
    f.insert("shop_name".to_string(), "store 7".to_string());
    f.insert("device_id".to_string(), device.to_string());
    f
}

fn shared_client(
    stores: &[&MemoryStore],
    tweak: impl FnOnce(&mut DispatchConfig),
) -> Arc<OperationDispatcher> {
    let mut connector = DefaultConnector::new();
    for store in stores {
        connector = connector.with_store((*store).clone());
    }
    let mut config =
        DispatchConfig::for_endpoints(stores.iter().map(|s| s.endpoint())).unwrap();
    tweak(&mut config);
    Arc::new(
        OperationDispatcher::init_with(
            config,
            &connector,
            AuditSink::new(AuditSinkRuntime::Recording),
        )
        .unwrap(),
    )
}

fn run_writers(client: &Arc<OperationDispatcher>, threads: usize, per_thread: usize) -> Vec<Status> {
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let client = client.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (0..per_thread)
                    .map(|i| client.insert(DATA, &format!("t{t}-o{i}"), &device_fields("7")))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect()
}

#[test]
fn at_concurrency_db_01_batch_api_flushes_exactly_on_boundaries() {
    let store = MemoryStore::new("cc01");
    let client = shared_client(&[&store], |cfg| {
        cfg.batch_size = 50;
        cfg.batch_update_api = true;
        cfg.auto_commit = false;
    });
    let statuses = run_writers(&client, 2, 100);
    assert_eq!(statuses.len(), 200);
    assert!(statuses.iter().all(|s| s.is_ok()));
    assert_eq!(
        statuses.iter().filter(|s| **s == Status::BatchedOk).count(),
        196
    );

    assert_eq!(client.batch().writes_recorded(), 200);
    assert_eq!(client.batch().flush_count(), 4);
    assert_eq!(client.batch().writes_since_boundary(), 0);
    assert_eq!(store.record_count(&TableName::new(DATA).unwrap()), 200);
    assert_eq!(store.stats().commits, 4);
    assert_eq!(store.stats().uncommitted_writes, 0);
}

#[test]
fn at_concurrency_db_02_plain_path_counts_writes_across_threads() {
    let store = MemoryStore::new("cc02");
    let client = shared_client(&[&store], |cfg| {
        cfg.batch_size = 50;
        cfg.auto_commit = false;
    });
    let statuses = run_writers(&client, 2, 100);
    assert!(statuses.iter().all(|s| *s == Status::Ok));
    assert_eq!(client.batch().writes_recorded(), 200);
    assert_eq!(client.batch().flush_count(), 4);
    assert_eq!(store.record_count(&TableName::new(DATA).unwrap()), 200);
    assert!(store.stats().commits >= 4);
    assert_eq!(client.cache().len(), 1);
}

#[test]
fn at_concurrency_db_03_racing_first_use_builds_one_operation() {
    let store = MemoryStore::new("cc03");
    let client = shared_client(&[&store], |_| {});
    assert_eq!(client.insert(DATA, "o1", &device_fields("1")), Status::Ok);
    // Slow prepares widen the window in which several threads miss the cache.
    store.set_prepare_delay(Some(Duration::from_millis(20)));

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let client = client.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                client.read(DATA, "o1").status
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), Status::Ok);
    }
    assert_eq!(client.cache().len(), 2);
    let stats = store.stats();
    assert_eq!(
        stats.statements_prepared - stats.statements_released,
        client.cache().len() as u64
    );
}

#[test]
fn at_concurrency_db_04_mixed_workload_over_shards() {
    let s0 = MemoryStore::new("cc04a");
    let s1 = MemoryStore::new("cc04b");
    let s2 = MemoryStore::new("cc04c");
    let client = shared_client(&[&s0, &s1, &s2], |_| {});
    let ttl = UnixSeconds::now().saturating_add_secs(600);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let client = client.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    let key = format!("t{t}-o{i}");
                    let out = client.insert_with_expiry(DATA, &key, &device_fields(&t.to_string()), ttl);
                    assert_eq!(out.combined(), Status::Ok);
                    assert_eq!(client.read(DATA, &key).status, Status::Ok);
                    if i % 5 == 0 {
                        assert_eq!(client.delete(DATA, &key), Status::Ok);
                        assert_eq!(client.read(DATA, &key).status, Status::NotFound);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let table = TableName::new(DATA).unwrap();
    let policies = TableName::new("user_policy").unwrap();
    let total: usize = [&s0, &s1, &s2].iter().map(|s| s.record_count(&table)).sum();
    assert_eq!(total, 100);
    assert_eq!(client.live_policy_count().unwrap(), 100);

    for t in 0..4 {
        for i in 0..25 {
            let key = format!("t{t}-o{i}");
            let home = client.router().shard_index(&key);
            let stores = [&s0, &s1, &s2];
            let row = stores[home].record(&table, &RecordKey::new(&key).unwrap());
            assert!(row.is_some(), "{key} missing from shard {home}");
            assert_eq!(row.unwrap().tombstone, i % 5 == 0);
            assert!(stores[home].policy_count(&policies) > 0);
        }
    }
}

#[test]
fn at_concurrency_db_05_cleanup_releases_every_statement() {
    let s0 = MemoryStore::new("cc05a");
    let s1 = MemoryStore::new("cc05b");
    let client = shared_client(&[&s0, &s1], |cfg| {
        cfg.batch_size = 7;
        cfg.batch_update_api = true;
    });
    run_writers(&client, 3, 10);
    client.cleanup().unwrap();
    let table = TableName::new(DATA).unwrap();
    assert_eq!(s0.record_count(&table) + s1.record_count(&table), 30);
    for store in [&s0, &s1] {
        let stats = store.stats();
        assert_eq!(stats.open_statements(), 0);
        assert_eq!(stats.connections_closed, stats.connections_opened);
    }
    assert_eq!(client.insert(DATA, "late", &device_fields("1")), Status::Error);
}

#[test]
fn at_concurrency_db_06_cleanup_racing_writers_keeps_every_accepted_row() {
    let s0 = MemoryStore::new("cc06a");
    let s1 = MemoryStore::new("cc06b");
    let client = shared_client(&[&s0, &s1], |cfg| {
        cfg.batch_size = 1_000;
        cfg.batch_update_api = true;
    });
    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads + 1));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let client = client.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (0..300)
                    .map(|i| {
                        let key = format!("t{t}-o{i}");
                        let status = client.insert(DATA, &key, &device_fields("7"));
                        (key, status)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    barrier.wait();
    thread::sleep(Duration::from_millis(2));
    client.cleanup().unwrap();

    let table = TableName::new(DATA).unwrap();
    let mut accepted = 0;
    for (key, status) in handles.into_iter().flat_map(|h| h.join().unwrap()) {
        let key = RecordKey::new(key).unwrap();
        let stored = s0.record(&table, &key).is_some() || s1.record(&table, &key).is_some();
        match status {
            Status::BatchedOk | Status::Ok => {
                accepted += 1;
                assert!(stored, "{key} was accepted but not stored");
            }
            Status::Error => assert!(!stored, "{key} was refused but stored"),
            other => panic!("unexpected status {other:?} for {key}"),
        }
    }
    assert_eq!(s0.record_count(&table) + s1.record_count(&table), accepted);
}
