use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread;

use lowkeydb::{Engine, EngineConfig, IsolationLevel};

const RAND_SEED: u64 = 2021;
const N_RECORDS_LARGE: usize = 10_000;

fn open_engine(dir: &std::path::Path, name: &str) -> Engine {
    let path = dir.join(name);
    Engine::open(&path, EngineConfig::default()).unwrap()
}

#[test]
fn basic_put_update_delete_and_key_count() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path(), "basic.lkdb");

    engine.put(&v(b"1"), &v(b"one")).unwrap();
    engine.put(&v(b"2"), &v(b"two")).unwrap();
    engine.put(&v(b"3"), &v(b"three")).unwrap();
    assert_eq!(engine.key_count(), 3);
    assert_eq!(engine.get(&v(b"1")).unwrap(), Some(v(b"one")));

    engine.put(&v(b"2"), &v(b"two-two")).unwrap();
    assert_eq!(engine.get(&v(b"2")).unwrap(), Some(v(b"two-two")));
    assert_eq!(engine.key_count(), 3);

    assert!(engine.delete(&v(b"3")).unwrap());
    assert_eq!(engine.get(&v(b"3")).unwrap(), None);
    assert_eq!(engine.key_count(), 2);
    assert!(!engine.delete(&v(b"3")).unwrap());
}

#[test]
fn transaction_commit_and_abort_visibility() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path(), "tx.lkdb");

    let tx = engine.begin_tx(IsolationLevel::ReadCommitted).unwrap();
    engine.put_tx(tx, &v(b"a"), &v(b"committed")).unwrap();
    engine.commit_tx(tx).unwrap();
    assert_eq!(engine.get(&v(b"a")).unwrap(), Some(v(b"committed")));

    let tx = engine.begin_tx(IsolationLevel::ReadCommitted).unwrap();
    engine.put_tx(tx, &v(b"a"), &v(b"should-vanish")).unwrap();
    engine.put_tx(tx, &v(b"b"), &v(b"should-also-vanish")).unwrap();
    engine.abort_tx(tx).unwrap();
    assert_eq!(engine.get(&v(b"a")).unwrap(), Some(v(b"committed")));
    assert_eq!(engine.get(&v(b"b")).unwrap(), None);
}

#[test]
fn ten_thousand_keys_build_a_multi_level_tree_and_survive_even_odd_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path(), "large.lkdb");

    let mut rng = StdRng::seed_from_u64(RAND_SEED);
    let mut keys: Vec<u32> = (0..N_RECORDS_LARGE as u32).collect();
    // Insert out of order, as a real workload would.
    for i in (1..keys.len()).rev() {
        let j = rng.gen_range(0..=i);
        keys.swap(i, j);
    }
    for &k in &keys {
        engine.put(&k.to_be_bytes().to_vec(), &value_for(k)).unwrap();
    }
    assert_eq!(engine.key_count(), N_RECORDS_LARGE as u64);
    assert_eq!(engine.validate_structure().unwrap(), N_RECORDS_LARGE as u64);

    for k in 0..N_RECORDS_LARGE as u32 {
        if k % 2 == 0 {
            assert!(engine.delete(&k.to_be_bytes().to_vec()).unwrap());
        }
    }
    assert_eq!(engine.key_count(), (N_RECORDS_LARGE / 2) as u64);
    assert_eq!(engine.validate_structure().unwrap(), (N_RECORDS_LARGE / 2) as u64);
    for k in 0..N_RECORDS_LARGE as u32 {
        let expected = if k % 2 == 0 { None } else { Some(value_for(k)) };
        assert_eq!(engine.get(&k.to_be_bytes().to_vec()).unwrap(), expected);
    }
}

#[test]
fn four_threads_writing_concurrently_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(open_engine(dir.path(), "concurrent.lkdb"));
    const PER_THREAD: u32 = 500;

    let handles: Vec<_> = (0..4u32)
        .map(|thread_id| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let key = format!("t{thread_id}-{i:05}").into_bytes();
                    engine.put(&key, &i.to_be_bytes().to_vec()).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(engine.key_count(), (4 * PER_THREAD) as u64);
    assert_eq!(engine.validate_structure().unwrap(), (4 * PER_THREAD) as u64);
    for thread_id in 0..4u32 {
        for i in 0..PER_THREAD {
            let key = format!("t{thread_id}-{i:05}").into_bytes();
            assert_eq!(engine.get(&key).unwrap(), Some(i.to_be_bytes().to_vec()));
        }
    }
}

#[test]
fn crash_without_close_still_recovers_committed_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crash.lkdb");
    {
        let engine = Engine::open(&path, EngineConfig::default()).unwrap();
        for i in 0..50u32 {
            engine.put(&i.to_be_bytes().to_vec(), &value_for(i)).unwrap();
        }
        // Dropped here without calling close()/checkpoint(): the buffer
        // pool's dirty pages never reach disk, only the WAL's commit
        // records do.
    }
    let engine = Engine::open(&path, EngineConfig::default()).unwrap();
    assert_eq!(engine.checkpoint_stats().ops_replayed, 50);
    for i in 0..50u32 {
        assert_eq!(engine.get(&i.to_be_bytes().to_vec()).unwrap(), Some(value_for(i)));
    }
    assert_eq!(engine.validate_structure().unwrap(), 50);
}

#[test]
fn validate_structure_visits_the_whole_tree() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path(), "validate.lkdb");
    for i in 0..3_000u32 {
        engine.put(&i.to_be_bytes().to_vec(), &value_for(i)).unwrap();
    }
    assert_eq!(engine.validate_structure().unwrap(), engine.key_count());
}

fn value_for(k: u32) -> Vec<u8> {
    format!("value-{k}").into_bytes()
}

fn v(b: &[u8]) -> Vec<u8> {
    b.to_vec()
}
