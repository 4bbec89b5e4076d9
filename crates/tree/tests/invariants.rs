//! Randomized model-based checks of the structural invariants.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use verdant_storage_memory::MemoryDatabase;
use verdant_tree::{MutableTree, TreeOptions};

fn new_tree() -> MutableTree {
    let db = Arc::new(MemoryDatabase::new());
    let mut tree = MutableTree::new(db, TreeOptions::default()).unwrap();
    tree.load().unwrap();
    tree
}

fn random_key(rng: &mut StdRng) -> Vec<u8> {
    // A small key space forces plenty of updates and removals of existing
    // keys, which is where the balancing edge cases live.
    format!("key{:03}", rng.gen_range(0..150u32)).into_bytes()
}

/// Drive the tree and a plain ordered map with the same operations, then
/// require them to agree everywhere while the tree stays balanced.
#[test]
fn test_random_ops_match_model() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut tree = new_tree();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for step in 0..2_000u32 {
        let key = random_key(&mut rng);
        match rng.gen_range(0..10u32) {
            // Mostly writes, some removals, occasional saves.
            0..=5 => {
                let value = format!("value{step}").into_bytes();
                let updated = tree.set(&key, &value).unwrap();
                let previous = model.insert(key.clone(), value);
                assert_eq!(updated, previous.is_some(), "update flag at step {step}");
            }
            6..=8 => {
                let removed = tree.remove(&key).unwrap();
                let expected = model.remove(&key);
                assert_eq!(removed, expected, "removal at step {step}");
            }
            _ => {
                tree.save_version().unwrap();
            }
        }

        if step % 250 == 0 {
            let msgs = tree.check_invariants().unwrap();
            assert!(msgs.is_empty(), "step {step}: {msgs:?}");
        }
    }

    // Point reads agree on every key ever touched.
    for i in 0..150u32 {
        let key = format!("key{i:03}").into_bytes();
        assert_eq!(tree.get(&key).unwrap(), model.get(&key).cloned(), "key {i}");
    }

    // Iteration agrees with the model's ordered contents.
    let entries: Vec<(Vec<u8>, Vec<u8>)> = tree
        .iter_range(None, None, true)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(entries, expected);

    assert_eq!(tree.size(), model.len() as u64);
    let msgs = tree.check_invariants().unwrap();
    assert!(msgs.is_empty(), "final: {msgs:?}");
}

/// Saved snapshots must stay intact while the working tree keeps moving.
#[test]
fn test_snapshots_are_stable_under_later_edits() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut tree = new_tree();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut saved: Vec<(u64, BTreeMap<Vec<u8>, Vec<u8>>)> = Vec::new();

    for round in 0..8u32 {
        for step in 0..100u32 {
            let key = random_key(&mut rng);
            if rng.gen_bool(0.75) {
                let value = format!("r{round}s{step}").into_bytes();
                tree.set(&key, &value).unwrap();
                model.insert(key, value);
            } else {
                tree.remove(&key).unwrap();
                model.remove(&key);
            }
        }
        let (_, version) = tree.save_version().unwrap();
        saved.push((version, model.clone()));
    }

    for (version, expected) in &saved {
        let snapshot = tree.get_immutable(*version).unwrap();
        assert_eq!(snapshot.size(), expected.len() as u64, "size at v{version}");

        let entries: Vec<(Vec<u8>, Vec<u8>)> = snapshot
            .iter_range(None, None, true)
            .map(|r| r.unwrap())
            .collect();
        let expected_entries: Vec<(Vec<u8>, Vec<u8>)> = expected
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        assert_eq!(entries, expected_entries, "contents at v{version}");

        assert!(snapshot.check_invariants().unwrap().is_empty());
    }
}

/// The same operations against a fast-index tree and a traversal-only tree
/// must be indistinguishable through the public surface.
#[test]
fn test_fast_index_transparency() {
    let mut rng = StdRng::seed_from_u64(7);

    let mut fast = new_tree();
    let slow_db = Arc::new(MemoryDatabase::new());
    let mut slow = MutableTree::new(
        slow_db,
        TreeOptions {
            skip_fast_storage_upgrade: true,
            ..TreeOptions::default()
        },
    )
    .unwrap();
    slow.load().unwrap();

    for _ in 0..600u32 {
        let key = random_key(&mut rng);
        match rng.gen_range(0..10u32) {
            0..=6 => {
                let value = format!("v{}", rng.gen::<u32>()).into_bytes();
                fast.set(&key, &value).unwrap();
                slow.set(&key, &value).unwrap();
            }
            7..=8 => {
                assert_eq!(fast.remove(&key).unwrap(), slow.remove(&key).unwrap());
            }
            _ => {
                let (fast_hash, fast_version) = fast.save_version().unwrap();
                let (slow_hash, slow_version) = slow.save_version().unwrap();
                assert_eq!(fast_hash, slow_hash);
                assert_eq!(fast_version, slow_version);
            }
        }
    }

    assert_eq!(fast.working_hash().unwrap(), slow.working_hash().unwrap());

    let fast_entries: Vec<(Vec<u8>, Vec<u8>)> = fast
        .iter_range(None, None, true)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    let slow_entries: Vec<(Vec<u8>, Vec<u8>)> = slow
        .iter_range(None, None, true)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(fast_entries, slow_entries);
}
