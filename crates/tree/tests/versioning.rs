//! Version lifecycle: saving, loading, rolling back, overwriting.

use std::sync::Arc;
use verdant_storage::keys;
use verdant_storage_memory::MemoryDatabase;
use verdant_tree::{MutableTree, TreeError, TreeOptions};

fn new_tree() -> (Arc<MemoryDatabase>, MutableTree) {
    let db = Arc::new(MemoryDatabase::new());
    let mut tree = MutableTree::new(db.clone(), TreeOptions::default()).unwrap();
    tree.load().unwrap();
    (db, tree)
}

fn node_record_count(db: &MemoryDatabase) -> usize {
    db.snapshot()
        .keys()
        .filter(|k| k.first() == Some(&keys::NODE_PREFIX))
        .count()
}

#[test]
fn test_save_bumps_version_and_publishes() {
    let (_db, mut tree) = new_tree();
    tree.set(b"a", b"1").unwrap();

    let (hash, version) = tree.save_version().unwrap();
    assert_eq!(version, 1);
    assert!(hash.is_some());
    assert_eq!(tree.version(), 1);
    assert!(tree.version_exists(1));
    assert!(!tree.version_exists(2));
    assert_eq!(tree.available_versions(), vec![1]);

    // Saved and working hashes agree right after a save.
    assert_eq!(tree.hash().unwrap(), tree.working_hash().unwrap());
}

#[test]
fn test_idempotent_save() {
    let (db, mut tree) = new_tree();
    tree.set(b"a", b"1").unwrap();
    tree.set(b"b", b"2").unwrap();
    let (first_hash, v1) = tree.save_version().unwrap();

    let nodes_before = node_record_count(&db);

    // No intervening mutation: the next save writes a new version whose
    // root is the old one, creating no new node records.
    let (second_hash, v2) = tree.save_version().unwrap();
    assert_eq!(first_hash, second_hash);
    assert_eq!(v2, v1 + 1);
    assert_eq!(node_record_count(&db), nodes_before);

    // Both versions resolve to the same tree.
    assert_eq!(
        tree.get_immutable(v1).unwrap().hash().unwrap(),
        tree.get_immutable(v2).unwrap().hash().unwrap()
    );
}

#[test]
fn test_save_conflicting_version_fails() {
    let db = Arc::new(MemoryDatabase::new());
    let mut tree = MutableTree::new(db.clone(), TreeOptions::default()).unwrap();
    tree.load().unwrap();
    tree.set(b"a", b"1").unwrap();
    tree.save_version().unwrap();

    // A second tree over the same store, unaware of version 1, tries to
    // save different contents at version 1.
    let mut other = MutableTree::new(db, TreeOptions::default()).unwrap();
    other.set(b"x", b"9").unwrap();
    match other.save_version() {
        Err(TreeError::VersionAlreadyExists { version }) => assert_eq!(version, 1),
        other => panic!("expected VersionAlreadyExists, got {other:?}"),
    }
}

#[test]
fn test_save_same_tree_at_existing_version_is_noop() {
    let db = Arc::new(MemoryDatabase::new());
    let mut tree = MutableTree::new(db.clone(), TreeOptions::default()).unwrap();
    tree.load().unwrap();
    tree.set(b"a", b"1").unwrap();
    let (hash, _) = tree.save_version().unwrap();

    // A second tree replays the identical contents at version 1.
    let mut other = MutableTree::new(db, TreeOptions::default()).unwrap();
    other.set(b"a", b"1").unwrap();
    let (other_hash, version) = other.save_version().unwrap();
    assert_eq!(version, 1);
    assert_eq!(other_hash, hash);
    assert_eq!(other.version(), 1);
}

#[test]
fn test_rollback_restores_last_saved() {
    let (_db, mut tree) = new_tree();
    tree.set(b"a", b"1").unwrap();
    tree.set(b"b", b"2").unwrap();
    let (saved_hash, _) = tree.save_version().unwrap();

    tree.set(b"a", b"100").unwrap();
    tree.set(b"c", b"3").unwrap();
    tree.remove(b"b").unwrap();
    assert_ne!(tree.working_hash().unwrap(), saved_hash);

    tree.rollback();
    assert_eq!(tree.working_hash().unwrap(), saved_hash);
    assert_eq!(tree.hash().unwrap(), saved_hash);
    assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(tree.get(b"c").unwrap(), None);
}

#[test]
fn test_rollback_before_any_save_empties_tree() {
    let (_db, mut tree) = new_tree();
    tree.set(b"a", b"1").unwrap();
    tree.rollback();
    assert!(tree.is_empty());
    assert_eq!(tree.working_hash().unwrap(), None);
}

#[test]
fn test_multi_version_snapshots() {
    let (_db, mut tree) = new_tree();

    let mut snapshots = Vec::new();
    for i in 1..=1000u32 {
        let key = format!("key{i:04}");
        tree.set(key.as_bytes(), format!("value{i}").as_bytes())
            .unwrap();
        if i == 100 || i == 500 || i == 1000 {
            let (_, version) = tree.save_version().unwrap();
            snapshots.push((version, i));
        }
    }

    // Every snapshot holds exactly the keys inserted before it was taken.
    for &(version, upper) in &snapshots {
        let snapshot = tree.get_immutable(version).unwrap();
        assert_eq!(snapshot.size(), upper as u64);
        for i in 1..=1000u32 {
            let key = format!("key{i:04}");
            let got = snapshot.get(key.as_bytes()).unwrap();
            if i <= upper {
                assert_eq!(got, Some(format!("value{i}").into_bytes()), "key {i} at v{version}");
            } else {
                assert_eq!(got, None, "key {i} at v{version}");
            }
        }
        assert!(snapshot.check_invariants().unwrap().is_empty());
    }
}

#[test]
fn test_versioned_reads_match_snapshots() {
    let (_db, mut tree) = new_tree();
    tree.set(b"a", b"1").unwrap();
    tree.set(b"b", b"2").unwrap();
    tree.save_version().unwrap();

    tree.set(b"a", b"10").unwrap();
    tree.remove(b"b").unwrap();
    tree.set(b"c", b"3").unwrap();
    tree.save_version().unwrap();

    for version in [1u64, 2] {
        let snapshot = tree.get_immutable(version).unwrap();
        for key in [&b"a"[..], b"b", b"c", b"zz"] {
            assert_eq!(
                tree.get_versioned(key, version).unwrap(),
                snapshot.get(key).unwrap(),
                "key {key:?} at version {version}"
            );
        }
    }

    // Unknown versions read as absent.
    assert_eq!(tree.get_versioned(b"a", 99).unwrap(), None);
}

#[test]
fn test_load_version_roundtrip() {
    let db = Arc::new(MemoryDatabase::new());
    {
        let mut tree = MutableTree::new(db.clone(), TreeOptions::default()).unwrap();
        tree.load().unwrap();
        tree.set(b"a", b"1").unwrap();
        tree.save_version().unwrap();
        tree.set(b"b", b"2").unwrap();
        tree.save_version().unwrap();
    }

    // A fresh handle over the same store resumes at the latest version.
    let mut tree = MutableTree::new(db.clone(), TreeOptions::default()).unwrap();
    assert_eq!(tree.load().unwrap(), 2);
    assert_eq!(tree.version(), 2);
    assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));

    // Loading a specific older version works too.
    let mut old = MutableTree::new(db.clone(), TreeOptions::default()).unwrap();
    assert_eq!(old.load_version(1).unwrap(), 1);
    assert_eq!(old.get(b"b").unwrap(), None);

    // Loading a version that was never saved fails.
    let mut missing = MutableTree::new(db, TreeOptions::default()).unwrap();
    assert!(matches!(
        missing.load_version(9),
        Err(TreeError::TargetVersionUnavailable { target: 9, latest: 2 })
    ));
}

#[test]
fn test_lazy_load_version() {
    let db = Arc::new(MemoryDatabase::new());
    {
        let mut tree = MutableTree::new(db.clone(), TreeOptions::default()).unwrap();
        tree.load().unwrap();
        for v in 1..=3u8 {
            tree.set(&[b'k', v], &[v]).unwrap();
            tree.save_version().unwrap();
        }
    }

    let mut tree = MutableTree::new(db.clone(), TreeOptions::default()).unwrap();
    assert_eq!(tree.lazy_load_version(2).unwrap(), 2);
    assert_eq!(tree.get(&[b'k', 1]).unwrap(), Some(vec![1]));
    assert_eq!(tree.get(&[b'k', 3]).unwrap(), None);

    // Zero targets the latest.
    let mut latest = MutableTree::new(db.clone(), TreeOptions::default()).unwrap();
    assert_eq!(latest.lazy_load_version(0).unwrap(), 3);

    let mut missing = MutableTree::new(db, TreeOptions::default()).unwrap();
    assert!(missing.lazy_load_version(9).is_err());
}

#[test]
fn test_load_version_for_overwriting() {
    let db = Arc::new(MemoryDatabase::new());
    let mut tree = MutableTree::new(db.clone(), TreeOptions::default()).unwrap();
    tree.load().unwrap();
    for v in 1..=5u8 {
        tree.set(&[b'k', v], &[v]).unwrap();
        tree.save_version().unwrap();
    }

    assert_eq!(tree.load_version_for_overwriting(3).unwrap(), 3);
    assert_eq!(tree.version(), 3);
    assert_eq!(tree.available_versions(), vec![1, 2, 3]);
    assert!(!tree.version_exists(4));
    assert!(!tree.version_exists(5));
    assert!(tree.get_immutable(4).is_err());

    // Keys from truncated versions are gone in every read path.
    assert_eq!(tree.get(&[b'k', 4]).unwrap(), None);
    assert_eq!(tree.get_versioned(&[b'k', 4], 3).unwrap(), None);
    let keys: Vec<Vec<u8>> = tree
        .iter_range(None, None, true)
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(keys, vec![vec![b'k', 1], vec![b'k', 2], vec![b'k', 3]]);

    // The next save continues from the overwritten version.
    tree.set(b"new", b"x").unwrap();
    let (_, version) = tree.save_version().unwrap();
    assert_eq!(version, 4);
    assert_eq!(tree.get_immutable(4).unwrap().get(b"new").unwrap(), Some(b"x".to_vec()));
}

#[test]
fn test_initial_version() {
    let db = Arc::new(MemoryDatabase::new());
    let mut tree = MutableTree::new(
        db,
        TreeOptions {
            initial_version: 10,
            ..TreeOptions::default()
        },
    )
    .unwrap();
    tree.load().unwrap();

    tree.set(b"a", b"1").unwrap();
    let (_, version) = tree.save_version().unwrap();
    assert_eq!(version, 10);

    // Later saves increment normally.
    tree.set(b"b", b"2").unwrap();
    let (_, version) = tree.save_version().unwrap();
    assert_eq!(version, 11);
}

#[test]
fn test_set_initial_version_overrides_option() {
    let (_db, mut tree) = new_tree();
    tree.set_initial_version(7);
    tree.set(b"a", b"1").unwrap();
    let (_, version) = tree.save_version().unwrap();
    assert_eq!(version, 7);
}

#[test]
fn test_is_upgradeable() {
    let db = Arc::new(MemoryDatabase::new());
    let mut tree = MutableTree::new(db.clone(), TreeOptions::default()).unwrap();
    // Fresh store: never upgraded.
    assert!(tree.is_upgradeable().unwrap());
    tree.load().unwrap();
    // Load performed the upgrade.
    assert!(!tree.is_upgradeable().unwrap());

    // Opting out of fast storage is never upgradeable.
    let skipping = MutableTree::new(
        db,
        TreeOptions {
            skip_fast_storage_upgrade: true,
            ..TreeOptions::default()
        },
    )
    .unwrap();
    assert!(!skipping.is_upgradeable().unwrap());
}

#[test]
fn test_replay_determinism() {
    let run = || {
        let (_db, mut tree) = new_tree();
        for i in 0..50u8 {
            tree.set(&[b'k', i], &[i]).unwrap();
            if i % 7 == 0 {
                tree.save_version().unwrap();
            }
            if i % 3 == 0 {
                tree.remove(&[b'k', i / 2]).unwrap();
            }
        }
        tree.save_version().unwrap().0
    };

    assert_eq!(run(), run());
}

#[test]
fn test_orphans_tracked_and_cleared() {
    let (_db, mut tree) = new_tree();
    tree.set(b"a", b"1").unwrap();
    tree.set(b"b", b"2").unwrap();
    tree.save_version().unwrap();
    assert!(tree.orphans().is_empty());

    // Updating a persisted leaf orphans its old identity.
    tree.set(b"a", b"10").unwrap();
    assert_eq!(tree.orphans().len(), 1);

    // Removing a persisted leaf orphans it too.
    tree.remove(b"b").unwrap();
    assert_eq!(tree.orphans().len(), 2);

    tree.rollback();
    assert!(tree.orphans().is_empty());
}
