use rand::prelude::random;

use std::env;

use super::*;

fn scratch_root(name: &str) -> ffi::OsString {
    let mut dir = env::temp_dir();
    dir.push(format!("cowdb-{}-{:x}", name, random::<u64>()));
    dir.push("Snapshots");
    dir.into_os_string()
}

fn cleanup(root: &ffi::OsStr) {
    let parent = path::Path::new(root).parent().unwrap().to_path_buf();
    fs::remove_dir_all(parent).unwrap();
}

#[test]
fn test_snapshot_create_load() {
    let root = scratch_root("snap-create");
    let id = DatedId::generate();

    let snapshot = Snapshot::create(&root, id.clone(), SnapshotKind::Normal).unwrap();
    assert_eq!(snapshot.to_id(), id);
    assert!(snapshot.to_current_iteration_id().is_none());
    assert!(!snapshot.is_dirty());

    // the fixed skeleton exists.
    let dir = path::PathBuf::from(snapshot.as_dir());
    for sub in ["Iterations", "Datastores", "Inbox"].iter() {
        assert!(dir.join(sub).is_dir(), "{}", sub);
    }

    let copy = Snapshot::load(snapshot.as_dir(), SnapshotKind::Normal).unwrap();
    assert_eq!(copy.to_id(), id);

    cleanup(&root);
}

#[test]
fn test_snapshot_commit_chain() {
    let root = scratch_root("snap-chain");
    let mut snapshot =
        Snapshot::create(&root, DatedId::generate(), SnapshotKind::Normal).unwrap();

    let first = SnapshotIteration::new_initial(Some("initial"));
    snapshot.commit_iteration(first.clone()).unwrap();
    assert_eq!(snapshot.to_current_iteration_id(), Some(first.id.clone()));

    let second = first.successor(Some("second"));
    snapshot.commit_iteration(second.clone()).unwrap();

    // predecessor's successor list was rewritten in place.
    let stored_first = snapshot.load_iteration(&first.id).unwrap();
    assert_eq!(stored_first.successive_iterations, vec![second.id.clone()]);

    let current = snapshot.current_iteration().unwrap().unwrap();
    assert_eq!(current.id, second.id);
    assert_eq!(current.preceding_iteration, Some(first.id.clone()));

    // a reopened snapshot resolves the same chain.
    let mut copy = Snapshot::load(snapshot.as_dir(), SnapshotKind::Normal).unwrap();
    let current = copy.current_iteration().unwrap().unwrap();
    assert_eq!(current.id, second.id);

    cleanup(&root);
}

#[test]
fn test_snapshot_dirty_marker() {
    let root = scratch_root("snap-dirty");
    let snapshot =
        Snapshot::create(&root, DatedId::generate(), SnapshotKind::Normal).unwrap();

    snapshot.set_dirty(true).unwrap();
    assert!(snapshot.is_dirty());
    snapshot.set_dirty(false).unwrap();
    assert!(!snapshot.is_dirty());
    // clearing twice is fine.
    snapshot.set_dirty(false).unwrap();

    cleanup(&root);
}

#[test]
fn test_snapshot_nested_update() {
    let root = scratch_root("snap-nested");
    let mut snapshot =
        Snapshot::create(&root, DatedId::generate(), SnapshotKind::Normal).unwrap();

    let res = snapshot.update(|snapshot| {
        // nested reads are fine and see the in-memory copy.
        let id = snapshot.read(|s| Ok(s.to_id()))?;
        assert_eq!(id, snapshot.to_id());

        // but a nested update is a caller bug.
        match snapshot.update(|_| Ok(())) {
            Err(Error::NestedSnapshotWrite(_, _)) => Ok(()),
            Err(err) => Err(err),
            Ok(()) => err_at!(Fatal, msg: "nested update allowed"),
        }
    });
    res.unwrap();

    // guard is released afterwards.
    snapshot.update(|_| Ok(())).unwrap();

    cleanup(&root);
}

#[test]
fn test_snapshot_copy() {
    let backups = {
        let root = scratch_root("snap-copy");
        let mut loc = path::PathBuf::from(path::Path::new(&root).parent().unwrap());
        loc.push("Backups");
        loc.into_os_string()
    };
    let root = {
        let mut loc = path::PathBuf::from(path::Path::new(&backups).parent().unwrap());
        loc.push("Snapshots");
        loc.into_os_string()
    };

    let mut snapshot =
        Snapshot::create(&root, DatedId::generate(), SnapshotKind::Normal).unwrap();
    let first = SnapshotIteration::new_initial(Some("initial"));
    snapshot.commit_iteration(first.clone()).unwrap();

    let new_id = DatedId::generate();
    let mut backup = snapshot.copy_to(&backups, new_id.clone()).unwrap();
    assert_eq!(backup.to_id(), new_id);
    assert_eq!(backup.to_kind(), SnapshotKind::Backup);

    // the copied history is intact.
    let current = backup.current_iteration().unwrap().unwrap();
    assert_eq!(current.id, first.id);

    cleanup(&root);
}
