use rand::prelude::random;

use std::env;

use crate::snap::SnapshotKind;

use super::*;

fn iteration_at_age(age: time::Duration) -> SnapshotIteration {
    let mut iteration = SnapshotIteration::new_initial(None);
    iteration.creation_date = Utc::now()
        - chrono::Duration::from_std(age).unwrap();
    iteration
}

#[test]
fn test_policy_none_indefinite() {
    let it = iteration_at_age(time::Duration::from_secs(0));

    assert!(!RetentionPolicy::None.should_prune(&it, 0)); // never the current
    assert!(RetentionPolicy::None.should_prune(&it, 1));
    assert!(!RetentionPolicy::Indefinite.should_prune(&it, 1));
    assert!(!RetentionPolicy::Indefinite.should_prune(&it, 1000));
}

#[test]
fn test_policy_transaction_count() {
    let it = iteration_at_age(time::Duration::from_secs(0));
    let policy = RetentionPolicy::TransactionCount(3);

    for distance in 0..=3 {
        assert!(!policy.should_prune(&it, distance), "{}", distance);
    }
    assert!(policy.should_prune(&it, 4));
    assert!(policy.should_prune(&it, 100));
}

#[test]
fn test_policy_duration() {
    let policy = RetentionPolicy::Duration(time::Duration::from_secs(3600));

    let young = iteration_at_age(time::Duration::from_secs(60));
    let old = iteration_at_age(time::Duration::from_secs(7200));
    assert!(!policy.should_prune(&young, 5));
    assert!(policy.should_prune(&old, 5));
}

#[test]
fn test_policy_combinators() {
    let old = iteration_at_age(time::Duration::from_secs(7200));
    let hour = RetentionPolicy::Duration(time::Duration::from_secs(3600));
    let count = RetentionPolicy::TransactionCount(10);

    let both = RetentionPolicy::Both(Box::new(hour.clone()), Box::new(count.clone()));
    assert!(!both.should_prune(&old, 5)); // old enough, but within count
    assert!(both.should_prune(&old, 11));

    let either = RetentionPolicy::Either(Box::new(hour), Box::new(count));
    assert!(either.should_prune(&old, 5));
    assert!(!either.should_prune(&iteration_at_age(time::Duration::from_secs(1)), 5));
}

#[test]
fn test_sweep_trims_chain() {
    let root = {
        let mut dir = env::temp_dir();
        dir.push(format!("cowdb-sweep-{:x}", random::<u64>()));
        dir.push("Snapshots");
        dir.into_os_string()
    };
    let mut snapshot =
        Snapshot::create(&root, DatedId::generate(), SnapshotKind::Normal).unwrap();

    let mut iterations = vec![SnapshotIteration::new_initial(Some("initial"))];
    snapshot.commit_iteration(iterations[0].clone()).unwrap();
    for n in 1..10 {
        let next = snapshot
            .current_iteration()
            .unwrap()
            .unwrap()
            .successor(Some(&format!("txn-{}", n)));
        snapshot.commit_iteration(next.clone()).unwrap();
        iterations.push(next);
    }

    let policy = RetentionPolicy::TransactionCount(3);
    let stats = sweep(&mut snapshot, &policy, &HashSet::new()).unwrap();
    assert_eq!(stats.n_iterations, 6); // 10 on disk, 4 retained

    // the retained chain ends cleanly.
    let mut chain = vec![snapshot.current_iteration().unwrap().unwrap()];
    while let Some(prev_id) = chain.last().unwrap().preceding_iteration.clone() {
        chain.push(snapshot.load_iteration(&prev_id).unwrap());
    }
    assert_eq!(chain.len(), 4);
    assert_eq!(chain[3].id, iterations[6].id); // 7th from last retained
    assert!(chain[3].preceding_iteration.is_none());
    for n in 0..6 {
        assert!(snapshot.load_iteration(&iterations[n].id).is_err());
    }
    assert!(!snapshot.is_dirty());

    // a second sweep over the same state deletes nothing.
    let stats = sweep(&mut snapshot, &policy, &HashSet::new()).unwrap();
    assert!(stats.is_empty());

    // a pinned reader deep in history extends retention.
    std::fs::remove_dir_all(
        path::Path::new(&root).parent().unwrap(),
    )
    .unwrap();
}

#[test]
fn test_sweep_respects_pinned_readers() {
    let root = {
        let mut dir = env::temp_dir();
        dir.push(format!("cowdb-sweep-pin-{:x}", random::<u64>()));
        dir.push("Snapshots");
        dir.into_os_string()
    };
    let mut snapshot =
        Snapshot::create(&root, DatedId::generate(), SnapshotKind::Normal).unwrap();

    let mut iterations = vec![SnapshotIteration::new_initial(None)];
    snapshot.commit_iteration(iterations[0].clone()).unwrap();
    for _ in 1..8 {
        let next = snapshot.current_iteration().unwrap().unwrap().successor(None);
        snapshot.commit_iteration(next.clone()).unwrap();
        iterations.push(next);
    }

    // a reader is parked on the 2nd iteration (distance 6).
    let pinned: HashSet<DatedId> = [iterations[1].id.clone()].iter().cloned().collect();
    let policy = RetentionPolicy::TransactionCount(2);
    let stats = sweep(&mut snapshot, &policy, &pinned).unwrap();

    // only the initial iteration, behind the pinned one, was pruned.
    assert_eq!(stats.n_iterations, 1);
    assert!(snapshot.load_iteration(&iterations[1].id).is_ok());
    assert!(snapshot.load_iteration(&iterations[0].id).is_err());

    std::fs::remove_dir_all(path::Path::new(&root).parent().unwrap()).unwrap();
}
