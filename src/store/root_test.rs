use super::*;

fn sample_descriptor() -> Descriptor {
    let mut descriptor = Descriptor::new("v1", "Item", "UUID");
    descriptor.add_direct_index(IndexDescriptor::new("title", "String", "v1"));
    descriptor
}

#[test]
fn test_root_fresh() {
    let root = DatastoreRoot::new_fresh(sample_descriptor());

    assert_eq!(root.primary_index_manifest.name, "Primary");
    assert_eq!(root.direct_index_manifests.len(), 1);
    assert_eq!(root.secondary_index_manifests.len(), 0);
    // primary + title, both with their manifests, all freshly added.
    assert_eq!(root.added_indexes.len(), 2);
    assert_eq!(root.added_index_manifests.len(), 2);
    assert!(root.removed_indexes.is_empty());

    let all = root.all_indexes();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].0, IndexKind::Primary);
    assert_eq!(all[1].0, IndexKind::Direct);
    assert_eq!(all[1].1.name, "title");
}

#[test]
fn test_root_json_roundtrip() {
    let root = DatastoreRoot::new_fresh(sample_descriptor());

    let data = serde_json::to_vec_pretty(&root).unwrap();
    let text = std::str::from_utf8(&data).unwrap();
    assert!(text.contains("\"modificationDate\""));
    assert!(text.contains("\"primaryIndexManifest\""));
    assert!(text.contains("\"directIndexManifests\""));
    assert!(text.contains("\"addedIndexes\""));

    let decoded: DatastoreRoot = serde_json::from_slice(&data).unwrap();
    assert_eq!(decoded.id, root.id);
    assert_eq!(decoded.descriptor, root.descriptor);
    assert_eq!(decoded.primary_index_manifest, root.primary_index_manifest);

    // persisted JSON may use the reference-index synonym for backward
    // compatibility.
    let aliased = text.replace("secondaryIndexManifests", "referenceIndexManifests");
    let decoded: DatastoreRoot = serde_json::from_slice(aliased.as_bytes()).unwrap();
    assert_eq!(
        decoded.secondary_index_manifests,
        root.secondary_index_manifests
    );
}

#[test]
fn test_root_apply_descriptor() {
    let root = DatastoreRoot::new_fresh(sample_descriptor());

    // same declaration, nothing to do.
    assert!(root.apply_descriptor(&sample_descriptor()).is_none());

    // add an `author` index, drop nothing.
    let mut declared = sample_descriptor();
    declared.add_direct_index(IndexDescriptor::new("author", "String", "v1"));
    let (next, changes) = root.apply_descriptor(&declared).unwrap();

    assert_ne!(next.id, root.id);
    assert_eq!(next.direct_index_manifests.len(), 2);
    assert_eq!(changes.len(), 1);
    match &changes[0] {
        IndexChange::Added { kind, info } => {
            assert_eq!(*kind, IndexKind::Direct);
            assert_eq!(info.name, "author");
            assert!(next.added_indexes.contains(&info.id));
            assert!(next.added_index_manifests.contains(&info.manifest));
        }
        _ => panic!("expected an added index"),
    }
    // the existing index is untouched.
    assert_eq!(next.direct_index_manifests[0], root.direct_index_manifests[0]);

    // dropping `title` from the declaration removes it.
    let declared = Descriptor::new("v1", "Item", "UUID");
    let (next, changes) = root.apply_descriptor(&declared).unwrap();
    assert!(next.direct_index_manifests.is_empty());
    assert_eq!(changes.len(), 1);
    match &changes[0] {
        IndexChange::Removed { info, .. } => {
            assert!(next.removed_indexes.contains(&info.id));
            assert!(next.removed_index_manifests.contains(&info.manifest));
        }
        _ => panic!("expected a removed index"),
    }
}

#[test]
fn test_root_apply_descriptor_preserves_versions() {
    let root = DatastoreRoot::new_fresh(sample_descriptor());

    // the declared version of an existing index is ignored, stored data
    // keeps its version until migrated.
    let mut declared = Descriptor::new("v2", "Item", "UUID");
    declared.add_direct_index(IndexDescriptor::new("title", "String", "v9"));
    let (next, changes) = root.apply_descriptor(&declared).unwrap();
    assert!(changes.is_empty());
    assert_eq!(next.descriptor.version, "v2");
    assert_eq!(next.descriptor.direct_indexes[0].version, "v1");
}

#[test]
fn test_root_replace_manifest_collapse() {
    let mut root = DatastoreRoot::new_fresh(sample_descriptor()).carried_forward();
    assert!(root.added_index_manifests.is_empty());

    let index_id = root.primary_index_manifest.id.clone();
    let old_manifest = root.primary_index_manifest.manifest.clone();

    let m1 = DatedId::generate();
    root.replace_manifest(&index_id, m1.clone()).unwrap();
    assert_eq!(root.primary_index_manifest.manifest, m1);
    assert_eq!(root.added_index_manifests, vec![m1.clone()]);
    assert_eq!(root.removed_index_manifests, vec![old_manifest.clone()]);

    // replacing again within the same iteration drops the intermediate id.
    let m2 = DatedId::generate();
    root.replace_manifest(&index_id, m2.clone()).unwrap();
    assert_eq!(root.added_index_manifests, vec![m2]);
    assert_eq!(root.removed_index_manifests, vec![old_manifest]);

    assert!(root.replace_manifest(&DatedId::generate(), DatedId::generate()).is_err());
}

#[test]
fn test_root_delete_index() {
    let mut root = DatastoreRoot::new_fresh(sample_descriptor()).carried_forward();

    let title_id = root.direct_index_manifests[0].id.clone();
    match root.delete_index(&title_id).unwrap() {
        IndexChange::Removed { kind, info } => {
            assert_eq!(kind, IndexKind::Direct);
            assert_eq!(info.id, title_id);
        }
        _ => panic!("expected removal"),
    }
    assert!(root.direct_index_manifests.is_empty());
    assert_eq!(root.removed_indexes, vec![title_id]);

    // deleting the primary replaces it with a fresh empty index.
    let primary_id = root.primary_index_manifest.id.clone();
    root.delete_index(&primary_id).unwrap();
    assert_ne!(root.primary_index_manifest.id, primary_id);
    assert!(root.removed_indexes.contains(&primary_id));
    assert!(root.added_indexes.contains(&root.primary_index_manifest.id));
}
