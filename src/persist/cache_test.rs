use super::*;

#[test]
fn test_rolling_overwrite() {
    let mut cache: Rolling<u32> = Rolling::new(4);
    assert!(cache.is_empty());

    for i in 0..4 {
        cache.put(i);
    }
    assert_eq!(cache.len(), 4);
    for i in 0..4 {
        assert_eq!(cache.find(|v| *v == i), Some(&i));
    }

    // fifth insert rolls over slot 0.
    cache.put(4);
    assert_eq!(cache.len(), 4);
    assert_eq!(cache.find(|v| *v == 0), None);
    assert_eq!(cache.find(|v| *v == 4), Some(&4));

    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(cache.find(|_| true), None);
}

#[test]
fn test_caches_lookup() {
    use crate::store::Descriptor;

    let mut caches = Caches::default();

    let root = DatastoreRoot::new_fresh(Descriptor::new("v1", "Item", "UUID"));
    assert!(caches.find_root(&root.id).is_none());
    caches.put_root(root.clone());
    assert_eq!(caches.find_root(&root.id).unwrap().id, root.id);

    let manifest = IndexManifest::new_empty(DatedId::generate());
    caches.put_manifest(manifest.clone());
    assert!(caches.find_manifest(&manifest.to_id()).is_some());
    assert!(caches.find_manifest(&DatedId::generate()).is_none());

    let page = Page::new_fresh(DatedId::generate(), vec![]);
    caches.put_page(page.clone());
    assert!(caches.find_page(&page.to_id()).is_some());
}
