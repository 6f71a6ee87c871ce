use super::*;

fn ids(n: usize) -> Vec<DatedId> {
    let mut ids: Vec<DatedId> = (0..n).map(|_| DatedId::generate()).collect();
    ids.sort();
    ids
}

#[test]
fn test_manifest_codec() {
    let [a, b, c] = match ids(3).as_slice() {
        [a, b, c] => [a.clone(), b.clone(), c.clone()],
        _ => unreachable!(),
    };
    let manifest = IndexManifest::new(
        DatedId::generate(),
        vec![
            PageInfo::Existing(a.clone()),
            PageInfo::Added(b.clone()),
            PageInfo::Removed(c.clone()),
        ],
    );

    let data = manifest.encode();
    let text = std::str::from_utf8(&data).unwrap();
    assert!(text.starts_with("INDEX\n"));
    assert!(text.contains(&format!(" {}\n", a)));
    assert!(text.contains(&format!("+{}\n", b)));
    assert!(text.contains(&format!("-{}\n", c)));

    let decoded = IndexManifest::decode(manifest.to_id(), &data).unwrap();
    assert_eq!(decoded.encode(), data); // roundtrip produces identical bytes
    assert_eq!(
        decoded.ordered_page_ids().collect::<Vec<DatedId>>(),
        vec![a.clone(), b.clone()]
    );
    assert_eq!(decoded.added_page_ids().collect::<Vec<DatedId>>(), vec![b]);
    assert_eq!(decoded.removed_page_ids().collect::<Vec<DatedId>>(), vec![c]);
    assert_eq!(decoded.len_pages(), 2);
}

#[test]
fn test_manifest_decode_reject() {
    let id = DatedId::generate();
    assert!(IndexManifest::decode(id.clone(), b"").is_err());
    assert!(IndexManifest::decode(id.clone(), b"PAGES\n").is_err());
    assert!(IndexManifest::decode(id.clone(), b"INDEX\n*bogus\n").is_err());
    let line = format!("INDEX\n?{}\n", DatedId::generate());
    assert!(IndexManifest::decode(id, line.as_bytes()).is_err());
}

#[test]
fn test_manifest_carried_forward() {
    let [a, b, c] = match ids(3).as_slice() {
        [a, b, c] => [a.clone(), b.clone(), c.clone()],
        _ => unreachable!(),
    };
    let manifest = IndexManifest::new(
        DatedId::generate(),
        vec![
            PageInfo::Existing(a.clone()),
            PageInfo::Added(b.clone()),
            PageInfo::Removed(c),
        ],
    );

    let next = manifest.carried_forward(DatedId::generate());
    assert_ne!(next.to_id(), manifest.to_id());
    assert_eq!(next.added_page_ids().count(), 0);
    assert_eq!(next.removed_page_ids().count(), 0);
    assert_eq!(next.ordered_page_ids().collect::<Vec<DatedId>>(), vec![a, b]);
}

#[test]
fn test_manifest_replace_collapse() {
    let [a, b, c, d] = match ids(4).as_slice() {
        [a, b, c, d] => [a.clone(), b.clone(), c.clone(), d.clone()],
        _ => unreachable!(),
    };

    let mut manifest = IndexManifest::new(
        DatedId::generate(),
        vec![PageInfo::Existing(a.clone()), PageInfo::Existing(b.clone())],
    );

    // replacing an inherited page demotes it.
    manifest.replace_page(&a, &[c.clone()]).unwrap();
    assert_eq!(
        manifest.ordered_page_ids().collect::<Vec<DatedId>>(),
        vec![c.clone(), b.clone()]
    );
    assert_eq!(manifest.removed_page_ids().collect::<Vec<DatedId>>(), vec![a.clone()]);

    // replacing a page added within the same iteration collapses it out.
    manifest.replace_page(&c, &[d.clone()]).unwrap();
    assert_eq!(
        manifest.ordered_page_ids().collect::<Vec<DatedId>>(),
        vec![d.clone(), b.clone()]
    );
    assert_eq!(manifest.added_page_ids().collect::<Vec<DatedId>>(), vec![d.clone()]);
    assert_eq!(manifest.removed_page_ids().collect::<Vec<DatedId>>(), vec![a.clone()]);

    // removing pages, added ones vanish, inherited ones demote.
    manifest.remove_page(&d).unwrap();
    manifest.remove_page(&b).unwrap();
    assert_eq!(manifest.len_pages(), 0);
    assert_eq!(
        manifest.removed_page_ids().collect::<Vec<DatedId>>(),
        vec![a.clone(), b.clone()]
    );

    assert!(manifest.replace_page(&d, &[]).is_err());
}

#[test]
fn test_manifest_insert_and_reset() {
    let [a, b] = match ids(2).as_slice() {
        [a, b] => [a.clone(), b.clone()],
        _ => unreachable!(),
    };

    let mut manifest = IndexManifest::new_empty(DatedId::generate());
    assert!(manifest.is_empty());

    manifest.insert_page(0, a.clone());
    manifest.insert_page(1, b.clone());
    assert_eq!(
        manifest.ordered_page_ids().collect::<Vec<DatedId>>(),
        vec![a.clone(), b.clone()]
    );

    manifest.reset();
    assert!(manifest.is_empty());
    // added pages collapse, nothing to demote.
    assert_eq!(manifest.removed_page_ids().count(), 0);

    let mut manifest = IndexManifest::new(
        DatedId::generate(),
        vec![PageInfo::Existing(a.clone()), PageInfo::Existing(b.clone())],
    );
    manifest.reset();
    assert!(manifest.is_empty());
    assert_eq!(
        manifest.removed_page_ids().collect::<Vec<DatedId>>(),
        vec![a, b]
    );
}
