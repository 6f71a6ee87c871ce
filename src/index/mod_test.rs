use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{env, fs, path};

use super::*;

fn scratch_index_dir(name: &str) -> ffi::OsString {
    let mut dir = env::temp_dir();
    dir.push(format!("cowdb-{}-{:x}", name, random::<u64>()));
    dir.push("Primary.datastoreindex");
    dir.into_os_string()
}

fn empty_primary(dir: &ffi::OsStr) -> Index {
    Index::new_empty(
        IndexKind::Primary,
        "Primary",
        DatedId::generate(),
        KeyOrder::Lexicographic,
        DatedId::generate(),
        dir.to_os_string(),
    )
}

fn insert_primary(ix: &mut Index, id: &[u8], content: &[u8], page_size: usize) {
    let key = EntryKey::primary(id);
    let at = match ix.lookup(&key).unwrap() {
        Lookup::NotFound { at } => at,
        Lookup::Found { .. } => panic!("duplicate {:?}", id),
    };
    let entry = Entry::new_primary(b"v1", id, content.to_vec());
    ix.insert(&at, &entry, page_size).unwrap();
}

fn collect_ids(ix: &mut Index) -> Vec<Vec<u8>> {
    ix.scan(Bound::Unbounded, Bound::Unbounded, false)
        .unwrap()
        .map(|item| item.unwrap().0.identifier)
        .collect()
}

#[test]
fn test_key_order_uuid() {
    let a = 0x0000_0000_0000_0000_0000_0000_0000_00FF_u128.to_be_bytes();
    let b = 0x0000_0000_0000_0000_0000_0000_0000_0100_u128.to_be_bytes();
    assert_eq!(KeyOrder::Uuid.compare(&a, &b), cmp::Ordering::Less);

    // textual uuids compare numerically, not as text.
    let x = b"00000000-0000-0000-0000-0000000000ff";
    let y = b"00000000-0000-0000-0000-000000000100";
    assert_eq!(KeyOrder::Uuid.compare(x, y), cmp::Ordering::Less);
    assert_eq!(KeyOrder::Lexicographic.compare(x, y), cmp::Ordering::Greater);
}

#[test]
fn test_entry_key_compare() {
    let a = EntryKey::secondary(b"alpha", b"2");
    let b = EntryKey::secondary(b"alpha", b"10");
    let c = EntryKey::secondary(b"beta", b"1");

    // ties on the value break on identifier, under the declared order.
    assert_eq!(a.compare(&b, KeyOrder::Lexicographic), cmp::Ordering::Greater);
    assert_eq!(a.compare(&c, KeyOrder::Lexicographic), cmp::Ordering::Less);
    assert_eq!(
        entry_key(IndexKind::Direct, &Entry::new_direct(b"v1", b"alpha", b"2", vec![]))
            .unwrap(),
        a
    );
    assert_eq!(
        entry_key(IndexKind::Reference, &Entry::new_reference(b"alpha", b"2")).unwrap(),
        a
    );
}

#[test]
fn test_index_sorted_pages() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_index_sorted_pages {}", seed);

    let dir = scratch_index_dir("index-sorted");
    let mut ix = empty_primary(&dir);
    let page_size = 512; // small, to force plenty of splits

    let mut ids: Vec<Vec<u8>> = (0..500_u32)
        .map(|i| format!("{:08}", i).into_bytes())
        .collect();
    // insert in random order.
    for i in (1..ids.len()).rev() {
        ids.swap(i, rng.gen_range(0..=i));
    }
    for id in ids.iter() {
        let content: Vec<u8> = (0..rng.gen_range(0..64)).map(|_| rng.gen()).collect();
        insert_primary(&mut ix, id, &content, page_size);
    }

    ids.sort();
    assert_eq!(collect_ids(&mut ix), ids);
    assert!(ix.as_manifest().len_pages() > 1);

    // every live page fits the target size.
    for id in ix.as_manifest().ordered_page_ids().collect::<Vec<DatedId>>() {
        let page = ix.page(&id);
        assert!(page.encoded_len().unwrap() <= page_size);
    }

    // each key is found again.
    for id in ids.iter() {
        match ix.lookup(&EntryKey::primary(id)).unwrap() {
            Lookup::Found { entry, .. } => {
                assert_eq!(entry.as_header(1).unwrap(), id.as_slice())
            }
            Lookup::NotFound { .. } => panic!("missing {:?}", id),
        }
    }
    match ix.lookup(&EntryKey::primary(b"99999999")).unwrap() {
        Lookup::Found { .. } => panic!("phantom entry"),
        Lookup::NotFound { .. } => (),
    }

    fs::remove_dir_all(path::Path::new(&dir).parent().unwrap()).unwrap();
}

#[test]
fn test_index_entry_spanning_pages() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_index_entry_spanning_pages {}", seed);

    let dir = scratch_index_dir("index-span");
    let mut ix = empty_primary(&dir);
    let page_size = 256;

    // an entry several times the page size must span pages.
    let big: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();
    insert_primary(&mut ix, b"m-big", &big, page_size);
    insert_primary(&mut ix, b"a-small", b"left", page_size);
    insert_primary(&mut ix, b"z-small", b"right", page_size);

    assert!(ix.as_manifest().len_pages() > 4096 / page_size);
    assert_eq!(
        collect_ids(&mut ix),
        vec![b"a-small".to_vec(), b"m-big".to_vec(), b"z-small".to_vec()]
    );

    match ix.lookup(&EntryKey::primary(b"m-big")).unwrap() {
        Lookup::Found { path, entry } => {
            assert!(path.len() > 1); // multiple blocks
            assert_eq!(entry.as_content(), big.as_slice());

            // deleting the spanning entry leaves the neighbors intact.
            ix.remove(&path, page_size).unwrap();
            assert_eq!(
                collect_ids(&mut ix),
                vec![b"a-small".to_vec(), b"z-small".to_vec()]
            );
        }
        Lookup::NotFound { .. } => panic!("missing spanning entry"),
    }

    fs::remove_dir_all(path::Path::new(&dir).parent().unwrap()).unwrap();
}

#[test]
fn test_index_remove_and_reset() {
    let dir = scratch_index_dir("index-remove");
    let mut ix = empty_primary(&dir);
    let page_size = 4096;

    for id in ["a", "b", "c"].iter() {
        insert_primary(&mut ix, id.as_bytes(), b"x", page_size);
    }

    for id in ["a", "b", "c"].iter() {
        let path = match ix.lookup(&EntryKey::primary(id.as_bytes())).unwrap() {
            Lookup::Found { path, .. } => path,
            Lookup::NotFound { .. } => panic!("missing {}", id),
        };
        let removed = ix.remove(&path, page_size).unwrap();
        assert_eq!(removed.as_header(1).unwrap(), id.as_bytes());
    }

    // deleting the last entry dropped the page without replacement.
    assert_eq!(ix.as_manifest().len_pages(), 0);

    insert_primary(&mut ix, b"d", b"x", page_size);
    ix.reset();
    assert_eq!(ix.as_manifest().len_pages(), 0);
    assert_eq!(collect_ids(&mut ix), Vec::<Vec<u8>>::new());

    fs::remove_dir_all(path::Path::new(&dir).parent().unwrap()).unwrap();
}

#[test]
fn test_index_persist_and_reload() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_index_persist_and_reload {}", seed);

    let dir = scratch_index_dir("index-persist");
    let mut ix = empty_primary(&dir);
    let page_size = 512;

    let ids: Vec<Vec<u8>> = (0..200_u32).map(|i| format!("{:06}", i).into_bytes()).collect();
    for id in ids.iter() {
        let content: Vec<u8> = (0..rng.gen_range(0..64)).map(|_| rng.gen()).collect();
        insert_primary(&mut ix, id, &content, page_size);
    }

    let manifest_id = ix.persist_if_needed().unwrap().unwrap();
    assert!(!ix.is_dirty());
    assert!(ix.persist_if_needed().unwrap().is_none());

    // reload from disk and compare.
    let location = manifest::to_manifest_location(&dir, &manifest_id);
    let data = fs::read(path::Path::new(&location)).unwrap();
    let manifest = IndexManifest::decode(manifest_id, &data).unwrap();
    assert_eq!(manifest.encode(), data);

    let mut copy = Index::loaded(
        IndexKind::Primary,
        "Primary",
        ix.to_id(),
        KeyOrder::Lexicographic,
        manifest,
        dir.clone(),
        HashMap::new(),
    );
    assert_eq!(collect_ids(&mut copy), ids);

    fs::remove_dir_all(path::Path::new(&dir).parent().unwrap()).unwrap();
}

#[test]
fn test_index_range_scans() {
    let dir = scratch_index_dir("index-scan");
    let mut ix = Index::new_empty(
        IndexKind::Direct,
        "title",
        DatedId::generate(),
        KeyOrder::Lexicographic,
        DatedId::generate(),
        dir.clone(),
    );
    let page_size = 4096;

    for (id, title) in [("1", "A"), ("2", "B"), ("3", "C"), ("4", "D")].iter() {
        let key = EntryKey::secondary(title.as_bytes(), id.as_bytes());
        let at = match ix.lookup(&key).unwrap() {
            Lookup::NotFound { at } => at,
            Lookup::Found { .. } => panic!("duplicate"),
        };
        let entry =
            Entry::new_direct(b"v1", title.as_bytes(), id.as_bytes(), title.as_bytes().to_vec());
        ix.insert(&at, &entry, page_size).unwrap();
    }

    let titles = |scan: Scan| -> Vec<Vec<u8>> {
        scan.map(|item| item.unwrap().0.value.unwrap()).collect()
    };

    // ["B" ..< "D"] ascending.
    let scan = ix
        .scan(
            Bound::Included(b"B".to_vec()),
            Bound::Excluded(b"D".to_vec()),
            false,
        )
        .unwrap();
    assert_eq!(titles(scan), vec![b"B".to_vec(), b"C".to_vec()]);

    // full extent descending.
    let scan = ix.scan(Bound::Unbounded, Bound::Unbounded, true).unwrap();
    assert_eq!(
        titles(scan),
        vec![b"D".to_vec(), b"C".to_vec(), b"B".to_vec(), b"A".to_vec()]
    );

    // (`A` ..= `C`] descending.
    let scan = ix
        .scan(
            Bound::Excluded(b"A".to_vec()),
            Bound::Included(b"C".to_vec()),
            true,
        )
        .unwrap();
    assert_eq!(titles(scan), vec![b"C".to_vec(), b"B".to_vec()]);

    fs::remove_dir_all(path::Path::new(&dir).parent().unwrap()).unwrap();
}
