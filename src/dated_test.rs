use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_dated_id_rawvalue() {
    let date = Utc.ymd(2024, 3, 7).and_hms(9, 5, 59);
    let id = DatedId::from_parts(date, 0x00AB_CDEF_0123_4567);

    let raw = id.to_string();
    assert_eq!(raw.len(), RAW_LEN);
    assert_eq!(raw, "2024-03-07 09-05-59 00ABCDEF01234567");

    let parsed: DatedId = raw.parse().unwrap();
    assert_eq!(parsed, id);
    assert_eq!(parsed.to_year(), 2024);
    assert_eq!(parsed.to_month_day(), (3, 7));
    assert_eq!(parsed.to_hour_minute(), (9, 5));
    assert_eq!(parsed.to_second(), 59);
    assert_eq!(parsed.to_token(), 0x00AB_CDEF_0123_4567);
    assert_eq!(
        parsed.to_dated_dirs(),
        ["2024".to_string(), "03-07".to_string(), "09-05".to_string()]
    );
}

#[test]
fn test_dated_id_ordering() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_dated_id_ordering {}", seed);

    let mut ids: Vec<DatedId> = (0..1000)
        .map(|_| {
            let secs: i64 = rng.gen_range(0..4_000_000_000);
            DatedId::from_parts(Utc.timestamp(secs, 0), rng.gen())
        })
        .collect();
    ids.sort();

    // lexicographic order of the rawvalue must equal the derived order.
    let mut raws: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    let sorted = raws.clone();
    raws.sort();
    assert_eq!(raws, sorted);

    for id in ids.into_iter() {
        let parsed: DatedId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}

#[test]
fn test_dated_id_reject() {
    assert!("2024-03-07 09-05-59".parse::<DatedId>().is_err());
    assert!("2024-03-07T09-05-59 00ABCDEF01234567".parse::<DatedId>().is_err());
    assert!("2024-13-07 09-05-59 00ABCDEF01234567".parse::<DatedId>().is_err());
    assert!("2024-03-07 09-05-61 00ABCDEF01234567".parse::<DatedId>().is_err());
    assert!("2024-03-07 09-05-59 00ABCDEF0123456Z".parse::<DatedId>().is_err());
}

#[test]
fn test_dated_id_generate() {
    let a = DatedId::generate();
    let b = DatedId::generate();
    assert_ne!(a, b); // tokens are 64-bit random
    assert_eq!(a.to_string().parse::<DatedId>().unwrap(), a);
}
