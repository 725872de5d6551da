use prodqueue::{
    CreateOptions, Error, Product, ProductInfo, ProductQueue, QueueConfig, QueueStats, Signature,
    Timestamp,
};
use tempfile::tempdir;

fn create(path: &std::path::Path) -> ProductQueue {
    ProductQueue::create(path, CreateOptions::new(32 * 1024, 32), QueueConfig::default().quiet())
        .expect("create")
}

fn info(ident: &str, payload: &[u8]) -> ProductInfo {
    ProductInfo {
        arrival: Timestamp::now(),
        signature: Signature::of(payload),
        origin: "reserver".to_string(),
        feedtype: 4,
        seqno: 12,
        ident: ident.to_string(),
        size: payload.len() as u32,
    }
}

fn current(stats: QueueStats) -> (u64, u64, u64, u64) {
    (stats.products, stats.free_regions, stats.empty_slots, stats.bytes)
}

#[test]
fn reserve_fill_finalize() {
    let dir = tempdir().expect("tempdir");
    let queue = create(&dir.path().join("reserve.pq"));
    let payload = vec![7u8; 301];
    let info = info("reserved", &payload);

    let mut reservation = queue.reserve(&info).expect("reserve");
    assert_eq!(reservation.signature(), info.signature);
    reservation.payload_mut()[..payload.len()].copy_from_slice(&payload);
    queue.finalize(reservation).expect("finalize");

    let (stored, data) = queue
        .process_by_signature(&info.signature, |p| (p.info.clone(), p.data.to_vec()))
        .expect("find");
    assert_eq!(stored, info);
    assert_eq!(data, payload);
    assert!(!queue.most_recent().expect("most recent").is_none());
}

#[test]
fn discard_and_drop_restore_the_allocator() {
    let dir = tempdir().expect("tempdir");
    let queue = create(&dir.path().join("discard.pq"));
    queue
        .insert(&Product::from_payload("keep", 1, 1, vec![1u8; 500]))
        .expect("insert");
    let before = current(queue.stats().expect("stats"));

    let payload = vec![2u8; 1000];
    let reservation = queue.reserve(&info("discarded", &payload)).expect("reserve");
    assert_eq!(queue.stats().expect("stats").products, before.0 + 1);
    queue.discard(reservation).expect("discard");
    assert_eq!(current(queue.stats().expect("stats")), before);

    let dropped = queue.reserve(&info("dropped", &payload)).expect("reserve");
    drop(dropped);
    assert_eq!(current(queue.stats().expect("stats")), before);
    assert!(matches!(
        queue.process_by_signature(&Signature::of(&payload), |_| ()),
        Err(Error::NotFound)
    ));
}

#[test]
fn raw_reservation_with_late_signature() {
    let dir = tempdir().expect("tempdir");
    let queue = create(&dir.path().join("raw.pq"));
    let product = Product::from_payload("late", 2, 3, b"signature computed after the write".to_vec());
    let provisional = Signature([0xee; 16]);

    let mut reservation = queue
        .reserve_raw(product.encoded_len(), provisional)
        .expect("reserve raw");
    product
        .encode_into(reservation.region_mut())
        .expect("encode");
    queue
        .finalize_with_signature(reservation, product.info.signature)
        .expect("finalize");

    assert!(matches!(
        queue.process_by_signature(&provisional, |_| ()),
        Err(Error::NotFound)
    ));
    let ident = queue
        .process_by_signature(&product.info.signature, |p| p.info.ident.clone())
        .expect("find");
    assert_eq!(ident, "late");

    // A second copy under the same real signature is a duplicate and is
    // freed.
    let before = current(queue.stats().expect("stats"));
    let mut again = queue
        .reserve_raw(product.encoded_len(), provisional)
        .expect("reserve raw");
    product.encode_into(again.region_mut()).expect("encode");
    assert!(matches!(
        queue.finalize_with_signature(again, product.info.signature),
        Err(Error::Duplicate)
    ));
    assert_eq!(current(queue.stats().expect("stats")), before);
}

#[test]
fn empty_payload_can_be_reserved() {
    let dir = tempdir().expect("tempdir");
    let queue = create(&dir.path().join("empty.pq"));
    let info = info("metadata only", &[]);
    let reservation = queue.reserve(&info).expect("reserve");
    queue.finalize(reservation).expect("finalize");
    let size = queue
        .process_by_signature(&info.signature, |p| p.data.len())
        .expect("find");
    assert_eq!(size, 0);

    assert!(matches!(
        queue.reserve_raw(0, Signature([0x33; 16])),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn finalize_rejects_unwritten_metadata() {
    let dir = tempdir().expect("tempdir");
    let queue = create(&dir.path().join("garbage.pq"));
    let before = current(queue.stats().expect("stats"));
    let mut reservation = queue
        .reserve_raw(64, Signature([0x11; 16]))
        .expect("reserve raw");
    // An origin length beyond the limit cannot decode.
    reservation.region_mut()[24..28].copy_from_slice(&0xffff_u32.to_be_bytes());
    assert!(matches!(queue.finalize(reservation), Err(Error::Corrupt(_))));
    assert_eq!(current(queue.stats().expect("stats")), before);
}
