use prodqueue::{
    CreateOptions, Direction, Error, Product, ProductClass, ProductInfo, ProductQueue,
    QueueConfig, Signature, Step, Timestamp,
};
use tempfile::tempdir;

/// Fixed metadata bytes for a four-byte origin and an ident of at most
/// four bytes.
const METADATA_LEN: u64 = 52;

fn product(ident: &str, payload_len: usize) -> Product {
    let mut data = vec![0u8; payload_len];
    data[..ident.len()].copy_from_slice(ident.as_bytes());
    let info = ProductInfo {
        arrival: Timestamp::now(),
        signature: Signature::of(&data),
        origin: "test".to_string(),
        feedtype: 1,
        seqno: 0,
        ident: ident.to_string(),
        size: payload_len as u32,
    };
    Product::new(info, data).expect("product")
}

/// A queue that holds exactly four products of the returned payload size.
fn four_product_queue(path: &std::path::Path) -> (ProductQueue, usize) {
    let queue = ProductQueue::create(
        path,
        CreateOptions::new(4096, 16),
        QueueConfig::default().quiet(),
    )
    .expect("create");
    let data_size = queue.data_size().expect("data size");
    // Leaves room for the third split while the fourth takes the tail.
    let extent = ((data_size - 448) / 4) & !7;
    (queue, (extent - METADATA_LEN) as usize)
}

fn forward_idents(queue: &ProductQueue) -> Vec<String> {
    queue.set_cursor(Timestamp::ZERO).expect("cursor");
    let class = ProductClass::all();
    let mut idents = Vec::new();
    loop {
        let step = queue
            .sequence(Direction::Forward, &class, |p| {
                idents.push(p.info.ident.clone());
                true
            })
            .expect("sequence");
        if step == Step::End {
            break;
        }
    }
    idents
}

#[test]
fn fifth_product_evicts_the_oldest() {
    let dir = tempdir().expect("tempdir");
    let (queue, payload) = four_product_queue(&dir.path().join("evict.pq"));

    for ident in ["A", "B", "C", "D"] {
        queue.insert(&product(ident, payload)).expect("insert");
    }
    let stats = queue.stats().expect("stats");
    assert_eq!(stats.products, 4);
    assert_eq!(stats.max_free_extent, 0);
    assert!(!queue.is_full().expect("full"));

    queue.insert(&product("E", payload)).expect("insert E");
    assert_eq!(forward_idents(&queue), ["B", "C", "D", "E"]);
    assert!(queue.is_full().expect("full"));

    let residence = queue.min_virtual_residence().expect("mvrt");
    assert!(!residence.time.is_none());
    assert_eq!(residence.slots, 3);
}

#[test]
fn eviction_skips_a_held_product() {
    let dir = tempdir().expect("tempdir");
    let (queue, payload) = four_product_queue(&dir.path().join("held.pq"));
    for ident in ["A", "B", "C", "D"] {
        queue.insert(&product(ident, payload)).expect("insert");
    }

    let (step, held) = queue
        .sequence_lock(Direction::Forward, &ProductClass::all(), |p| {
            assert_eq!(p.info.ident, "A");
            true
        })
        .expect("sequence_lock");
    assert_eq!(step, Step::Delivered);
    let held = held.expect("held offset");

    queue.insert(&product("E", payload)).expect("insert E");
    queue.release(held).expect("release");
    assert!(matches!(queue.release(held), Err(Error::NotFound)));

    assert_eq!(forward_idents(&queue), ["A", "C", "D", "E"]);
}

#[test]
fn delete_oldest_until_empty() {
    let dir = tempdir().expect("tempdir");
    let (queue, payload) = four_product_queue(&dir.path().join("expire.pq"));
    for ident in ["A", "B"] {
        queue.insert(&product(ident, payload)).expect("insert");
    }
    queue.delete_oldest().expect("delete A");
    assert_eq!(forward_idents(&queue), ["B"]);
    queue.delete_oldest().expect("delete B");
    assert!(matches!(queue.delete_oldest(), Err(Error::NotFound)));

    let stats = queue.stats().expect("stats");
    assert_eq!(stats.products, 0);
    assert_eq!(stats.free_regions, 1);
    assert_eq!(stats.max_free_extent, queue.data_size().expect("size"));
}

#[test]
fn too_big_and_duplicate_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let (queue, payload) = four_product_queue(&dir.path().join("reject.pq"));
    let data_size = queue.data_size().expect("size") as usize;

    let err = queue.insert(&product("BIG", data_size)).expect_err("too big");
    assert!(matches!(err, Error::TooBig { .. }));

    let first = product("A", payload);
    queue.insert(&first).expect("insert");
    let mut twin = product("Z", payload);
    twin.info.signature = first.info.signature;
    assert!(matches!(queue.insert(&twin), Err(Error::Duplicate)));
    assert_eq!(queue.stats().expect("stats").products, 1);
}
