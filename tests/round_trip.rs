use std::sync::Arc;

use prodqueue::product::decode;
use prodqueue::{
    Clock, CreateOptions, Direction, Error, Product, ProductClass, ProductQueue, QueueConfig,
    Step, Timestamp,
};
use tempfile::tempdir;

#[derive(Debug)]
struct FrozenClock(Timestamp);

impl Clock for FrozenClock {
    fn now(&self) -> Timestamp {
        self.0
    }
}

fn create(path: &std::path::Path, config: QueueConfig) -> ProductQueue {
    ProductQueue::create(path, CreateOptions::new(64 * 1024, 64), config.quiet()).expect("create")
}

#[test]
fn insert_then_find_by_signature_and_sequence() {
    let dir = tempdir().expect("tempdir");
    let queue = create(&dir.path().join("rt.pq"), QueueConfig::default());
    let product = Product::from_payload("WMO SAUS42 KWBC", 0x10, 77, b"surface observations".to_vec());
    queue.insert(&product).expect("insert");

    let (info, data, encoded_len) = queue
        .process_by_signature(&product.info.signature, |p| {
            (p.info.clone(), p.data.to_vec(), p.encoded.len())
        })
        .expect("by signature");
    assert_eq!(info, product.info);
    assert_eq!(data, product.data);
    assert_eq!(encoded_len, product.encoded_len());

    let mut seen = None;
    let step = queue
        .sequence(Direction::Forward, &ProductClass::all(), |p| {
            let (decoded, payload) = decode(p.encoded).expect("decode stored bytes");
            assert_eq!(payload, p.data);
            seen = Some(decoded);
            true
        })
        .expect("sequence");
    assert_eq!(step, Step::Delivered);
    assert_eq!(seen.as_ref(), Some(&product.info));
    assert_eq!(
        queue.most_recent().expect("most recent"),
        queue.cursor().expect("cursor").time
    );
    assert_eq!(
        queue
            .sequence(Direction::Forward, &ProductClass::all(), |_| true)
            .expect("sequence"),
        Step::End
    );
}

#[test]
fn products_survive_reopen() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("reopen.pq");
    let products: Vec<_> = (0..10u32)
        .map(|n| Product::from_payload(format!("item/{n}"), 1, n, vec![n as u8; 100 + n as usize]))
        .collect();
    {
        let queue = create(&path, QueueConfig::default());
        for product in &products {
            queue.insert(product).expect("insert");
        }
        queue.close().expect("close");
    }

    let queue = ProductQueue::open(&path, QueueConfig::read_only()).expect("open");
    let mut seqnos = Vec::new();
    while queue
        .sequence(Direction::Forward, &ProductClass::all(), |p| {
            seqnos.push(p.info.seqno);
            true
        })
        .expect("sequence")
        != Step::End
    {}
    assert_eq!(seqnos, (0..10).collect::<Vec<_>>());
    assert_eq!(queue.check().expect("check"), 10);
    assert!(matches!(queue.insert(&products[0]), Err(Error::ReadOnly)));

    let (highwater, max_products) = queue.highwater().expect("highwater");
    assert_eq!(max_products, 10);
    assert!(highwater >= products.iter().map(|p| p.encoded_len() as u64).sum::<u64>());
}

#[test]
fn colliding_insertion_times_are_bumped() {
    let dir = tempdir().expect("tempdir");
    let frozen = Timestamp::new(1_700_000_000, 999_999);
    let config = QueueConfig::default().with_clock(Arc::new(FrozenClock(frozen)));
    let queue = create(&dir.path().join("frozen.pq"), config);
    for n in 0..3u32 {
        queue
            .insert(&Product::from_payload(format!("p{n}"), 1, n, vec![n as u8; 16]))
            .expect("insert");
    }

    let mut times = Vec::new();
    while queue
        .sequence(Direction::Forward, &ProductClass::all(), |p| {
            times.push((p.inserted, p.info.seqno));
            true
        })
        .expect("sequence")
        != Step::End
    {}
    assert_eq!(
        times,
        vec![
            (frozen, 0),
            (Timestamp::new(1_700_000_001, 0), 1),
            (Timestamp::new(1_700_000_001, 1), 2),
        ]
    );
    assert_eq!(queue.oldest_cursor().expect("oldest"), frozen);
}

#[test]
fn open_rejects_foreign_files() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("junk");
    std::fs::write(&path, vec![0xabu8; 8192]).expect("write");
    assert!(matches!(
        ProductQueue::open(&path, QueueConfig::read_only()),
        Err(Error::NotAQueue)
    ));
    std::fs::write(&path, b"short").expect("write");
    assert!(matches!(
        ProductQueue::open(&path, QueueConfig::read_only()),
        Err(Error::NotAQueue)
    ));
}

#[test]
fn no_clobber_refuses_existing_file() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("exists.pq");
    create(&path, QueueConfig::default()).close().expect("close");
    let config = QueueConfig {
        no_clobber: true,
        ..QueueConfig::default()
    };
    let err = ProductQueue::create(&path, CreateOptions::new(4096, 8), config)
        .err()
        .expect("create must fail");
    assert!(matches!(err, Error::Io(ref io) if io.kind() == std::io::ErrorKind::AlreadyExists));
    // The original survives.
    ProductQueue::open(&path, QueueConfig::read_only()).expect("open");
}
