use prodqueue::{
    CreateOptions, Direction, Product, ProductClass, ProductQueue, QueueConfig, Step, Strategy,
};
use tempfile::tempdir;

fn exercise(config: QueueConfig, expected: Strategy) {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("strategy.pq");
    // Small enough that the later inserts evict.
    let queue = ProductQueue::create(&path, CreateOptions::new(8192, 32), config.clone().quiet())
        .expect("create");
    assert_eq!(queue.strategy().expect("strategy"), expected);
    for n in 0..40u32 {
        let payload = vec![n as u8; 300 + (n as usize % 7) * 50];
        queue
            .insert(&Product::from_payload(format!("p{n}"), 1, n, payload))
            .expect("insert");
    }
    queue.close().expect("close");

    let queue = ProductQueue::open(&path, config.quiet()).expect("reopen");
    let mut seqnos = Vec::new();
    while queue
        .sequence(Direction::Forward, &ProductClass::all(), |p| {
            assert!(p.data.iter().all(|&b| b == p.info.seqno as u8));
            seqnos.push(p.info.seqno);
            true
        })
        .expect("sequence")
        != Step::End
    {}
    assert!(!seqnos.is_empty());
    assert_eq!(*seqnos.last().expect("newest"), 39);
    assert!(seqnos.windows(2).all(|w| w[0] < w[1]));
    assert!(queue.is_full().expect("full"));
}

#[test]
fn whole_file_mapping() {
    exercise(QueueConfig::default(), Strategy::WholeMap);
}

#[test]
fn per_region_mapping() {
    exercise(QueueConfig::region_mapped(), Strategy::RegionMap);
}

#[test]
fn buffered_io() {
    exercise(QueueConfig::buffered(), Strategy::Buffered);
}

#[test]
fn private_mapping_does_not_reach_the_file() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("private.pq");
    ProductQueue::create(&path, CreateOptions::new(8192, 16), QueueConfig::default().quiet())
        .expect("create")
        .close()
        .expect("close");

    let config = QueueConfig {
        private_map: true,
        ..QueueConfig::default()
    };
    let queue = ProductQueue::open(&path, config.quiet()).expect("open private");
    queue
        .insert(&Product::from_payload("ghost", 1, 0, vec![9u8; 64]))
        .expect("insert");
    assert_eq!(queue.stats().expect("stats").products, 1);
    drop(queue);

    let queue = ProductQueue::open(&path, QueueConfig::read_only()).expect("open");
    assert_eq!(queue.stats().expect("stats").products, 0);
}
