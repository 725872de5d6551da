use prodqueue::{CreateOptions, ProductQueue, QueueConfig};
use tempfile::tempdir;

#[test]
fn writers_are_counted() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("count.pq");
    let creator = ProductQueue::create(
        &path,
        CreateOptions::new(4096, 8),
        QueueConfig::default().quiet(),
    )
    .expect("create");
    assert_eq!(ProductQueue::write_count(&path).expect("count"), 1);

    let second = ProductQueue::open(&path, QueueConfig::default().quiet()).expect("open");
    let reader = ProductQueue::open(&path, QueueConfig::read_only()).expect("open reader");
    assert_eq!(ProductQueue::write_count(&path).expect("count"), 2);

    drop(reader);
    second.close().expect("close");
    assert_eq!(ProductQueue::write_count(&path).expect("count"), 1);
    drop(creator);
    assert_eq!(ProductQueue::write_count(&path).expect("count"), 0);
}

#[test]
fn crashed_writer_can_be_cleared() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("crash.pq");
    let queue = ProductQueue::create(
        &path,
        CreateOptions::new(4096, 8),
        QueueConfig::default().quiet(),
    )
    .expect("create");
    // Never closes, like a killed process.
    std::mem::forget(queue);
    assert_eq!(ProductQueue::write_count(&path).expect("count"), 1);

    assert_eq!(ProductQueue::clear_write_count(&path).expect("clear"), 1);
    assert_eq!(ProductQueue::write_count(&path).expect("count"), 0);
}

#[test]
fn residence_can_be_cleared() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("mvrt.pq");
    let queue = ProductQueue::create(
        &path,
        CreateOptions::new(4096, 8),
        QueueConfig::default().quiet(),
    )
    .expect("create");
    queue.clear_min_virtual_residence().expect("clear");
    let residence = queue.min_virtual_residence().expect("mvrt");
    assert!(residence.time.is_none());
    assert_eq!(residence.bytes, -1);
}
