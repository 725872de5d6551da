use std::time::Duration;

use prodqueue::class::feedtype;
use prodqueue::{
    checkpoint, CreateOptions, Direction, Error, Product, ProductClass, ProductQueue,
    ProductSpec, QueueConfig, SeqDelete, Step, Timestamp,
};
use tempfile::tempdir;

fn queue_with(path: &std::path::Path, idents: &[&str]) -> (ProductQueue, Vec<Product>) {
    let queue = ProductQueue::create(
        path,
        CreateOptions::new(64 * 1024, 64),
        QueueConfig::default().quiet(),
    )
    .expect("create");
    let products: Vec<_> = idents
        .iter()
        .enumerate()
        .map(|(n, ident)| Product::from_payload(*ident, 1, n as u32, ident.as_bytes().repeat(20)))
        .collect();
    for product in &products {
        queue.insert(product).expect("insert");
    }
    (queue, products)
}

fn next_ident(queue: &ProductQueue, direction: Direction, class: &ProductClass) -> Option<String> {
    loop {
        let mut ident = None;
        let step = queue
            .sequence(direction, class, |p| {
                ident = Some(p.info.ident.clone());
                true
            })
            .expect("sequence");
        match step {
            Step::Delivered => return ident,
            Step::End => return None,
            Step::Skipped | Step::Declined => {}
        }
    }
}

fn only(pattern: &str) -> ProductClass {
    ProductClass::new(
        Timestamp::ZERO,
        Timestamp::ENDT,
        vec![ProductSpec::new(feedtype::ANY, pattern).expect("spec")],
    )
}

#[test]
fn backward_from_unset_cursor_starts_at_newest() {
    let dir = tempdir().expect("tempdir");
    let (queue, _) = queue_with(&dir.path().join("back.pq"), &["A", "B", "C"]);
    let all = ProductClass::all();
    assert!(queue.cursor().expect("cursor").is_none());
    let idents: Vec<_> = std::iter::from_fn(|| next_ident(&queue, Direction::Backward, &all)).collect();
    assert_eq!(idents, ["C", "B", "A"]);
}

#[test]
fn declined_product_is_offered_again() {
    let dir = tempdir().expect("tempdir");
    let (queue, _) = queue_with(&dir.path().join("decline.pq"), &["A", "B"]);
    let all = ProductClass::all();
    let step = queue
        .sequence(Direction::Forward, &all, |_| false)
        .expect("sequence");
    assert_eq!(step, Step::Declined);
    assert_eq!(next_ident(&queue, Direction::Forward, &all).as_deref(), Some("A"));
    assert_eq!(next_ident(&queue, Direction::Forward, &all).as_deref(), Some("B"));
}

#[test]
fn class_filter_skips_without_delivering() {
    let dir = tempdir().expect("tempdir");
    let (queue, _) = queue_with(&dir.path().join("filter.pq"), &["obs/1", "grid/1", "obs/2"]);
    let class = only("^obs/");
    assert_eq!(next_ident(&queue, Direction::Forward, &class).as_deref(), Some("obs/1"));
    assert_eq!(next_ident(&queue, Direction::Forward, &class).as_deref(), Some("obs/2"));
    assert_eq!(next_ident(&queue, Direction::Forward, &class), None);

    let nothing = ProductClass::new(Timestamp::ZERO, Timestamp::ENDT, Vec::new());
    queue.set_cursor(Timestamp::ZERO).expect("cursor");
    assert_eq!(next_ident(&queue, Direction::Forward, &nothing), None);
}

#[test]
fn advance_moves_without_reading() {
    let dir = tempdir().expect("tempdir");
    let (queue, _) = queue_with(&dir.path().join("advance.pq"), &["A", "B"]);
    assert_eq!(queue.advance(Direction::Forward).expect("advance"), Step::Skipped);
    assert_eq!(
        next_ident(&queue, Direction::Forward, &ProductClass::all()).as_deref(),
        Some("B")
    );
    assert_eq!(queue.advance(Direction::Forward).expect("advance"), Step::End);
}

#[test]
fn cursor_from_signature_and_checkpoint() {
    let dir = tempdir().expect("tempdir");
    let (queue, products) = queue_with(&dir.path().join("sig.pq"), &["A", "B", "C"]);
    queue
        .set_cursor_from_signature(&products[1].info.signature)
        .expect("cursor from signature");
    let all = ProductClass::all();
    assert_eq!(next_ident(&queue, Direction::Forward, &all).as_deref(), Some("C"));

    // Resume after a restart from a persisted position.
    let saved = dir.path().join("pq.cursor");
    queue
        .set_cursor_from_signature(&products[0].info.signature)
        .expect("cursor from signature");
    checkpoint::write(&saved, queue.cursor().expect("cursor").time).expect("checkpoint");
    queue.set_cursor(checkpoint::read(&saved).expect("read")).expect("set cursor");
    assert_eq!(next_ident(&queue, Direction::Forward, &all).as_deref(), Some("B"));

    let missing = prodqueue::Signature([0x42; 16]);
    assert!(matches!(
        queue.set_cursor_from_signature(&missing),
        Err(Error::NotFound)
    ));
}

#[test]
fn sequence_delete_removes_matching_products() {
    let dir = tempdir().expect("tempdir");
    let (queue, products) = queue_with(&dir.path().join("seqdel.pq"), &["A", "B", "C"]);
    let class = only("^B$");
    let mut outcomes = Vec::new();
    loop {
        let outcome = queue
            .sequence_delete(Direction::Forward, &class, false)
            .expect("sequence_delete");
        if outcome == SeqDelete::End {
            break;
        }
        outcomes.push(outcome);
    }
    assert!(matches!(outcomes[0], SeqDelete::Skipped { .. }));
    assert!(matches!(outcomes[1], SeqDelete::Deleted { extent, .. } if extent >= products[1].encoded_len() as u64));
    assert!(matches!(outcomes[2], SeqDelete::Skipped { .. }));
    assert_eq!(outcomes.len(), 3);

    assert_eq!(queue.stats().expect("stats").products, 2);
    assert!(matches!(
        queue.process_by_signature(&products[1].info.signature, |_| ()),
        Err(Error::NotFound)
    ));
}

#[test]
fn delete_by_signature_hides_the_product() {
    let dir = tempdir().expect("tempdir");
    let (queue, products) = queue_with(&dir.path().join("delete.pq"), &["A", "S", "C"]);
    let target = &products[1].info.signature;
    queue.delete_by_signature(target).expect("delete");
    assert!(matches!(
        queue.process_by_signature(target, |_| ()),
        Err(Error::NotFound)
    ));
    assert!(matches!(queue.delete_by_signature(target), Err(Error::NotFound)));

    queue.set_cursor(Timestamp::ZERO).expect("cursor");
    let all = ProductClass::all();
    let idents: Vec<_> = std::iter::from_fn(|| next_ident(&queue, Direction::Forward, &all)).collect();
    assert_eq!(idents, ["A", "C"]);
}

#[test]
fn class_window_positions_the_cursor() {
    let dir = tempdir().expect("tempdir");
    let (queue, _) = queue_with(&dir.path().join("window.pq"), &["A", "B", "C"]);
    let mut class = only("^B$");
    assert_eq!(
        queue.set_cursor_from_class(&class).expect("from class"),
        Direction::Forward
    );
    assert_eq!(queue.cursor().expect("cursor").time, Timestamp::ZERO);

    let last = queue.last_match(&class).expect("last").expect("B matches");
    assert_eq!(last.ident, "B");
    assert!(queue.class_set_from(&mut class).expect("set from"));
    assert_eq!(class.from, last.arrival);
    assert!(!queue.class_set_from(&mut class).expect("set from again"));

    queue.set_cursor(Timestamp::new(10, 0)).expect("cursor");
    let all = ProductClass::all();
    assert!(queue
        .cursor_in_class(Direction::Forward, &all, Duration::ZERO)
        .expect("in class"));
    let bounded = ProductClass::new(Timestamp::ZERO, Timestamp::new(5, 0), vec![ProductSpec::any()]);
    assert!(!queue
        .cursor_in_class(Direction::Forward, &bounded, Duration::from_secs(1))
        .expect("in class"));
    assert!(queue
        .cursor_in_class(Direction::Forward, &bounded, Duration::from_secs(5))
        .expect("in class"));
}
