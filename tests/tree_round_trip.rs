use std::sync::Arc;

use bytes::Bytes;
use latchtree::{LatchTreeError, Tree, TreeConfig, View};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn tree(page_size: usize) -> Arc<Tree> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(Tree::new(TreeConfig::default().page_size(page_size)).unwrap())
}

fn key(i: usize) -> Bytes {
    Bytes::from(format!("key-{:06}", i))
}

fn value(i: usize) -> Bytes {
    Bytes::from(format!("value-{}", i))
}

fn assert_contains_exactly(tree: &Tree, count: usize) {
    let entries = tree.entries().unwrap();
    assert_eq!(entries.len(), count);
    for (i, (k, v)) in entries.iter().enumerate() {
        assert_eq!(k, &key(i));
        assert_eq!(v, &value(i));
    }
    tree.check_invariants().unwrap();
}

#[test]
fn ascending_inserts() {
    let tree = tree(512);
    for i in 0..5000 {
        tree.insert(key(i), value(i)).unwrap();
    }
    assert_contains_exactly(&tree, 5000);
    assert!(tree.height().unwrap() >= 3);
}

#[test]
fn descending_inserts() {
    let tree = tree(512);
    for i in (0..5000).rev() {
        tree.insert(key(i), value(i)).unwrap();
    }
    assert_contains_exactly(&tree, 5000);
}

#[test]
fn shuffled_inserts_with_lookups() {
    let tree = tree(1024);
    let mut order: Vec<usize> = (0..8000).collect();
    order.shuffle(&mut StdRng::seed_from_u64(7));
    for i in &order {
        tree.insert(key(*i), value(*i)).unwrap();
    }
    for i in order.iter().step_by(37) {
        assert_eq!(tree.get(key(*i)).unwrap(), Some(value(*i)));
    }
    assert_eq!(tree.get("absent").unwrap(), None);
    assert_contains_exactly(&tree, 8000);
}

#[test]
fn duplicates_leave_original_value() {
    let tree = tree(512);
    for i in 0..300 {
        tree.insert(key(i), value(i)).unwrap();
    }
    for i in (0..300).step_by(3) {
        assert!(matches!(
            tree.insert(key(i), "other"),
            Err(LatchTreeError::DuplicateKey)
        ));
    }
    assert_contains_exactly(&tree, 300);
}

#[test]
fn one_cursor_inserts_many() {
    let tree = tree(512);
    let mut cursor = tree.new_cursor();
    for i in (0..2000).rev() {
        cursor.find(key(i)).unwrap();
        assert_eq!(cursor.value(), None);
        cursor.store(value(i)).unwrap();
        assert_eq!(cursor.positioned_key().unwrap(), Some(key(i)));
    }
    drop(cursor);
    assert_contains_exactly(&tree, 2000);
}

#[test]
fn held_cursors_survive_splits() {
    let tree = tree(512);
    for i in (0..3000).step_by(10) {
        tree.insert(key(i), value(i)).unwrap();
    }
    let mut held = Vec::new();
    for i in (0..3000).step_by(100) {
        let mut cursor = tree.new_cursor();
        cursor.find(key(i)).unwrap();
        assert_eq!(cursor.value(), Some(&value(i)));
        held.push((i, cursor));
    }

    let mut rest: Vec<usize> = (0..3000).filter(|i| i % 10 != 0).collect();
    rest.shuffle(&mut StdRng::seed_from_u64(11));
    for i in rest {
        tree.insert(key(i), value(i)).unwrap();
    }

    for (i, cursor) in &mut held {
        assert_eq!(cursor.positioned_key().unwrap(), Some(key(*i)));
        assert_eq!(cursor.load().unwrap(), Some(value(*i)));
        assert_eq!(cursor.frames().len(), tree.height().unwrap());
        assert_eq!(cursor.frames()[0].0, tree.root_page_id());
    }
    tree.check_invariants().unwrap();
    drop(held);
    assert_contains_exactly(&tree, 3000);
}

/// Keys as wide as a separator allows on 512 byte pages: 124 key bytes plus
/// the child reference make 128, the largest entry such a node accepts.
fn wide_key(i: usize) -> Bytes {
    let mut key = format!("{:06}", i).into_bytes();
    key.resize(124, b'.');
    Bytes::from(key)
}

fn wide_value(i: usize) -> Bytes {
    if i % 2 == 0 {
        Bytes::from(format!("{:04}", i % 10000))
    } else {
        Bytes::new()
    }
}

fn insert_wide_entries(order: &[usize]) {
    let tree = tree(512);
    for i in order {
        tree.insert(wide_key(*i), wide_value(*i)).unwrap();
    }
    tree.check_invariants().unwrap();
    assert!(tree.height().unwrap() >= 4);

    for i in order {
        assert_eq!(tree.get(wide_key(*i)).unwrap(), Some(wide_value(*i)));
    }
    let entries = tree.entries().unwrap();
    assert_eq!(entries.len(), order.len());
    for (i, (k, v)) in entries.iter().enumerate() {
        assert_eq!(k, &wide_key(i));
        assert_eq!(v, &wide_value(i));
    }

    tree.insert("short", "still routable").unwrap();
    assert_eq!(tree.get("short").unwrap(), Some(Bytes::from("still routable")));
    tree.check_invariants().unwrap();
}

#[test]
fn widest_entries_ascending() {
    let order: Vec<usize> = (0..400).collect();
    insert_wide_entries(&order);
}

#[test]
fn widest_entries_descending() {
    let order: Vec<usize> = (0..400).rev().collect();
    insert_wide_entries(&order);
}

#[test]
fn widest_entries_shuffled() {
    let mut order: Vec<usize> = (0..400).collect();
    order.shuffle(&mut StdRng::seed_from_u64(23));
    insert_wide_entries(&order);
}

#[test]
fn keys_too_wide_for_a_separator_are_rejected() {
    let tree = tree(512);
    for i in 0..5 {
        let wide = Bytes::from(vec![b'a' + i as u8; 128]);
        assert!(matches!(
            tree.insert(wide, Bytes::new()),
            Err(LatchTreeError::EntryTooLarge { size: 132, max: 128 })
        ));
    }
    for i in 0..50 {
        tree.insert(key(i), value(i)).unwrap();
    }
    assert_eq!(tree.get(key(7)).unwrap(), Some(value(7)));
    assert_contains_exactly(&tree, 50);
}
