use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use latchtree::{LatchTreeError, Tree, TreeConfig, View};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn key(i: usize) -> Bytes {
    Bytes::from(format!("key-{:08}", i))
}

fn small_tree() -> Arc<Tree> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(Tree::new(TreeConfig::default().page_size(512)).unwrap())
}

#[test]
fn disjoint_writers() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 1500;
    let tree = small_tree();

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let tree = Arc::clone(&tree);
            scope.spawn(move || {
                let mut order: Vec<usize> = (0..PER_THREAD).map(|i| i * THREADS + t).collect();
                order.shuffle(&mut StdRng::seed_from_u64(t as u64));
                for i in order {
                    tree.insert(key(i), Bytes::from(i.to_string())).unwrap();
                }
            });
        }
    });

    let entries = tree.entries().unwrap();
    assert_eq!(entries.len(), THREADS * PER_THREAD);
    for (i, (k, v)) in entries.iter().enumerate() {
        assert_eq!(k, &key(i));
        assert_eq!(v, &Bytes::from(i.to_string()));
    }
    tree.check_invariants().unwrap();
    assert!(tree.height().unwrap() >= 3);
}

#[test]
fn racing_writers_insert_each_key_once() {
    const THREADS: usize = 6;
    const KEYS: usize = 3000;
    let tree = small_tree();
    let stored = AtomicUsize::new(0);
    let duplicates = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let tree = Arc::clone(&tree);
            let stored = &stored;
            let duplicates = &duplicates;
            scope.spawn(move || {
                let mut order: Vec<usize> = (0..KEYS).collect();
                order.shuffle(&mut StdRng::seed_from_u64(100 + t as u64));
                let mut cursor = tree.new_cursor();
                for i in order {
                    cursor.find(key(i)).unwrap();
                    match cursor.store(Bytes::from(format!("{}", t))) {
                        Ok(()) => stored.fetch_add(1, Ordering::Relaxed),
                        Err(LatchTreeError::DuplicateKey) => {
                            duplicates.fetch_add(1, Ordering::Relaxed)
                        }
                        Err(e) => panic!("unexpected error: {}", e),
                    };
                }
            });
        }
    });

    assert_eq!(stored.load(Ordering::Relaxed), KEYS);
    assert_eq!(
        duplicates.load(Ordering::Relaxed),
        KEYS * (THREADS - 1)
    );
    assert_eq!(tree.entries().unwrap().len(), KEYS);
    tree.check_invariants().unwrap();
}

#[test]
fn readers_and_writers_with_held_cursors() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 1000;
    let tree = small_tree();

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let tree = Arc::clone(&tree);
            scope.spawn(move || {
                let first = t;
                let mut anchor = tree.new_cursor();
                anchor.find(key(first)).unwrap();
                anchor.store("anchor").unwrap();

                for i in 1..PER_THREAD {
                    let k = i * THREADS + t;
                    tree.insert(key(k), "v").unwrap();
                    if i % 50 == 0 {
                        assert_eq!(tree.get(key(k)).unwrap(), Some(Bytes::from("v")));
                        assert_eq!(anchor.positioned_key().unwrap(), Some(key(first)));
                    }
                }
                assert_eq!(anchor.load().unwrap(), Some(Bytes::from("anchor")));
            });
        }
    });

    assert_eq!(tree.entries().unwrap().len(), THREADS * PER_THREAD);
    tree.check_invariants().unwrap();
}
