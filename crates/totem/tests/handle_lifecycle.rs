// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Handle database lifecycle: deferred destruction, stale-handle rejection,
//! and iteration across a churning table.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use totem::hdb::HandleDatabase;
use totem::Error;

struct Payload {
    #[allow(dead_code)]
    body: [u8; 64],
    tag: u32,
}

#[test]
fn test_destroy_then_last_put_runs_destructor_once() {
    let drops = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&drops);
    let db: HandleDatabase<Payload> = HandleDatabase::new(Some(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    let h1 = db
        .create(Payload {
            body: [0; 64],
            tag: 7,
        })
        .unwrap();

    let held = db.get(h1).unwrap();
    assert_eq!(held.tag, 7);

    db.destroy(h1).unwrap();
    // The outstanding reference keeps the instance alive.
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert!(matches!(db.get(h1), Err(Error::BadHandle)));

    drop(held);
    db.put(h1).unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stale_handle_never_reaches_new_occupant() {
    let db: HandleDatabase<u64> = HandleDatabase::new(None);
    let mut old_handles = Vec::new();
    for generation in 0..50u64 {
        let h = db.create(generation).unwrap();
        for stale in &old_handles {
            assert!(
                matches!(db.get(*stale), Err(Error::BadHandle)),
                "stale handle resolved after reuse"
            );
        }
        assert_eq!(*db.get(h).unwrap(), generation);
        db.put(h).unwrap();
        db.destroy(h).unwrap();
        old_handles.push(h);
    }
}

#[test]
fn test_iteration_over_churning_table() {
    let db: HandleDatabase<u32> = HandleDatabase::new(None);
    let handles: Vec<_> = (0..10u32).map(|i| db.create(i).unwrap()).collect();
    for h in handles.iter().step_by(2) {
        db.destroy(*h).unwrap();
    }

    db.iterator_reset();
    let mut seen = Vec::new();
    while let Some((v, _)) = db.iterator_next() {
        seen.push(*v);
    }
    assert_eq!(seen, vec![1, 3, 5, 7, 9]);
    assert_eq!(db.len(), 5);
}

#[test]
fn test_get_put_balance_allows_later_destroy() {
    let drops = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&drops);
    let db: HandleDatabase<u32> = HandleDatabase::new(Some(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })));
    let h = db.create(1).unwrap();
    for _ in 0..100 {
        let r = db.get(h).unwrap();
        drop(r);
        db.put(h).unwrap();
    }
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    db.destroy(h).unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}
