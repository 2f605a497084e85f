// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sort-queue windowing and rollover-order properties.

use totem::seq::SeqNo;
use totem::sq::SortQueue;

#[test]
fn test_release_then_reuse_window() {
    // init(size=8, head_seq=100); add 103, 106; release through 104.
    let mut sq: SortQueue<Vec<u8>> = SortQueue::new(8, SeqNo(100));
    sq.item_add(b"x".to_vec(), SeqNo(103));
    sq.item_add(b"y".to_vec(), SeqNo(106));
    sq.items_release(SeqNo(104));

    assert!(!sq.item_inuse(SeqNo(103)));
    assert!(sq.item_inuse(SeqNo(106)));
    assert_eq!(sq.item_get(SeqNo(106)).unwrap(), &b"y".to_vec());
    assert!(sq.in_range(SeqNo(105)));
    assert!(sq.in_range(SeqNo(112)));
    assert!(!sq.in_range(SeqNo(113)));
}

#[test]
fn test_round_trip_with_release_prefix() {
    let head = SeqNo(1000);
    let n = 32usize;
    let mut sq: SortQueue<Vec<u8>> = SortQueue::new(n, head);
    for i in 0..n as u32 {
        sq.item_add(vec![i as u8; 5], head.add(i));
    }
    let k = 10u32;
    sq.items_release(head.add(k));

    for j in 0..n as u32 {
        let seq = head.add(j);
        if j <= k {
            assert!(!sq.item_inuse(seq), "seq {} released", seq);
        } else {
            assert_eq!(sq.item_get(seq).unwrap(), &vec![j as u8; 5]);
        }
    }
}

#[test]
fn test_rollover_order_properties() {
    // lt agrees with modular distance within half the space.
    let samples: Vec<u32> = vec![
        0,
        1,
        2,
        0xffff,
        0x10000,
        0x7fff_ffff,
        0x8000_0000,
        0x8000_0001,
        0xfffe_0000,
        u32::MAX - 1,
        u32::MAX,
    ];
    for &a in &samples {
        // Irreflexive, lte agrees on equality.
        assert!(!SeqNo(a).lt(SeqNo(a)));
        assert!(SeqNo(a).lte(SeqNo(a)));
        for delta in [1u32, 2, 0x100, 0x10000] {
            let b = a.wrapping_add(delta);
            assert!(SeqNo(a).lt(SeqNo(b)), "a={:#x} b={:#x}", a, b);
            assert!(!SeqNo(b).lt(SeqNo(a)), "a={:#x} b={:#x}", a, b);
            assert!(SeqNo(a).lte(SeqNo(b)));
        }
    }
}

#[test]
fn test_window_straddles_rollover() {
    let head = SeqNo(u32::MAX - 2);
    let mut sq: SortQueue<u32> = SortQueue::new(8, head);
    // Fill across the wrap point.
    for i in 0..8u32 {
        sq.item_add(i, head.add(i));
    }
    assert!(sq.item_inuse(SeqNo(u32::MAX)));
    assert!(sq.item_inuse(SeqNo(0)));
    assert!(sq.item_inuse(SeqNo(4)));

    // Release across the wrap and confirm the window advanced.
    sq.items_release(SeqNo(1));
    assert_eq!(sq.head_seq(), SeqNo(2));
    assert!(!sq.item_inuse(SeqNo(0)));
    assert_eq!(sq.item_get(SeqNo(2)), Some(&5));
    assert!(sq.in_range(SeqNo(9)));
    assert!(!sq.in_range(SeqNo(10)));
}

#[test]
fn test_miss_count_tracks_gaps() {
    let mut sq: SortQueue<u8> = SortQueue::new(16, SeqNo(0));
    sq.item_add(1, SeqNo(0));
    sq.item_add(1, SeqNo(2));
    // Seq 1 is the gap; repeated retransmit rounds bump its count.
    for round in 1..=5 {
        assert_eq!(sq.item_miss_count(SeqNo(1)), round);
    }
    sq.item_add(1, SeqNo(1));
    assert_eq!(sq.item_miss_count(SeqNo(1)), 1, "fill resets the count");
}
