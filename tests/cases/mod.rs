//! Scenarios shared by the integration tests, run with the allocator under
//! test installed as the global allocator.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;

pub fn small_alloc() {
    let mut boxes: Vec<Box<u64>> = (0..10_000).map(Box::new).collect();
    for (i, b) in boxes.iter().enumerate() {
        assert_eq!(**b, i as u64);
    }
    boxes.retain(|b| **b % 3 != 0);
    let sum: u64 = boxes.iter().map(|b| **b).sum();
    assert_eq!(sum, (0..10_000u64).filter(|x| x % 3 != 0).sum());
}

pub fn growing_vec() {
    let mut v = Vec::new();
    for i in 0..100_000u32 {
        v.push(i);
    }
    assert_eq!(v.len(), 100_000);
    assert!(v.iter().enumerate().all(|(i, &x)| i as u32 == x));
    v.truncate(10);
    v.shrink_to_fit();
    assert_eq!(v, (0..10).collect::<Vec<_>>());
}

pub fn strings_and_maps() {
    let mut map = HashMap::new();
    for i in 0..5_000 {
        map.insert(format!("key-{}", i), i.to_string().repeat(i % 17));
    }
    for i in 0..5_000 {
        assert_eq!(map[&format!("key-{}", i)], i.to_string().repeat(i % 17));
    }
    let mut tree = BTreeMap::new();
    for (k, v) in map.drain() {
        tree.insert(v, k);
    }
    assert!(!tree.is_empty());
}

pub fn big_alloc() {
    let big = vec![0xA5u8; 1 << 20];
    assert!(big.iter().all(|&b| b == 0xA5));
    let mut bigger = big.clone();
    bigger.resize(3 << 20, 0x5A);
    assert_eq!(bigger[(1 << 20) - 1], 0xA5);
    assert_eq!(bigger[1 << 20], 0x5A);
}

pub fn overaligned_alloc() {
    #[repr(align(64))]
    struct Line([u8; 64]);
    #[repr(align(4096))]
    struct Page([u8; 16]);

    let lines: Vec<Box<Line>> = (0..100).map(|i| Box::new(Line([i as u8; 64]))).collect();
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(&**line as *const Line as usize % 64, 0);
        assert!(line.0.iter().all(|&b| b == i as u8));
    }
    let page = Box::new(Page([7; 16]));
    assert_eq!(&*page as *const Page as usize % 4096, 0);
    assert_eq!(page.0, [7; 16]);
}

/// Blocks allocated on one thread and freed on another.
pub fn cross_thread_free() {
    let (tx, rx) = channel::<Vec<Box<[u8; 48]>>>();
    let producer = thread::spawn(move || {
        for round in 0..50u8 {
            let batch = (0..200).map(|_| Box::new([round; 48])).collect();
            tx.send(batch).unwrap();
        }
    });
    let consumer = thread::spawn(move || {
        let mut rounds = 0u8;
        for batch in rx {
            assert!(batch.iter().all(|b| b.iter().all(|&x| x == rounds)));
            rounds += 1;
        }
        rounds
    });
    producer.join().unwrap();
    assert_eq!(consumer.join().unwrap(), 50);
}

/// Many threads hammering a shared structure while allocating privately.
pub fn threaded_churn() {
    let shared = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut local = Vec::new();
                for i in 0..2_000usize {
                    let s = format!("{}:{}", t, i).repeat(1 + i % 13);
                    if i % 5 == 0 {
                        shared.lock().unwrap().push(s);
                    } else {
                        local.push(s);
                    }
                    if local.len() > 64 {
                        local.drain(..32);
                    }
                }
                local.len()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap() <= 65);
    }
    let shared = shared.lock().unwrap();
    assert_eq!(shared.len(), 8 * 400);
    assert!(shared.iter().all(|s| s.contains(':')));
}
