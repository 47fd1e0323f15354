//! Concurrent producer/applier test for the deferred registry.

use std::thread;
use std::time::{Duration, Instant};

use aukit_core::DeferredRegistry;

const N: u32 = 10_000;
const TIMEOUT: Duration = Duration::from_secs(30);

/// Apply until the active list reaches `target` entries.
fn apply_until(registry: &mut DeferredRegistry<u32>, target: usize) {
    let start = Instant::now();
    while registry.len() != target {
        registry.apply();
        assert!(
            start.elapsed() < TIMEOUT,
            "registry stuck at {} entries, expected {}",
            registry.len(),
            target
        );
        thread::yield_now();
    }
}

#[test]
fn test_concurrent_adds_then_removes_converge() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut registry = DeferredRegistry::new();
    let registrar = registry.registrar();

    let producer = thread::spawn(move || {
        for i in 0..N {
            registrar.add(i);
        }
        registrar
    });

    apply_until(&mut registry, N as usize);
    let registrar = producer.join().unwrap();

    let mut seen: Vec<u32> = registry.iter().copied().collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..N).collect::<Vec<_>>(), "every item present exactly once");

    let producer = thread::spawn(move || {
        for i in 0..N {
            registrar.remove(i);
        }
    });

    apply_until(&mut registry, 0);
    producer.join().unwrap();
    assert!(!registry.apply(), "nothing left pending");
    assert_eq!(registry.iter().count(), 0);
}

#[test]
fn test_many_producers_preserve_per_thread_order() {
    const THREADS: u32 = 4;
    const PER_THREAD: u32 = 500;

    let mut registry = DeferredRegistry::new();
    let producers: Vec<_> = (0..THREADS)
        .map(|t| {
            let registrar = registry.registrar();
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    registrar.add(t * PER_THREAD + i);
                }
            })
        })
        .collect();

    apply_until(&mut registry, (THREADS * PER_THREAD) as usize);
    for producer in producers {
        producer.join().unwrap();
    }

    // Within each producer, items appear in submission order
    for t in 0..THREADS {
        let range = t * PER_THREAD..(t + 1) * PER_THREAD;
        let order: Vec<u32> = registry.iter().copied().filter(|v| range.contains(v)).collect();
        assert_eq!(order, range.collect::<Vec<_>>(), "thread {t} order");
    }
}
