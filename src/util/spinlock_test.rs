use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{sync::Arc, thread};

use super::*;

#[test]
fn test_spinlock() {
    let seed: u64 = random();
    println!("test_spinlock {}", seed);

    let lock = Arc::new(Spinlock::new(0_u64));

    let mut writers = vec![];
    for i in 0..4 {
        let lock = Arc::clone(&lock);
        let seed = seed + i;
        writers.push(thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(seed);
            for _ in 0..1000 {
                let mut val = lock.write();
                *val += 1;
                if rng.gen::<u8>() % 16 == 0 {
                    thread::yield_now();
                }
            }
        }));
    }

    let mut readers = vec![];
    for _ in 0..4 {
        let lock = Arc::clone(&lock);
        readers.push(thread::spawn(move || {
            let mut max = 0;
            for _ in 0..1000 {
                let val = lock.read();
                assert!(*val >= max, "value went backward {} {}", *val, max);
                max = *val;
            }
        }));
    }

    for handle in writers.into_iter().chain(readers.into_iter()) {
        handle.join().unwrap();
    }

    assert_eq!(*lock.read(), 4000);
}
