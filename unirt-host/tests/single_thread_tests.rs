//! Single-Thread Mode Tests
//!
//! Single-thread mode turns the runtime's caller-side locks into no-ops.
//! Buffer contents are still written by queue worker threads, so they must
//! stay serialized in this mode. Runs in its own binary so the configuration
//! is installed before first use.

use std::sync::{Arc, Barrier};
use std::thread;

use unirt_common::{RuntimeConfig, single_thread_mode};
use unirt_host::HostBuffer;

const BUFFER_SIZE: usize = 1 << 20;
const ROUNDS: usize = 64;

#[test]
fn test_buffer_writes_stay_serialized() {
    RuntimeConfig::install(RuntimeConfig {
        single_thread_mode: true,
        ..RuntimeConfig::default()
    })
    .unwrap();
    assert!(single_thread_mode());

    let buffer = Arc::new(HostBuffer::new(BUFFER_SIZE, None));
    let barrier = Arc::new(Barrier::new(3));

    let writers: Vec<_> = [1u8, 2u8]
        .into_iter()
        .map(|byte| {
            let buffer = Arc::clone(&buffer);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let pattern = vec![byte; BUFFER_SIZE];
                barrier.wait();
                for _ in 0..ROUNDS {
                    buffer.write(0, &pattern).unwrap();
                }
            })
        })
        .collect();

    barrier.wait();
    for _ in 0..ROUNDS {
        let snapshot = buffer.snapshot();
        let first = snapshot[0];
        assert!(
            snapshot.iter().all(|b| *b == first),
            "torn buffer observed"
        );
    }

    for writer in writers {
        writer.join().unwrap();
    }

    let mut out = vec![0u8; BUFFER_SIZE];
    buffer.read_into(0, &mut out).unwrap();
    assert!(out[0] == 1 || out[0] == 2);
    assert!(out.iter().all(|b| *b == out[0]));
}
