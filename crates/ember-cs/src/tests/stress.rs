use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use ember_core::{Error, GpuAddr, MonotonicClock, PAGE_SIZE};
use ember_mem::BoDesc;

use super::{compute, gfx, Harness};
use crate::chunk::ChunkWriter;
use crate::config::CsConfig;
use crate::wire::{IbFlags, StreamFlags};

/// xorshift64; tests only need a reproducible spread
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn test_interrupted_reservation_rolls_back() {
    let h = Harness::new();
    let (a, bo_a) = h.bo(BoDesc::gtt(PAGE_SIZE));
    let (b, bo_b) = h.bo(BoDesc::gtt(PAGE_SIZE));

    let holder_stream = ChunkWriter::new()
        .bo_list(&[(b, 0)])
        .cmd_buf(gfx(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    let holder = h
        .device
        .prepare(&h.client, h.ctx, &holder_stream, None)
        .unwrap();
    let held_by = holder.ticket().unwrap();

    let other = h.device.create_context(&h.client).unwrap();
    let stream = ChunkWriter::new()
        .bo_list(&[(a, 0), (b, 0)])
        .cmd_buf(compute(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    h.client.interrupt().raise();
    assert_eq!(
        h.device.submit(&h.client, other, &stream, None),
        Err(Error::Interrupted)
    );
    assert!(!bo_a.resv().is_locked());
    assert!(bo_b.resv().is_locked_by(held_by));
    assert_eq!(h.device.stats().transient, 1);

    drop(holder);
    assert!(!bo_b.resv().is_locked());
    assert!(h.client.interrupt().take());
    assert!(h.device.submit(&h.client, other, &stream, None).is_ok());
}

#[test]
fn test_no_wait_submission_fails_fast() {
    let h = Harness::new();
    let (a, bo) = h.bo(BoDesc::gtt(PAGE_SIZE));
    let stream = ChunkWriter::new()
        .bo_list(&[(a, 0)])
        .cmd_buf(gfx(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    let holder = h.device.prepare(&h.client, h.ctx, &stream, None).unwrap();

    let other = h.device.create_context(&h.client).unwrap();
    let no_wait = ChunkWriter::new()
        .flags(StreamFlags::NO_WAIT)
        .bo_list(&[(a, 0)])
        .cmd_buf(compute(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    assert_eq!(
        h.device.submit(&h.client, other, &no_wait, None),
        Err(Error::WouldBlock)
    );

    drop(holder);
    assert!(!bo.resv().is_locked());
    assert!(h.device.submit(&h.client, other, &no_wait, None).is_ok());
}

#[test]
fn test_concurrent_submissions_complete() {
    const THREADS: u64 = 4;
    const ROUNDS: usize = 48;
    const BOS: usize = 8;

    let h = Harness::build(Arc::new(MonotonicClock::new()), CsConfig::default());
    let handles: Vec<u32> = (0..BOS).map(|_| h.bo(BoDesc::gtt(PAGE_SIZE)).0).collect();
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                if h.drain() == 0 {
                    std::thread::yield_now();
                }
            }
        });

        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let h = &h;
                let handles = &handles;
                s.spawn(move || {
                    let ctx = h.device.create_context(&h.client).unwrap();
                    let key = if t % 2 == 0 { gfx() } else { compute() };
                    let mut rng = Rng(0x9e37_79b9_7f4a_7c15 ^ (t + 1));
                    let mut last = 0;
                    for _ in 0..ROUNDS {
                        let mask = rng.next() as usize | 1;
                        let list: Vec<(u32, u32)> = handles
                            .iter()
                            .enumerate()
                            .filter(|&(i, _)| mask & (1usize << i) != 0)
                            .map(|(_, &handle)| (handle, 0))
                            .collect();
                        let stream = ChunkWriter::new()
                            .bo_list(&list)
                            .cmd_buf(key, GpuAddr::new(0x1000), 64, IbFlags::empty())
                            .finish();
                        let seq = h.device.submit(&h.client, ctx, &stream, None).unwrap();
                        assert!(seq > last);
                        last = seq;
                    }
                    (ctx, key, last)
                })
            })
            .collect();

        let finished: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        for (ctx, key, seq) in finished {
            assert!(h
                .device
                .wait_cs(&h.client, ctx, key, seq, 10_000_000_000)
                .unwrap());
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(h.device.stats().submitted, THREADS * ROUNDS as u64);
    for handle in handles {
        assert!(!h.client.bo(handle).unwrap().resv().is_locked());
    }
}

#[test]
fn test_shared_context_keeps_history_bounded() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 32;
    const DEPTH: usize = 4;

    let h = Harness::build(
        Arc::new(MonotonicClock::new()),
        CsConfig {
            history_depth: DEPTH,
            ..CsConfig::default()
        },
    );
    let stream = ChunkWriter::new()
        .cmd_buf(gfx(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    let done = AtomicBool::new(false);

    let mut seqs: Vec<u64> = std::thread::scope(|s| {
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                if h.drain() == 0 {
                    std::thread::yield_now();
                }
            }
        });

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let h = &h;
                let stream = &stream;
                s.spawn(move || {
                    let mut seqs = Vec::with_capacity(ROUNDS);
                    for _ in 0..ROUNDS {
                        let seq = h.device.submit(&h.client, h.ctx, stream, None).unwrap();
                        // Every unfinished job still owns a history slot.
                        assert!(h.gfx.pending() <= DEPTH);
                        seqs.push(seq);
                    }
                    seqs
                })
            })
            .collect();

        let seqs: Vec<u64> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        done.store(true, Ordering::Release);
        seqs
    });

    let total = (THREADS * ROUNDS) as u64;
    seqs.sort_unstable();
    assert!(seqs.iter().copied().eq(1..=total));
    h.drain();
    assert_eq!(h.gfx.pending(), 0);
    assert!(h.device.wait_cs(&h.client, h.ctx, gfx(), total, 0).unwrap());
}
