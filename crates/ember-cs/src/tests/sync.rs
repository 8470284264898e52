use alloc::sync::Arc;

use ember_core::{Error, GpuAddr, Malformed, PAGE_SIZE};
use ember_mem::{BoDesc, BoFlags};

use super::{compute, gfx, Harness};
use crate::chunk::ChunkWriter;
use crate::config::CsConfig;
use crate::wait::FenceQuery;
use crate::wire::{IbFlags, SyncobjDesc, SyncobjFlags};

fn gfx_stream() -> alloc::vec::Vec<u8> {
    ChunkWriter::new()
        .cmd_buf(gfx(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish()
}

#[test]
fn test_future_sequence_rejected() {
    let h = Harness::new();
    let stream = ChunkWriter::new()
        .dependency(h.ctx, gfx(), 5, false)
        .cmd_buf(gfx(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    assert_eq!(
        h.device.submit(&h.client, h.ctx, &stream, None),
        Err(Error::InvalidArgument)
    );
    assert_eq!(
        h.device.wait_cs(&h.client, h.ctx, gfx(), 5, 0),
        Err(Error::InvalidArgument)
    );
}

#[test]
fn test_aged_out_sequence_is_complete() {
    let h = Harness::with_config(CsConfig {
        history_depth: 4,
        ..CsConfig::default()
    });
    for _ in 0..6 {
        h.device.submit(&h.client, h.ctx, &gfx_stream(), None).unwrap();
        h.drain();
    }
    assert!(h
        .device
        .query_fence(&h.client, h.ctx, gfx(), 1)
        .unwrap()
        .is_none());
    assert!(h.device.wait_cs(&h.client, h.ctx, gfx(), 1, 0).unwrap());

    let stream = ChunkWriter::new()
        .dependency(h.ctx, gfx(), 1, false)
        .cmd_buf(gfx(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    let sub = h.device.prepare(&h.client, h.ctx, &stream, None).unwrap();
    assert!(sub.leader().unwrap().sync().is_empty());
}

#[test]
fn test_busy_history_slot_is_never_reused() {
    let h = Harness::with_config(CsConfig {
        history_depth: 2,
        ..CsConfig::default()
    });
    let first = h.device.submit(&h.client, h.ctx, &gfx_stream(), None).unwrap();

    // Both pass dependency resolution while seq 2 is still unassigned.
    let a = h.device.prepare(&h.client, h.ctx, &gfx_stream(), None).unwrap();
    let b = h.device.prepare(&h.client, h.ctx, &gfx_stream(), None).unwrap();
    assert_eq!(a.commit(), Ok(2));

    // Seq 3 would take the slot of the first submission, which has not run.
    h.client.interrupt().raise();
    assert_eq!(b.commit(), Err(Error::Interrupted));
    assert!(h.client.interrupt().take());
    assert!(!h.device.wait_cs(&h.client, h.ctx, gfx(), first, 0).unwrap());
    let ctx = h.client.context(h.ctx).unwrap();
    assert_eq!(ctx.history().last_seq(gfx()), 2);
    assert_eq!(h.gfx.pending(), 2);

    assert_eq!(h.drain(), 2);
    assert!(h.device.wait_cs(&h.client, h.ctx, gfx(), first, 0).unwrap());
    assert_eq!(
        h.device.submit(&h.client, h.ctx, &gfx_stream(), None),
        Ok(3)
    );
}

#[test]
fn test_scheduled_dependency_uses_scheduled_fence() {
    let h = Harness::new();
    let seq = h.device.submit(&h.client, h.ctx, &gfx_stream(), None).unwrap();
    let other = h.device.create_context(&h.client).unwrap();
    let stream = ChunkWriter::new()
        .dependency(h.ctx, gfx(), seq, true)
        .cmd_buf(compute(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();

    let finished = h
        .device
        .query_fence(&h.client, h.ctx, gfx(), seq)
        .unwrap()
        .unwrap();
    let sub = h.device.prepare(&h.client, other, &stream, None).unwrap();
    let sync = sub.leader().unwrap().sync();
    assert_eq!(sync.len(), 1);
    assert!(!sync.iter().any(|f| Arc::ptr_eq(f, &finished)));
}

#[test]
fn test_implicit_sync_between_contexts() {
    let h = Harness::new();
    let (shared, _) = h.bo(BoDesc::gtt(PAGE_SIZE));
    let (explicit, _) = h.bo(BoDesc::gtt(PAGE_SIZE).with_flags(BoFlags::EXPLICIT_SYNC));
    let writer = ChunkWriter::new()
        .bo_list(&[(shared, 0), (explicit, 0)])
        .cmd_buf(gfx(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    let seq = h.device.submit(&h.client, h.ctx, &writer, None).unwrap();
    let fence = h
        .device
        .query_fence(&h.client, h.ctx, gfx(), seq)
        .unwrap()
        .unwrap();

    // Same context: no implicit wait.
    let sub = h.device.prepare(&h.client, h.ctx, &writer, None).unwrap();
    assert!(sub.leader().unwrap().sync().is_empty());
    drop(sub);

    let other = h.device.create_context(&h.client).unwrap();
    let stream = ChunkWriter::new()
        .bo_list(&[(shared, 0)])
        .cmd_buf(compute(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    let sub = h.device.prepare(&h.client, other, &stream, None).unwrap();
    assert!(sub
        .leader()
        .unwrap()
        .sync()
        .iter()
        .any(|f| Arc::ptr_eq(f, &fence)));
    drop(sub);

    let stream = ChunkWriter::new()
        .bo_list(&[(explicit, 0)])
        .cmd_buf(compute(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    let sub = h.device.prepare(&h.client, other, &stream, None).unwrap();
    assert!(sub.leader().unwrap().sync().is_empty());
}

#[test]
fn test_binary_syncobj_signal_and_wait() {
    let h = Harness::new();
    let syncobj = h.device.create_syncobj(&h.client).unwrap();
    let stream = ChunkWriter::new()
        .cmd_buf(gfx(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .syncobj_out(&[syncobj])
        .finish();
    h.device.submit(&h.client, h.ctx, &stream, None).unwrap();

    let fence = h.client.syncobj(syncobj).unwrap().fence().unwrap();
    assert!(!fence.is_signaled());

    let waiter = ChunkWriter::new()
        .syncobj_in(&[syncobj])
        .cmd_buf(compute(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    let seq = h.device.submit(&h.client, h.ctx, &waiter, None).unwrap();
    assert_eq!(h.compute.run_ready(), 0);

    h.drain();
    assert!(fence.is_signaled());
    assert!(h.device.wait_cs(&h.client, h.ctx, compute(), seq, 0).unwrap());
}

#[test]
fn test_timeline_points() {
    let h = Harness::new();
    let syncobj = h.device.create_syncobj(&h.client).unwrap();
    let point = |point| SyncobjDesc {
        handle: syncobj,
        flags: 0,
        point,
    };
    let signal = ChunkWriter::new()
        .cmd_buf(gfx(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .timeline_signal(&[point(3)])
        .finish();
    h.device.submit(&h.client, h.ctx, &signal, None).unwrap();
    assert_eq!(h.client.syncobj(syncobj).unwrap().last_point(), 3);

    let wait = ChunkWriter::new()
        .timeline_wait(&[point(2)])
        .cmd_buf(compute(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    let sub = h.device.prepare(&h.client, h.ctx, &wait, None).unwrap();
    assert_eq!(sub.leader().unwrap().sync().len(), 1);
    drop(sub);

    let unsubmitted = ChunkWriter::new()
        .timeline_wait(&[point(5)])
        .cmd_buf(compute(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    assert_eq!(
        h.device.submit(&h.client, h.ctx, &unsubmitted, None),
        Err(Error::InvalidArgument)
    );

    // Waiting for submission gives up once the client is interrupted.
    let wait_submit = ChunkWriter::new()
        .timeline_wait(&[SyncobjDesc {
            flags: SyncobjFlags::WAIT_FOR_SUBMIT.bits(),
            ..point(5)
        }])
        .cmd_buf(compute(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .finish();
    h.client.interrupt().raise();
    assert_eq!(
        h.device.submit(&h.client, h.ctx, &wait_submit, None),
        Err(Error::Interrupted)
    );
}

#[test]
fn test_one_signal_chunk_per_submission() {
    let h = Harness::new();
    let syncobj = h.device.create_syncobj(&h.client).unwrap();
    let stream = ChunkWriter::new()
        .cmd_buf(gfx(), GpuAddr::new(0x1000), 64, IbFlags::empty())
        .syncobj_out(&[syncobj])
        .syncobj_out(&[syncobj])
        .finish();
    assert_eq!(
        h.device.submit(&h.client, h.ctx, &stream, None),
        Err(Error::Malformed(Malformed::DuplicateSignalChunk))
    );
    assert!(h.client.syncobj(syncobj).unwrap().fence().is_none());
}

#[test]
fn test_wait_any_and_all() {
    let h = Harness::new();
    let a = h.device.submit(&h.client, h.ctx, &gfx_stream(), None).unwrap();
    let b = h
        .device
        .submit(
            &h.client,
            h.ctx,
            &ChunkWriter::new()
                .cmd_buf(compute(), GpuAddr::new(0x1000), 64, IbFlags::empty())
                .finish(),
            None,
        )
        .unwrap();
    let queries = [
        FenceQuery {
            ctx: h.ctx,
            key: compute(),
            seq: b,
        },
        FenceQuery {
            ctx: h.ctx,
            key: gfx(),
            seq: a,
        },
    ];

    let any = h.device.wait_fences(&h.client, &queries, false, 0).unwrap();
    assert!(!any.signaled);

    h.gfx.inject_fault();
    h.gfx.run_ready();
    let any = h.device.wait_fences(&h.client, &queries, false, 0).unwrap();
    assert!(any.signaled);
    assert_eq!(any.first_index, 1);
    assert_eq!(any.error, Some(Error::Timeout));

    let all = h.device.wait_fences(&h.client, &queries, true, 0).unwrap();
    assert!(!all.signaled);

    h.compute.run_ready();
    let all = h.device.wait_fences(&h.client, &queries, true, 0).unwrap();
    assert!(all.signaled);
    assert_eq!(all.error, Some(Error::Timeout));

    assert_eq!(
        h.device.wait_fences(&h.client, &[], true, 0),
        Err(Error::InvalidArgument)
    );
}
