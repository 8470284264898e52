//! # Sync Objects
//!
//! Client-visible synchronization objects. A sync object carries either a
//! single fence (binary use) or a timeline of `(point, fence)` pairs. Point
//! zero always means the binary fence, which on a timeline is the fence of
//! the newest point.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use ember_core::{Clock, Error, FenceRef, InterruptFlag, Result};
use spin::Mutex;

#[derive(Debug, Default)]
struct SyncObjectState {
    fence: Option<FenceRef>,
    points: BTreeMap<u64, FenceRef>,
    last_point: u64,
    /// Every point up to here has signalled and been dropped
    signaled_through: u64,
}

/// A binary or timeline sync object
#[derive(Debug, Default)]
pub struct SyncObject {
    state: Mutex<SyncObjectState>,
}

impl SyncObject {
    /// Create an empty sync object
    pub fn new() -> Self {
        Self::default()
    }

    /// Current binary fence
    pub fn fence(&self) -> Option<FenceRef> {
        self.state.lock().fence.clone()
    }

    /// Replace the binary fence
    pub fn replace(&self, fence: Option<FenceRef>) {
        self.state.lock().fence = fence;
    }

    /// Newest timeline point
    pub fn last_point(&self) -> u64 {
        self.state.lock().last_point
    }

    /// Attach `fence` at timeline `point`
    pub fn add_point(&self, point: u64, fence: FenceRef) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if point <= state.last_point {
            log::warn!(
                "syncobj: point {} added after {}, timeline not ordered",
                point,
                state.last_point
            );
        }
        while let Some(oldest) = state.points.first_entry() {
            if !oldest.get().is_signaled() || oldest.get().error().is_some() {
                break;
            }
            let (done, _) = oldest.remove_entry();
            state.signaled_through = done;
        }
        state.points.insert(point, fence.clone());
        state.last_point = state.last_point.max(point);
        state.fence = Some(fence);
    }

    /// Fence that completes `point`.
    ///
    /// `Ok(None)` means the point has already signalled. A point that was
    /// never submitted, or a binary object with no fence, is an error.
    pub fn find_fence(&self, point: u64) -> Result<Option<FenceRef>> {
        let state = self.state.lock();
        if point == 0 {
            return state.fence.clone().map(Some).ok_or(Error::InvalidArgument);
        }
        if point > state.last_point {
            return Err(Error::InvalidArgument);
        }
        if point <= state.signaled_through {
            return Ok(None);
        }
        Ok(state.points.range(point..).next().map(|(_, f)| f.clone()))
    }

    /// Like [`find_fence`](Self::find_fence), but wait for the point to be
    /// submitted first
    pub fn wait_for_submit(
        &self,
        point: u64,
        clock: &dyn Clock,
        timeout_ns: u64,
        interrupt: Option<&InterruptFlag>,
    ) -> Result<Option<FenceRef>> {
        let deadline = clock.now_ns().saturating_add(timeout_ns);
        loop {
            match self.find_fence(point) {
                Err(Error::InvalidArgument) => {},
                other => return other,
            }
            if interrupt.is_some_and(InterruptFlag::is_raised) {
                return Err(Error::Interrupted);
            }
            if clock.now_ns() >= deadline {
                return Err(Error::Timeout);
            }
            ember_core::sync::relax();
        }
    }
}

/// A sync object to signal once the submission is dispatched
#[derive(Debug, Clone)]
pub struct PostDep {
    /// Target object
    pub syncobj: Arc<SyncObject>,
    /// Timeline point; zero replaces the binary fence
    pub point: u64,
}

impl PostDep {
    /// Signal the dependency with `fence`
    pub fn signal(&self, fence: &FenceRef) {
        if self.point == 0 {
            self.syncobj.replace(Some(fence.clone()));
        } else {
            self.syncobj.add_point(self.point, fence.clone());
        }
    }
}
