//! # Clients
//!
//! Per-process state: the GPU VM, handle tables for every object the
//! process can name, and the interrupt flag that aborts its waits.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use ember_core::{Error, GpuAddr, InterruptFlag, Result};
use ember_mem::{BufferObject, GpuVm};
use spin::Mutex;

use crate::bo_list::BoList;
use crate::context::Context;
use crate::syncobj::SyncObject;

// =============================================================================
// HANDLE TABLE
// =============================================================================

#[derive(Debug)]
struct TableInner<T> {
    objects: BTreeMap<u32, T>,
    next: u32,
}

/// Maps small integer handles to shared objects
#[derive(Debug)]
pub struct HandleTable<T> {
    inner: Mutex<TableInner<T>>,
}

impl<T: Clone> HandleTable<T> {
    /// Create an empty table; handle 0 is never used
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                objects: BTreeMap::new(),
                next: 1,
            }),
        }
    }

    /// Insert `object`, returning its handle
    pub fn insert(&self, object: T) -> Result<u32> {
        let mut inner = self.inner.lock();
        let handle = inner.next;
        inner.next = handle.checked_add(1).ok_or(Error::OutOfMemory)?;
        inner.objects.insert(handle, object);
        Ok(handle)
    }

    /// Look up `handle`
    pub fn get(&self, handle: u32) -> Result<T> {
        self.inner
            .lock()
            .objects
            .get(&handle)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    /// Remove `handle`
    pub fn remove(&self, handle: u32) -> Result<T> {
        self.inner
            .lock()
            .objects
            .remove(&handle)
            .ok_or(Error::InvalidHandle)
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }
}

impl<T: Clone> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CLIENT
// =============================================================================

/// Shared context save area of a client
#[derive(Debug, Clone)]
pub struct ContextArea {
    /// Backing buffer, pinned
    pub bo: Arc<BufferObject>,
    /// Where it is mapped in the client VM
    pub va: GpuAddr,
}

/// One process using the device
#[derive(Debug)]
pub struct Client {
    pid: u32,
    vm: GpuVm,
    csa: Option<ContextArea>,
    interrupt: InterruptFlag,
    pub(crate) bos: HandleTable<Arc<BufferObject>>,
    pub(crate) syncobjs: HandleTable<Arc<SyncObject>>,
    pub(crate) bo_lists: HandleTable<Arc<BoList>>,
    pub(crate) contexts: HandleTable<Arc<Context>>,
}

impl Client {
    pub(crate) fn new(pid: u32, vm: GpuVm, csa: Option<ContextArea>) -> Self {
        Self {
            pid,
            vm,
            csa,
            interrupt: InterruptFlag::new(),
            bos: HandleTable::new(),
            syncobjs: HandleTable::new(),
            bo_lists: HandleTable::new(),
            contexts: HandleTable::new(),
        }
    }

    /// Process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// GPU virtual address space
    pub fn vm(&self) -> &GpuVm {
        &self.vm
    }

    /// Context save area, if allocated
    pub fn csa(&self) -> Option<&ContextArea> {
        self.csa.as_ref()
    }

    /// Flag a pending signal aborts this client's waits with
    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    /// Buffer object by handle
    pub fn bo(&self, handle: u32) -> Result<Arc<BufferObject>> {
        self.bos.get(handle)
    }

    /// Sync object by handle
    pub fn syncobj(&self, handle: u32) -> Result<Arc<SyncObject>> {
        self.syncobjs.get(handle)
    }

    /// Buffer list by handle
    pub fn bo_list(&self, handle: u32) -> Result<Arc<BoList>> {
        self.bo_lists.get(handle)
    }

    /// Context by handle
    pub fn context(&self, handle: u32) -> Result<Arc<Context>> {
        self.contexts.get(handle)
    }

    /// Drop a buffer handle; the buffer lives on while in use
    pub fn close_bo(&self, handle: u32) -> Result<()> {
        self.bos.remove(handle).map(|_| ())
    }

    /// Drop a context handle
    pub fn destroy_context(&self, handle: u32) -> Result<()> {
        self.contexts.remove(handle).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_table() {
        let table: HandleTable<u64> = HandleTable::new();
        let a = table.insert(10).unwrap();
        let b = table.insert(20).unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(table.get(b), Ok(20));
        assert_eq!(table.remove(a), Ok(10));
        assert_eq!(table.get(a), Err(Error::InvalidHandle));
        assert_eq!(table.len(), 1);
    }
}
