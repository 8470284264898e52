//! # Buffer Lists
//!
//! The explicit set of buffers a submission touches, built either from a
//! buffer-list chunk or ahead of time under a handle.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ember_core::{Error, Result};
use ember_mem::BufferObject;

use crate::client::Client;
use crate::wire;

/// Highest eviction priority a buffer may request
pub const MAX_PRIORITY: u32 = 32;

/// One buffer of a list
#[derive(Debug, Clone)]
pub struct BoListItem {
    /// Buffer
    pub bo: Arc<BufferObject>,
    /// Eviction priority
    pub priority: u32,
}

/// An explicit buffer list
#[derive(Debug, Clone, Default)]
pub struct BoList {
    items: Vec<BoListItem>,
}

impl BoList {
    /// Resolve wire entries against `client`'s handles.
    ///
    /// User-pointer buffers must belong to the calling process.
    pub fn resolve(client: &Client, entries: &[wire::BoListEntry]) -> Result<Self> {
        let mut items = Vec::new();
        items
            .try_reserve_exact(entries.len())
            .map_err(|_| Error::OutOfMemory)?;

        for entry in entries {
            let bo = client.bo(entry.bo_handle)?;
            if let Some(user) = bo.user_backing() {
                if user.memory().owner() != client.pid() {
                    log::debug!(
                        "bo list: userptr bo {} belongs to pid {}",
                        bo.id(),
                        user.memory().owner()
                    );
                    return Err(Error::PermissionDenied);
                }
            }
            items.push(BoListItem {
                bo,
                priority: entry.bo_priority.min(MAX_PRIORITY),
            });
        }
        Ok(Self { items })
    }

    /// Buffers in list order
    pub fn iter(&self) -> impl Iterator<Item = &BoListItem> {
        self.items.iter()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::PAGE_SIZE;
    use ember_mem::{BoDesc, BoRegistry, GpuVm, HostUserMemory};

    fn entry(bo_handle: u32, bo_priority: u32) -> wire::BoListEntry {
        wire::BoListEntry {
            bo_handle,
            bo_priority,
        }
    }

    #[test]
    fn test_resolve_clamps_priority() {
        let registry = BoRegistry::new();
        let client = Client::new(7, GpuVm::new(), None);
        let handle = client
            .bos
            .insert(registry.create(BoDesc::vram(PAGE_SIZE)).unwrap())
            .unwrap();

        let list = BoList::resolve(&client, &[entry(handle, 99)]).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().next().unwrap().priority, MAX_PRIORITY);
        assert_eq!(
            BoList::resolve(&client, &[entry(handle + 1, 0)]).unwrap_err(),
            Error::InvalidHandle
        );
    }

    #[test]
    fn test_foreign_userptr_refused() {
        let registry = BoRegistry::new();
        let client = Client::new(7, GpuVm::new(), None);
        let foreign = Arc::new(HostUserMemory::new(8, 0x100, 1));
        let bo = registry.create_userptr(PAGE_SIZE, foreign).unwrap();
        let handle = client.bos.insert(bo).unwrap();

        assert_eq!(
            BoList::resolve(&client, &[entry(handle, 0)]).unwrap_err(),
            Error::PermissionDenied
        );
    }
}
