//! # Device
//!
//! Owns everything shared between clients: hardware queues, the memory
//! manager, the migration throttle, ticket and fence-context allocators,
//! and the recovery generation.
//!
//! ```text
//!   submit(client, ctx, bytes)
//!     │
//!     ├─ parse ──────▶ jobs, chunks, buffer list
//!     ├─ reserve ────▶ validation list locked and placed
//!     ├─ patch ──────▶ command buffers checked where required
//!     ├─ dependencies ▶ implicit fences folded into the gang
//!     └─ commit ─────▶ sequence number
//! ```
//!
//! Any failure before commit drops the [`Submission`], which undoes its
//! partial work.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use ember_core::{Clock, EngineKey, Error, FenceContexts, GpuAddr, Result, PAGE_SIZE};
use ember_mem::{
    BoDesc, BoRegistry, BufferObject, GpuVm, MemoryManager, MigrationThrottle, Ticket,
    TicketSource, UserMemory,
};
use spin::Mutex;

use crate::bo_list::BoList;
use crate::client::{Client, ContextArea};
use crate::config::CsConfig;
use crate::context::{Context, Entity};
use crate::parser::Submission;
use crate::queue::HwQueue;
use crate::syncobj::SyncObject;
use crate::wire::BoListEntry;

/// Size of a client's context save area
pub const CSA_SIZE: u64 = 128 * 1024;

/// Fixed VM address of the context save area
pub const CSA_VA: GpuAddr = GpuAddr::new(0xffff_0000_0000);

/// Per-client setup options
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientOptions {
    /// Give the VM a page-table root buffer
    pub vm_root: bool,
    /// Allocate and map a context save area
    pub context_area: bool,
}

/// Submission counters
#[derive(Debug, Clone, Default)]
pub struct CsStats {
    /// Submissions that received a sequence number
    pub submitted: u64,
    /// Submissions rejected
    pub rejected: u64,
    /// Rejections the caller may retry
    pub transient: u64,
}

/// A GPU as seen by the submission path
pub struct Device {
    config: CsConfig,
    clock: Arc<dyn Clock>,
    memory: Arc<dyn MemoryManager>,
    throttle: MigrationThrottle,
    registry: BoRegistry,
    tickets: TicketSource,
    fence_contexts: FenceContexts,
    queues: Mutex<BTreeMap<EngineKey, Arc<dyn HwQueue>>>,
    generation: AtomicU64,
    next_context: AtomicU64,
    stats: Mutex<CsStats>,
}

impl Device {
    /// Create a device with no queues
    pub fn new(
        config: CsConfig,
        clock: Arc<dyn Clock>,
        memory: Arc<dyn MemoryManager>,
    ) -> Result<Self> {
        config.validate()?;
        let throttle = MigrationThrottle::new(config.throttle());
        log::info!(
            "ember: gang size {}, history depth {}, move rate {} MB/s",
            config.max_gang_size,
            config.history_depth,
            config.move_rate_mbps
        );
        Ok(Self {
            config,
            clock,
            memory,
            throttle,
            registry: BoRegistry::new(),
            tickets: TicketSource::new(),
            fence_contexts: FenceContexts::new(),
            queues: Mutex::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
            next_context: AtomicU64::new(1),
            stats: Mutex::new(CsStats::default()),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Get configuration
    pub fn config(&self) -> &CsConfig {
        &self.config
    }

    /// Time source for waits and the throttle
    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    /// Memory manager
    pub fn memory(&self) -> &dyn MemoryManager {
        &*self.memory
    }

    /// Migration throttle
    pub fn throttle(&self) -> &MigrationThrottle {
        &self.throttle
    }

    /// Buffer object allocator
    pub fn registry(&self) -> &BoRegistry {
        &self.registry
    }

    /// Current recovery generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn next_ticket(&self) -> Ticket {
        self.tickets.next()
    }

    /// Get statistics
    pub fn stats(&self) -> CsStats {
        self.stats.lock().clone()
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Register a hardware queue; contexts created afterwards can use it
    pub fn add_queue(&self, queue: Arc<dyn HwQueue>) -> Result<()> {
        let key = queue.key();
        let mut queues = self.queues.lock();
        if queues.contains_key(&key) {
            return Err(Error::InvalidArgument);
        }
        queues.insert(key, queue);
        log::debug!("ember: queue {} registered", key);
        Ok(())
    }

    /// Open a client with a bare VM
    pub fn open_client(&self, pid: u32) -> Result<Arc<Client>> {
        self.open_client_with(pid, ClientOptions::default())
    }

    /// Open a client
    pub fn open_client_with(&self, pid: u32, opts: ClientOptions) -> Result<Arc<Client>> {
        let vm = if opts.vm_root {
            GpuVm::with_root(self.registry.create(BoDesc::vram(PAGE_SIZE))?)
        } else {
            GpuVm::new()
        };

        let csa = if opts.context_area {
            let bo = self.registry.create(BoDesc::vram(CSA_SIZE))?;
            self.pin_kernel_bo(&bo)?;
            vm.map(CSA_VA, &bo, 0, CSA_SIZE)?;
            Some(ContextArea { bo, va: CSA_VA })
        } else {
            None
        };

        log::debug!("ember: client {} opened", pid);
        Ok(Arc::new(Client::new(pid, vm, csa)))
    }

    fn pin_kernel_bo(&self, bo: &BufferObject) -> Result<()> {
        let ticket = self.next_ticket();
        bo.resv().lock(ticket, false, None)?;
        let pinned = self.memory.pin(bo, ticket);
        bo.resv().unlock(ticket);
        let moved = pinned?;
        self.throttle.report(moved.bytes, moved.visible_bytes);
        Ok(())
    }

    /// Create a context with an entity on every registered queue
    pub fn create_context(&self, client: &Client) -> Result<u32> {
        let entities: BTreeMap<EngineKey, Arc<Entity>> = self
            .queues
            .lock()
            .iter()
            .map(|(key, queue)| {
                let entity = Entity::new(*key, self.fence_contexts.alloc(2), queue.clone());
                (*key, Arc::new(entity))
            })
            .collect();
        let global_id = self.next_context.fetch_add(1, Ordering::Relaxed);
        let ctx = Context::new(
            global_id,
            self.generation(),
            entities,
            self.config.history_depth,
        )?;
        client.contexts.insert(Arc::new(ctx))
    }

    /// Allocate a buffer object for `client`
    pub fn create_bo(&self, client: &Client, desc: BoDesc) -> Result<u32> {
        let bo = self.registry.create(desc)?;
        client.bos.insert(bo)
    }

    /// Wrap process memory in a buffer object
    pub fn create_userptr(
        &self,
        client: &Client,
        size: u64,
        memory: Arc<dyn UserMemory>,
    ) -> Result<u32> {
        if memory.owner() != client.pid() {
            return Err(Error::PermissionDenied);
        }
        let bo = self.registry.create_userptr(size, memory)?;
        client.bos.insert(bo)
    }

    /// Create an unsignalled sync object
    pub fn create_syncobj(&self, client: &Client) -> Result<u32> {
        client.syncobjs.insert(Arc::new(SyncObject::new()))
    }

    /// Create a reusable buffer list from `(handle, priority)` pairs
    pub fn create_bo_list(&self, client: &Client, entries: &[(u32, u32)]) -> Result<u32> {
        let entries: alloc::vec::Vec<BoListEntry> = entries
            .iter()
            .map(|&(bo_handle, bo_priority)| BoListEntry {
                bo_handle,
                bo_priority,
            })
            .collect();
        let list = BoList::resolve(client, &entries)?;
        client.bo_lists.insert(Arc::new(list))
    }

    /// Map `size` bytes of a buffer at `va` in the client VM
    pub fn map(
        &self,
        client: &Client,
        bo_handle: u32,
        va: GpuAddr,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        let bo = client.bo(bo_handle)?;
        client.vm().map(va, &bo, offset, size)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Clear a context after a hang and bring it to the current generation
    pub fn reset_context(&self, client: &Client, ctx: u32) -> Result<()> {
        client.context(ctx)?.reset(self.generation());
        Ok(())
    }

    /// Start a new recovery generation.
    ///
    /// Every context created before must be reset before it can submit
    /// again.
    pub fn recover(&self, vram_lost: bool) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        log::warn!(
            "ember: recovery, generation {}{}",
            generation,
            if vram_lost { ", vram lost" } else { "" }
        );
        generation
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Run a submission up to, but not including, commit
    pub fn prepare<'a>(
        &'a self,
        client: &'a Client,
        ctx: u32,
        bytes: &[u8],
        bo_list: Option<u32>,
    ) -> Result<Submission<'a>> {
        let mut sub = Submission::parse(self, client, ctx, bytes, bo_list)?;
        let staged = sub.reserve().and_then(|()| sub.patch());
        let moved = sub.moved();
        self.throttle.report(moved.bytes, moved.visible_bytes);
        staged?;
        sub.resolve_dependencies()?;
        Ok(sub)
    }

    /// Submit a chunk stream; returns the sequence number of the gang leader
    pub fn submit(
        &self,
        client: &Client,
        ctx: u32,
        bytes: &[u8],
        bo_list: Option<u32>,
    ) -> Result<u64> {
        let result = self
            .prepare(client, ctx, bytes, bo_list)
            .and_then(Submission::commit);

        let mut stats = self.stats.lock();
        match result {
            Ok(_) => stats.submitted += 1,
            Err(e) => {
                stats.rejected += 1;
                if e.is_retryable() {
                    stats.transient += 1;
                }
                log::debug!("client {}: submission failed: {}", client.pid(), e);
            },
        }
        result
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("queues", &self.queues.lock().len())
            .field("generation", &self.generation())
            .finish()
    }
}
