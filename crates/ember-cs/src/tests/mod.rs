//! End-to-end submission tests.
//!
//! Each test drives a [`Device`] with host queues and a [`HeapManager`]
//! through the public entry points, then drains the queues by hand.

mod stress;
mod sync;

use alloc::sync::Arc;

use ember_core::{
    Clock, EngineKey, EngineType, ManualClock, Result, ValidationFailure, PAGE_SIZE,
};
use ember_mem::{BoDesc, BufferObject, HeapConfig, HeapManager};

use crate::client::Client;
use crate::config::CsConfig;
use crate::device::Device;
use crate::queue::{CommandValidator, SoftwareQueue};

pub(crate) fn gfx() -> EngineKey {
    EngineKey::new(EngineType::Gfx, 0, 0)
}

pub(crate) fn compute() -> EngineKey {
    EngineKey::new(EngineType::Compute, 0, 0)
}

pub(crate) fn decode() -> EngineKey {
    EngineKey::new(EngineType::VideoDecode, 0, 0)
}

/// Rejects command streams whose first byte is 0xff
#[derive(Debug)]
pub(crate) struct FirstByteCheck;

impl CommandValidator for FirstByteCheck {
    fn validate(&self, _key: EngineKey, commands: &mut [u8]) -> Result<()> {
        if commands.first() == Some(&0xff) {
            return Err(ValidationFailure::Rejected.into());
        }
        Ok(())
    }
}

pub(crate) struct Harness {
    pub device: Device,
    pub gfx: Arc<SoftwareQueue>,
    pub compute: Arc<SoftwareQueue>,
    pub decode: Arc<SoftwareQueue>,
    pub client: Arc<Client>,
    pub ctx: u32,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Arc::new(ManualClock::new(0)), CsConfig::default())
    }

    pub fn with_config(config: CsConfig) -> Self {
        Self::build(Arc::new(ManualClock::new(0)), config)
    }

    pub fn build(clock: Arc<dyn Clock>, config: CsConfig) -> Self {
        let memory = Arc::new(HeapManager::new(HeapConfig::default()));
        let device = Device::new(config, clock, memory).unwrap();

        let gfx = Arc::new(SoftwareQueue::new(gfx()));
        let compute = Arc::new(SoftwareQueue::new(compute()));
        let decode =
            Arc::new(SoftwareQueue::new(decode()).with_validator(Arc::new(FirstByteCheck)));
        device.add_queue(gfx.clone()).unwrap();
        device.add_queue(compute.clone()).unwrap();
        device.add_queue(decode.clone()).unwrap();

        let client = device.open_client(100).unwrap();
        let ctx = device.create_context(&client).unwrap();
        Self {
            device,
            gfx,
            compute,
            decode,
            client,
            ctx,
        }
    }

    /// Create a buffer, returning its handle and the object
    pub fn bo(&self, desc: BoDesc) -> (u32, Arc<BufferObject>) {
        let handle = self.device.create_bo(&self.client, desc).unwrap();
        let bo = self.client.bo(handle).unwrap();
        (handle, bo)
    }

    /// Buffer of one page, mapped at `va`
    pub fn mapped_bo(&self, va: u64) -> (u32, Arc<BufferObject>) {
        let (handle, bo) = self.bo(BoDesc::gtt(PAGE_SIZE));
        self.device
            .map(&self.client, handle, ember_core::GpuAddr::new(va), 0, PAGE_SIZE)
            .unwrap();
        (handle, bo)
    }

    /// Run every queue until nothing is runnable
    pub fn drain(&self) -> usize {
        let mut total = 0;
        loop {
            let ran = self.gfx.run_ready() + self.compute.run_ready() + self.decode.run_ready();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }
}
