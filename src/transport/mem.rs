//! Staging memory shared by a connector's device side and its proxy.
//!
//! The buffer is split into `slots` equal slots used round robin. Step `s`
//! lives in slot `s % slots`. Two cumulative counters hand slots back and
//! forth:
//!
//! - `posted`: steps whose slot the producer has filled
//! - `consumed`: steps whose slot the consumer has drained
//!
//! The producer may fill step `s` once `consumed + slots > s`; the consumer
//! may read step `s` once `posted > s`. For a send connector the device
//! produces and the proxy consumes; for a receive connector it is the other
//! way around.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytemuck::Pod;

use crate::buffer::{Region, SharedBuffer};
use crate::error::{Error, Result};
use crate::reduce::PACK_BYTES;
use crate::spin::{Backoff, SpinCounter, StepFlag};

/// Slotted staging buffer plus its step counters.
#[derive(Debug)]
pub struct ConnectorMem {
    buffer: Arc<SharedBuffer>,
    slots: usize,
    slot_size: usize,
    sizes: Box<[AtomicUsize]>,
    posted: StepFlag,
    consumed: StepFlag,
}

impl ConnectorMem {
    /// Split `buff_size` bytes into `slots` pack-aligned slots.
    pub fn new(buff_size: usize, slots: usize) -> Result<Self> {
        if slots == 0 {
            return Err(Error::InvalidBuffer);
        }
        let slot_size = (buff_size / slots) & !(PACK_BYTES - 1);
        if slot_size == 0 {
            return Err(Error::InvalidBuffer);
        }
        Ok(ConnectorMem {
            buffer: Arc::new(SharedBuffer::new(slot_size * slots)),
            slots,
            slot_size,
            sizes: (0..slots).map(|_| AtomicUsize::new(0)).collect(),
            posted: StepFlag::new(0),
            consumed: StepFlag::new(0),
        })
    }

    /// Number of slots.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Capacity of one slot in bytes.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &Arc<SharedBuffer> {
        &self.buffer
    }

    fn slot_of(&self, step: u64) -> usize {
        (step % self.slots as u64) as usize
    }

    /// Full-capacity region of the slot holding `step`.
    pub fn slot_region(&self, step: u64) -> Result<Region> {
        let start = self.slot_of(step) * self.slot_size;
        Region::new(Arc::clone(&self.buffer), start..start + self.slot_size)
    }

    /// Byte offset of the slot holding `step`.
    pub fn slot_offset(&self, step: u64) -> usize {
        self.slot_of(step) * self.slot_size
    }

    /// Steps posted so far.
    pub fn posted(&self) -> u64 {
        self.posted.load()
    }

    /// Steps consumed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed.load()
    }

    /// Whether the producer may fill `step` now.
    pub fn is_free(&self, step: u64) -> bool {
        self.consumed.load() + self.slots as u64 > step
    }

    /// Whether the consumer may read `step` now.
    pub fn is_posted(&self, step: u64) -> bool {
        self.posted.load() > step
    }

    /// Mark `step` filled with `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds the slot capacity.
    pub fn post(&self, step: u64, size: usize) {
        assert!(size <= self.slot_size, "step payload larger than its slot");
        self.sizes[self.slot_of(step)].store(size, Ordering::Relaxed);
        self.posted.publish(step + 1);
    }

    /// Bytes posted for `step`. Only meaningful once the step is posted.
    pub fn size_of(&self, step: u64) -> usize {
        self.sizes[self.slot_of(step)].load(Ordering::Relaxed)
    }

    /// Mark `step` drained, handing its slot back to the producer.
    pub fn consume(&self, step: u64) {
        self.consumed.publish(step + 1);
    }

    /// Spin until `step` is posted and return its size.
    pub fn wait_posted<B: Backoff + ?Sized>(&self, step: u64, backoff: &mut B) -> usize {
        self.posted.wait_for(step + 1, backoff);
        self.size_of(step)
    }

    /// Spin until the slot for `step` is free.
    pub fn wait_free<B: Backoff + ?Sized>(&self, step: u64, backoff: &mut B) {
        let target = (step + 1).saturating_sub(self.slots as u64);
        self.consumed.wait_for(target, backoff);
    }
}

/// Device-side writer into a send connector.
///
/// Starts at the connector's current posted count, so successive operations
/// continue where the previous one stopped.
pub struct StepProducer<B: Backoff = SpinCounter> {
    mem: Arc<ConnectorMem>,
    step: u64,
    backoff: B,
}

impl StepProducer<SpinCounter> {
    /// Producer that spins with the default counter.
    pub fn new(mem: Arc<ConnectorMem>) -> Self {
        StepProducer::with_backoff(mem, SpinCounter::default())
    }
}

impl<B: Backoff> StepProducer<B> {
    /// Producer waiting through `backoff`.
    pub fn with_backoff(mem: Arc<ConnectorMem>, backoff: B) -> Self {
        let step = mem.posted();
        StepProducer { mem, step, backoff }
    }

    /// Next step this producer will fill.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Wait for a free slot, copy `data` into it and post it.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.mem.slot_size() {
            return Err(Error::InvalidBuffer);
        }
        self.mem.wait_free(self.step, &mut self.backoff);
        self.mem
            .buffer()
            .write(self.mem.slot_offset(self.step), data)?;
        self.mem.post(self.step, data.len());
        self.step += 1;
        Ok(())
    }

    /// Typed [`send`](Self::send).
    pub fn send_elems<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        self.send(bytemuck::cast_slice(data))
    }
}

/// Device-side reader from a receive connector.
pub struct StepConsumer<B: Backoff = SpinCounter> {
    mem: Arc<ConnectorMem>,
    step: u64,
    backoff: B,
}

impl StepConsumer<SpinCounter> {
    /// Consumer that spins with the default counter.
    pub fn new(mem: Arc<ConnectorMem>) -> Self {
        StepConsumer::with_backoff(mem, SpinCounter::default())
    }
}

impl<B: Backoff> StepConsumer<B> {
    /// Consumer waiting through `backoff`.
    pub fn with_backoff(mem: Arc<ConnectorMem>, backoff: B) -> Self {
        let step = mem.consumed();
        StepConsumer { mem, step, backoff }
    }

    /// Next step this consumer will read.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Wait for the next step, copy its payload into `out` and release it.
    ///
    /// Returns the payload size. `out` must hold at least that many bytes.
    pub fn recv(&mut self, out: &mut [u8]) -> Result<usize> {
        let size = self.mem.wait_posted(self.step, &mut self.backoff);
        let dst = out.get_mut(..size).ok_or(Error::InvalidBuffer)?;
        self.mem.buffer().read(self.mem.slot_offset(self.step), dst)?;
        self.mem.consume(self.step);
        self.step += 1;
        Ok(size)
    }

    /// Typed [`recv`](Self::recv); returns the number of whole elements read.
    pub fn recv_elems<T: Pod>(&mut self, out: &mut [T]) -> Result<usize> {
        let size = self.mem.wait_posted(self.step, &mut self.backoff);
        let elem = std::mem::size_of::<T>();
        if size % elem != 0 {
            return Err(Error::InvalidBuffer);
        }
        let dst = out.get_mut(..size / elem).ok_or(Error::InvalidBuffer)?;
        self.mem
            .buffer()
            .read_elems(self.mem.slot_offset(self.step), dst)?;
        self.mem.consume(self.step);
        self.step += 1;
        Ok(size / elem)
    }
}
