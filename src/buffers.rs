//! Hardware buffer slots.
//!
//! The arena owns a fixed number of frame buffers shared with the SDK. Each
//! slot carries a lifecycle tag:
//!
//! ```text
//! Unallocated -> Allocated -> Submitted -> Filled -> (copied) Submitted
//!      ^                                                    |
//!      +-------------------------- free --------------------+
//! ```
//!
//! The SDK borrows a slot between submission and fill; the driver copies the
//! filled data out and resubmits immediately. Slots are filled in the order
//! they were submitted.

use parking_lot::Mutex;
use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::error::{AppResult, DriverError};
use crate::sdk::{BufferHandle, CameraSdk};

/// Where a slot is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No memory and no SDK handle.
    Unallocated,
    /// Memory and handle held by the driver.
    Allocated,
    /// Lent to the SDK, waiting for a frame.
    Submitted,
    /// Written by the hardware, waiting to be copied.
    Filled,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    handle: Option<BufferHandle>,
    data: Vec<u16>,
}

/// A filled slot's pixels, borrowed for copying.
#[derive(Debug)]
pub struct FilledFrame<'a> {
    pub slot: usize,
    pub width: u32,
    pub height: u32,
    pub pixels: &'a [u16],
}

/// Fixed set of hardware buffer slots.
#[derive(Debug)]
pub struct BufferArena {
    slots: Vec<Slot>,
    width: u32,
    height: u32,
    /// Submitted slots, oldest first.
    submitted: VecDeque<usize>,
}

impl BufferArena {
    pub fn new(count: usize) -> Self {
        Self {
            slots: (0..count)
                .map(|_| Slot {
                    state: SlotState::Unallocated,
                    handle: None,
                    data: Vec::new(),
                })
                .collect(),
            width: 0,
            height: 0,
            submitted: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }

    pub fn states(&self) -> Vec<SlotState> {
        self.slots.iter().map(|s| s.state).collect()
    }

    /// Make reserved buffers the arena's slots, in the Allocated state.
    /// Slots beyond the number of buffers stay Unallocated.
    pub fn install(&mut self, buffers: AllocatedBuffers) {
        self.width = buffers.width;
        self.height = buffers.height;
        self.submitted.clear();
        let mut reserved = buffers.buffers.into_iter();
        for slot in &mut self.slots {
            match reserved.next() {
                Some((handle, data)) => {
                    slot.handle = Some(handle);
                    slot.data = data;
                    slot.state = SlotState::Allocated;
                }
                None => {
                    slot.handle = None;
                    slot.data = Vec::new();
                    slot.state = SlotState::Unallocated;
                }
            }
        }
    }

    fn unsubmitted(&self) -> Vec<(usize, BufferHandle)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Allocated)
            .filter_map(|(index, s)| s.handle.map(|h| (index, h)))
            .collect()
    }

    fn mark_submitted(&mut self, index: usize, handle: BufferHandle) {
        if let Some(slot) = self.slots.get_mut(index) {
            if slot.state == SlotState::Allocated && slot.handle == Some(handle) {
                slot.state = SlotState::Submitted;
                self.submitted.push_back(index);
            }
        }
    }

    fn submit(&mut self, sdk: &dyn CameraSdk, index: usize) -> AppResult<()> {
        let slot = &mut self.slots[index];
        let Some(handle) = slot.handle else {
            return Ok(());
        };
        sdk.submit_buffer(handle, self.width, self.height)?;
        slot.state = SlotState::Submitted;
        self.submitted.push_back(index);
        Ok(())
    }

    /// Return a copied slot to the SDK. A refused slot drops back to
    /// Allocated and stays out of the rotation until the next arm.
    pub fn resubmit(&mut self, sdk: &dyn CameraSdk, slot: usize) -> AppResult<()> {
        if self.slots.get(slot).map(|s| s.state) != Some(SlotState::Filled) {
            return Ok(());
        }
        let result = self.submit(sdk, slot);
        if result.is_err() {
            self.slots[slot].state = SlotState::Allocated;
        }
        result
    }

    /// Simulated hardware write: fill the oldest submitted slot.
    /// Returns the slot index, or `None` when nothing is submitted.
    pub fn fill_next(&mut self, pixels: &[u16]) -> Option<usize> {
        let index = self.submitted.pop_front()?;
        let slot = &mut self.slots[index];
        let n = slot.data.len().min(pixels.len());
        slot.data[..n].copy_from_slice(&pixels[..n]);
        slot.state = SlotState::Filled;
        Some(index)
    }

    /// Pixels of a filled slot. `None` if the slot is out of range or not Filled.
    pub fn filled(&self, slot: usize) -> Option<FilledFrame<'_>> {
        let s = self.slots.get(slot)?;
        (s.state == SlotState::Filled).then(|| FilledFrame {
            slot,
            width: self.width,
            height: self.height,
            pixels: &s.data,
        })
    }

    /// Return every slot to Unallocated, handing back the SDK handles to free.
    pub fn take_all(&mut self) -> ReleasedBuffers {
        let cancel = self.slots.iter().any(|s| s.state == SlotState::Submitted);
        let handles = self
            .slots
            .iter_mut()
            .filter_map(|slot| {
                slot.state = SlotState::Unallocated;
                slot.data = Vec::new();
                slot.handle.take()
            })
            .collect();
        self.submitted.clear();
        ReleasedBuffers { cancel, handles }
    }

    pub fn all_unallocated(&self) -> bool {
        self.slots.iter().all(|s| s.state == SlotState::Unallocated)
    }
}

/// Buffers reserved from the SDK but not yet installed in an arena.
#[derive(Debug)]
pub struct AllocatedBuffers {
    width: u32,
    height: u32,
    buffers: Vec<(BufferHandle, Vec<u16>)>,
}

impl AllocatedBuffers {
    /// Reserve memory for `count` frames of `width` x `height` and register each
    /// with the SDK. On failure the buffers reserved so far are freed again.
    pub fn reserve(sdk: &dyn CameraSdk, count: usize, width: u32, height: u32) -> AppResult<Self> {
        let mut reserved = Self {
            width,
            height,
            buffers: Vec::with_capacity(count),
        };
        if let Err(e) = reserved.fill(sdk, count) {
            ReleasedBuffers {
                cancel: false,
                handles: reserved.buffers.into_iter().map(|(h, _)| h).collect(),
            }
            .free(sdk);
            return Err(e);
        }
        debug!(slots = count, width, height, "hardware buffers allocated");
        Ok(reserved)
    }

    fn fill(&mut self, sdk: &dyn CameraSdk, count: usize) -> AppResult<()> {
        let pixels = self.width as usize * self.height as usize;
        let bytes = pixels * std::mem::size_of::<u16>();
        for index in 0..count {
            let mut data = Vec::new();
            data.try_reserve_exact(pixels).map_err(|e| {
                DriverError::OutOfMemory(format!("hardware buffer {index} ({bytes} bytes): {e}"))
            })?;
            data.resize(pixels, 0);
            let handle = sdk.allocate_buffer(bytes)?;
            self.buffers.push((handle, data));
        }
        Ok(())
    }
}

/// SDK handles taken out of an arena, to be freed without the arena locked.
#[derive(Debug)]
#[must_use]
pub struct ReleasedBuffers {
    cancel: bool,
    handles: Vec<BufferHandle>,
}

impl ReleasedBuffers {
    /// Cancel pending transfers if any slot was submitted, then free every
    /// handle. SDK errors are logged.
    pub fn free(self, sdk: &dyn CameraSdk) {
        if self.cancel {
            if let Err(e) = sdk.cancel_images() {
                warn!(error = %e, "cancel images failed");
            }
        }
        for handle in self.handles {
            if let Err(e) = sdk.free_buffer(handle) {
                warn!(error = %e, ?handle, "free buffer failed");
            }
        }
    }
}

/// Hand every Allocated slot to the SDK. The arena is only locked to read the
/// slots and to record each submission, never across an SDK call.
pub fn submit_all(arena: &Mutex<BufferArena>, sdk: &dyn CameraSdk) -> AppResult<()> {
    let (width, height, pending) = {
        let arena = arena.lock();
        (arena.width, arena.height, arena.unsubmitted())
    };
    for (index, handle) in pending {
        sdk.submit_buffer(handle, width, height)?;
        arena.lock().mark_submitted(index, handle);
    }
    Ok(())
}
