//! Per-VCPU virtual interrupt bookkeeping.

use axaddrspace::HostPhysAddr;
use axerrno::{ax_err, AxResult};
use bitvec::prelude::{BitArray, Lsb0};
use spin::Mutex;

use crate::el2::IchState;
use crate::gic::{GicVirtIface, GIC_BASE_SPI, ICH_HCR_EN, ICH_HCR_UIE};

/// Number of virtual interrupt vectors tracked per VCPU.
pub const NUM_INTERRUPTS: u32 = 256;

const WORDS: usize = NUM_INTERRUPTS as usize / 64;

/// How a pending interrupt must be presented to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptType {
    /// Purely virtual, the guest's EOI only touches the virtual interface.
    Virtual,
    /// Backed by a physical interrupt that the guest deactivates on EOI.
    Physical,
}

/// A fixed-size set of interrupt vectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterruptBitmap {
    bits: BitArray<[u64; WORDS], Lsb0>,
}

impl InterruptBitmap {
    pub const fn new() -> Self {
        Self {
            bits: BitArray::ZERO,
        }
    }

    /// Adds `vector`. Vectors out of range are ignored.
    pub fn set(&mut self, vector: u32) {
        if vector < NUM_INTERRUPTS {
            self.bits.set(vector as usize, true);
        }
    }

    pub fn clear(&mut self, vector: u32) {
        if vector < NUM_INTERRUPTS {
            self.bits.set(vector as usize, false);
        }
    }

    pub fn test(&self, vector: u32) -> bool {
        vector < NUM_INTERRUPTS && self.bits[vector as usize]
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(false);
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    /// The lowest vector in the set that is not below `start`.
    pub fn first_from(&self, start: u32) -> Option<u32> {
        let start = start as usize;
        if start >= NUM_INTERRUPTS as usize {
            return None;
        }
        self.bits[start..]
            .first_one()
            .map(|offset| (start + offset) as u32)
    }

    /// Iterates over all vectors in the set in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter_ones().map(|vector| vector as u32)
    }
}

#[derive(Default)]
struct Pending {
    vectors: InterruptBitmap,
    physical: InterruptBitmap,
}

impl Pending {
    fn take(&mut self, vector: u32) -> InterruptType {
        self.vectors.clear(vector);
        if self.physical.test(vector) {
            self.physical.clear(vector);
            InterruptType::Physical
        } else {
            InterruptType::Virtual
        }
    }
}

/// Vectors waiting to be loaded into a list register.
///
/// Any thread may add vectors; only the VCPU's own resume path removes them.
#[derive(Default)]
pub struct InterruptTracker {
    pending: Mutex<Pending>,
}

impl InterruptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `vector` pending. Tracking a vector that is already pending
    /// has no further effect, except that a physical interrupt stays physical.
    pub fn track(&self, vector: u32, ty: InterruptType) -> AxResult {
        self.track_then(vector, ty, || ())
    }

    /// Marks `vector` pending and runs `f` before the tracker lock is
    /// released.
    pub fn track_then<T>(&self, vector: u32, ty: InterruptType, f: impl FnOnce() -> T) -> AxResult<T> {
        if vector >= NUM_INTERRUPTS {
            return ax_err!(InvalidInput, "interrupt vector out of range");
        }
        let mut pending = self.pending.lock();
        pending.vectors.set(vector);
        if ty == InterruptType::Physical {
            pending.physical.set(vector);
        }
        Ok(f())
    }

    /// Removes and returns the lowest pending vector.
    pub fn pop(&self) -> Option<(u32, InterruptType)> {
        let mut pending = self.pending.lock();
        let vector = pending.vectors.first_from(0)?;
        Some((vector, pending.take(vector)))
    }

    pub fn is_pending(&self, vector: u32) -> bool {
        self.pending.lock().vectors.test(vector)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().vectors.is_empty()
    }
}

/// Virtual interrupt state of one VCPU.
#[derive(Default)]
pub struct GichState {
    pub interrupt_tracker: InterruptTracker,
    /// Vectors held in a list register at the last VM exit.
    pub active_interrupts: Mutex<InterruptBitmap>,
}

impl GichState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves pending vectors into the empty list registers of `ich`.
    ///
    /// Returns whether vectors remain pending afterwards.
    pub fn maybe_interrupt(&self, gic: &dyn GicVirtIface, ich: &mut IchState) -> bool {
        let active = self.active_interrupts.lock();
        let mut pending = self.interrupt_tracker.pending.lock();
        let lr_mask = (1u64 << ich.num_lrs) - 1;
        let mut elrsr = ich.elrsr & lr_mask;
        let mut next = 0;
        while elrsr != 0 {
            let Some(vector) = pending.vectors.first_from(next) else {
                break;
            };
            next = vector + 1;
            // A vector still held by the guest stays pending until it is
            // deactivated.
            if active.test(vector) {
                continue;
            }
            let hardware = pending.take(vector) == InterruptType::Physical;
            // Lower numbers are higher priority. Step by 16, the coarsest
            // granularity a GIC may implement, so SGIs and PPIs win over SPIs.
            let priority = if vector < GIC_BASE_SPI { 0x00 } else { 0x10 };
            let lr_index = elrsr.trailing_zeros() as usize;
            ich.lr[lr_index] = gic.get_lr_from_vector(hardware, priority, vector);
            elrsr &= !(1 << lr_index);
        }
        ich.elrsr = (ich.elrsr & !lr_mask) | elrsr;
        !pending.vectors.is_empty()
    }

    /// Rebuilds the active set from the list registers saved at VM exit.
    pub fn update_active_interrupts(&self, gic: &dyn GicVirtIface, ich: &IchState) {
        let mut active = self.active_interrupts.lock();
        active.clear_all();
        for lr in ich.occupied_lrs() {
            active.set(gic.get_vector_from_lr(lr));
        }
    }
}

/// Lets a caller that may block release per-CPU state first.
pub trait StateInvalidator {
    /// Called before the current thread may block or migrate.
    fn invalidate(&mut self);
}

/// Loads a VCPU's [`IchState`] into the current CPU for the lifetime of the
/// guard, and saves it back when dropped.
pub struct AutoGich<'a> {
    gic: &'a dyn GicVirtIface,
    ich_state: &'a mut IchState,
    paddr: HostPhysAddr,
    loaded: bool,
}

impl<'a> AutoGich<'a> {
    /// `pending` requests a maintenance interrupt so the VCPU exits as soon
    /// as list registers free up for vectors that did not fit.
    pub fn new(
        gic: &'a dyn GicVirtIface,
        ich_state: &'a mut IchState,
        paddr: HostPhysAddr,
        pending: bool,
    ) -> Self {
        let mut hcr = ICH_HCR_EN;
        if pending && ich_state.num_lrs > 1 {
            hcr |= ICH_HCR_UIE;
        }
        gic.write_gich_state(ich_state, paddr, hcr);
        Self {
            gic,
            ich_state,
            paddr,
            loaded: true,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn save(&mut self) {
        if self.loaded {
            self.gic.read_gich_state(self.ich_state, self.paddr);
            self.loaded = false;
        }
    }
}

impl StateInvalidator for AutoGich<'_> {
    fn invalidate(&mut self) {
        self.save();
    }
}

impl Drop for AutoGich<'_> {
    fn drop(&mut self) {
        self.save();
    }
}
