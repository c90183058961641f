//! Packets delivered to user-mode notification ports, and the bounded
//! allocator that backs asynchronous trap delivery.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use axaddrspace::GuestPhysAddr;
use axerrno::AxResult;
use spin::Mutex;

/// Width of a trapped guest access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Byte = 1,
    Half = 2,
    Word = 4,
    Double = 8,
}

impl AccessSize {
    /// Decodes the `SAS` field of a data abort syndrome.
    pub fn from_sas(sas: u64) -> Self {
        match sas & 0b11 {
            0 => Self::Byte,
            1 => Self::Half,
            2 => Self::Word,
            _ => Self::Double,
        }
    }

    pub fn bytes(self) -> usize {
        self as usize
    }
}

/// A trapped guest memory access that the caller must emulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    pub size: AccessSize,
    pub sign_extend: bool,
    /// The guest register read into or written from.
    pub xt: u8,
    pub read: bool,
    /// The written value; zero for reads.
    pub data: u64,
}

/// What happened in the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketPayload {
    /// The guest wrote to a doorbell range.
    Bell { addr: GuestPhysAddr },
    /// The guest accessed a synchronously trapped memory range.
    Mem { addr: GuestPhysAddr, access: MemAccess },
    /// The guest waits for an interrupt and none is pending.
    Wfi,
    /// The guest asks for another VCPU to be started.
    Startup { id: u64, entry: GuestPhysAddr },
    /// The guest issued a hypervisor or secure monitor call.
    Hypercall { nr: u64, args: [u64; 6] },
    /// The guest raised an exception the hypervisor does not handle.
    Fault {
        esr: u64,
        addr: GuestPhysAddr,
    },
}

/// A packet as observed by the resume caller or a port reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPacket {
    /// The key the trap was registered with, zero for untrapped exits.
    pub key: u64,
    pub payload: PacketPayload,
}

impl PortPacket {
    pub const fn new(key: u64, payload: PacketPayload) -> Self {
        Self { key, payload }
    }
}

/// The user-mode notification object trap packets are delivered to.
pub trait Port: Send + Sync {
    /// Queues `packet` for a reader. Dropping the packet releases its slot.
    fn queue(&self, packet: PacketRef) -> AxResult;

    /// Drops every undelivered packet that came from `allocator`, returning
    /// how many were removed.
    fn cancel_queued(&self, allocator: &BlockingPortAllocator) -> usize;
}

/// A counting semaphore that waits by yielding the CPU.
struct Semaphore {
    permits: AtomicUsize,
}

impl Semaphore {
    const fn new(permits: usize) -> Self {
        Self {
            permits: AtomicUsize::new(permits),
        }
    }

    fn try_acquire(&self) -> bool {
        self.permits
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn acquire(&self, relax: fn()) {
        while !self.try_acquire() {
            relax();
        }
    }

    fn release(&self) {
        self.permits.fetch_add(1, Ordering::Release);
    }
}

struct Arena {
    slots: Vec<Mutex<Option<PortPacket>>>,
    free: Mutex<Vec<usize>>,
    permits: Semaphore,
}

impl Arena {
    fn claim(&self, packet: PortPacket) -> usize {
        // Holding a permit guarantees a free slot.
        let index = self
            .free
            .lock()
            .pop()
            .expect("semaphore permits exceed free slots");
        *self.slots[index].lock() = Some(packet);
        index
    }

    fn release(&self, index: usize) {
        *self.slots[index].lock() = None;
        self.free.lock().push(index);
        self.permits.release();
    }
}

/// A fixed pool of packet slots. Allocation blocks while every slot is
/// queued on the port, which throttles a guest that traps faster than its
/// port is drained.
pub struct BlockingPortAllocator {
    arena: Arc<Arena>,
    relax: fn(),
}

impl BlockingPortAllocator {
    /// Creates a pool of `capacity` slots. `relax` is called while waiting
    /// for a slot.
    pub fn new(capacity: usize, relax: fn()) -> Self {
        Self {
            arena: Arc::new(Arena {
                slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
                free: Mutex::new((0..capacity).rev().collect()),
                permits: Semaphore::new(capacity),
            }),
            relax,
        }
    }

    pub fn capacity(&self) -> usize {
        self.arena.slots.len()
    }

    /// Number of slots currently handed out.
    pub fn outstanding(&self) -> usize {
        self.capacity() - self.arena.free.lock().len()
    }

    /// Stores `packet` in a free slot, waiting for one if necessary.
    pub fn alloc_blocking(&self, packet: PortPacket) -> PacketRef {
        self.arena.permits.acquire(self.relax);
        self.claim(packet)
    }

    /// Stores `packet` in a free slot, or returns `None` if there is none.
    pub fn alloc(&self, packet: PortPacket) -> Option<PacketRef> {
        self.arena.permits.try_acquire().then(|| self.claim(packet))
    }

    fn claim(&self, packet: PortPacket) -> PacketRef {
        PacketRef {
            index: self.arena.claim(packet),
            arena: self.arena.clone(),
        }
    }
}

/// A packet held in a [`BlockingPortAllocator`] slot. The slot is freed when
/// this is dropped.
pub struct PacketRef {
    arena: Arc<Arena>,
    index: usize,
}

impl PacketRef {
    pub fn packet(&self) -> PortPacket {
        self.arena.slots[self.index]
            .lock()
            .expect("allocated slot holds a packet")
    }

    pub fn key(&self) -> u64 {
        self.packet().key
    }

    /// Whether this packet's slot belongs to `allocator`.
    pub fn allocated_by(&self, allocator: &BlockingPortAllocator) -> bool {
        Arc::ptr_eq(&self.arena, &allocator.arena)
    }
}

impl core::fmt::Debug for PacketRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketRef")
            .field("index", &self.index)
            .field("packet", &self.packet())
            .finish()
    }
}

impl Drop for PacketRef {
    fn drop(&mut self) {
        self.arena.release(self.index);
    }
}
