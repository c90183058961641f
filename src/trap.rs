use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::ops::Bound::{Excluded, Included, Unbounded};

use axerrno::{ax_err, ax_err_type, AxError, AxResult};
use spin::Mutex;

use crate::gich::StateInvalidator;
use crate::port::{BlockingPortAllocator, Port, PortPacket};

/// Number of packets a trap may have queued on its port at once.
pub const TRAP_PACKET_CAPACITY: usize = 128;

/// What a guest access to a trapped range produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// Synchronous memory trap: the access is handed back to the resume
    /// caller for emulation.
    Mem,
    /// Asynchronous memory trap: writes are queued on a port and the guest
    /// continues.
    Bell,
}

/// A registered guest-physical or I/O port range.
pub struct Trap {
    kind: TrapKind,
    addr: usize,
    len: usize,
    port: Option<Arc<dyn Port>>,
    key: u64,
    port_allocator: BlockingPortAllocator,
}

impl Trap {
    pub fn new(
        kind: TrapKind,
        addr: usize,
        len: usize,
        port: Option<Arc<dyn Port>>,
        key: u64,
        relax: fn(),
    ) -> Self {
        let capacity = if port.is_some() {
            TRAP_PACKET_CAPACITY
        } else {
            0
        };
        Self {
            kind,
            addr,
            len,
            port,
            key,
            port_allocator: BlockingPortAllocator::new(capacity, relax),
        }
    }

    pub fn kind(&self) -> TrapKind {
        self.kind
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn has_port(&self) -> bool {
        self.port.is_some()
    }

    /// One past the last address of the range.
    pub fn end(&self) -> usize {
        self.addr + self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr && addr < self.end()
    }

    /// Queues `packet` on the bound port, blocking until a packet slot is
    /// available. `invalidator` runs before any wait.
    pub fn queue(
        &self,
        packet: PortPacket,
        invalidator: Option<&mut dyn StateInvalidator>,
    ) -> AxResult {
        let Some(port) = &self.port else {
            return ax_err!(BadState, "trap has no port to queue packets on");
        };
        let packet = match self.port_allocator.alloc(packet) {
            Some(packet) => packet,
            None => {
                if let Some(invalidator) = invalidator {
                    invalidator.invalidate();
                }
                trace!("trap {:#x} waiting for a free packet", self.addr);
                self.port_allocator.alloc_blocking(packet)
            }
        };
        port.queue(packet)
    }
}

impl Drop for Trap {
    fn drop(&mut self) {
        if let Some(port) = &self.port {
            let cancelled = port.cancel_queued(&self.port_allocator);
            if cancelled > 0 {
                debug!(
                    "retracted {} undelivered packets of trap {:#x}",
                    cancelled, self.addr
                );
            }
        }
    }
}

impl core::fmt::Debug for Trap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Trap")
            .field("kind", &self.kind)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &format_args!("{:#x}", self.len))
            .field("key", &self.key)
            .field("has_port", &self.has_port())
            .finish()
    }
}

type TrapTree = BTreeMap<usize, Arc<Trap>>;

/// Non-overlapping traps of a guest, ordered by start address.
pub struct TrapMap {
    mem_traps: Mutex<TrapTree>,
    relax: fn(),
}

impl TrapMap {
    /// `relax` is called by trap delivery while waiting for a packet slot.
    pub fn new(relax: fn()) -> Self {
        Self {
            mem_traps: Mutex::new(BTreeMap::new()),
            relax,
        }
    }

    fn tree(&self, kind: TrapKind) -> &Mutex<TrapTree> {
        match kind {
            TrapKind::Mem | TrapKind::Bell => &self.mem_traps,
        }
    }

    pub fn insert_trap(
        &self,
        kind: TrapKind,
        addr: usize,
        len: usize,
        port: Option<Arc<dyn Port>>,
        key: u64,
    ) -> AxResult {
        if len == 0 {
            return ax_err!(InvalidInput, "trap length must be non-zero");
        }
        let end = addr
            .checked_add(len)
            .ok_or_else(|| ax_err_type!(InvalidInput, "trap range overflows"))?;

        let mut traps = self.tree(kind).lock();
        let overlaps_prev = traps
            .range((Unbounded, Included(addr)))
            .next_back()
            .is_some_and(|(_, prev)| prev.end() > addr);
        let overlaps_next = traps
            .range((Excluded(addr), Unbounded))
            .next()
            .is_some_and(|(&start, _)| start < end);
        if overlaps_prev || overlaps_next {
            return ax_err!(AlreadyExists, "trap range overlaps an existing trap");
        }
        traps.insert(
            addr,
            Arc::new(Trap::new(kind, addr, len, port, key, self.relax)),
        );
        Ok(())
    }

    /// Finds the trap of `kind`'s collection that contains `addr`.
    ///
    /// The lock is only held for the search; the returned trap can be used
    /// for delivery after it is released.
    pub fn find_trap(&self, kind: TrapKind, addr: usize) -> AxResult<Arc<Trap>> {
        let traps = self.tree(kind).lock();
        match traps.range((Unbounded, Included(addr))).next_back() {
            Some((_, trap)) if trap.contains(addr) => Ok(trap.clone()),
            _ => Err(AxError::NotFound),
        }
    }

    /// Number of traps registered in `kind`'s collection.
    pub fn len(&self, kind: TrapKind) -> usize {
        self.tree(kind).lock().len()
    }
}
