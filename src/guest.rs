use alloc::sync::Arc;

use axaddrspace::GuestPhysAddr;
use axerrno::{ax_err, AxResult};
use memory_addr::is_aligned_4k;
use spin::Mutex;

use crate::hal::{AxGuestHal, GuestAddrSpace};
use crate::id_alloc::IdAllocator;
use crate::port::Port;
use crate::trap::{TrapKind, TrapMap};

/// Maximum number of VCPUs a guest can have.
pub const MAX_VCPUS_PER_GUEST: usize = 8;

/// Stage 2 translation contexts are tagged with an 8-bit VMID, and VMID 0
/// belongs to the host.
pub const MAX_GUESTS: usize = 255;

/// The pool of VMIDs guests are created from.
///
/// [`global_vmid_pool`] is the pool used by the hypervisor; separate pools
/// can be created for isolated users such as tests.
pub struct VmidPool {
    ids: Mutex<IdAllocator>,
}

impl VmidPool {
    pub const fn new() -> Self {
        Self::with_capacity(MAX_GUESTS)
    }

    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: Mutex::new(IdAllocator::new(capacity)),
        }
    }

    fn alloc(&self) -> AxResult<u8> {
        self.ids.lock().alloc()
    }

    fn free(&self, vmid: u8) {
        if self.ids.lock().free(vmid).is_err() {
            warn!("VMID {} released twice", vmid);
        }
    }

    /// Number of VMIDs currently held by guests.
    pub fn in_use(&self) -> usize {
        self.ids.lock().allocated()
    }
}

impl Default for VmidPool {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_VMID_POOL: VmidPool = VmidPool::new();

/// The system-wide VMID pool. It lives for the whole lifetime of the
/// hypervisor.
pub fn global_vmid_pool() -> &'static VmidPool {
    &GLOBAL_VMID_POOL
}

/// A guest: its address space, VMID, traps and VCPU ids.
pub struct Guest<H: AxGuestHal> {
    vmid: u8,
    vmid_pool: &'static VmidPool,
    gpas: H::AddrSpace,
    traps: TrapMap,
    vpid_allocator: Mutex<IdAllocator>,
}

impl<H: AxGuestHal> Guest<H> {
    /// Creates a guest owning `gpas`, with a VMID from the global pool.
    pub fn new(gpas: H::AddrSpace) -> AxResult<Self> {
        Self::new_in(gpas, global_vmid_pool())
    }

    /// Creates a guest owning `gpas`, with a VMID from `vmid_pool`.
    pub fn new_in(gpas: H::AddrSpace, vmid_pool: &'static VmidPool) -> AxResult<Self> {
        let vmid = vmid_pool.alloc()?;
        debug!("guest created with VMID {}", vmid);
        Ok(Self {
            vmid,
            vmid_pool,
            gpas,
            traps: TrapMap::new(H::yield_now),
            vpid_allocator: Mutex::new(IdAllocator::new(MAX_VCPUS_PER_GUEST)),
        })
    }

    pub fn vmid(&self) -> u8 {
        self.vmid
    }

    pub fn gpas(&self) -> &H::AddrSpace {
        &self.gpas
    }

    pub fn traps(&self) -> &TrapMap {
        &self.traps
    }

    /// `VTTBR_EL2` value selecting this guest's stage 2 translation.
    pub fn vttbr(&self) -> u64 {
        (self.vmid as u64) << 48 | self.gpas.root_paddr().as_usize() as u64
    }

    /// Registers a trap on `[addr, addr + len)`.
    ///
    /// [`TrapKind::Bell`] traps need a `port`; [`TrapKind::Mem`] traps
    /// must not have one. Memory ranges must be page aligned, and are
    /// unmapped from the guest so that accesses fault.
    pub fn set_trap(
        &self,
        kind: TrapKind,
        addr: usize,
        len: usize,
        port: Option<Arc<dyn Port>>,
        key: u64,
    ) -> AxResult {
        match kind {
            TrapKind::Mem if port.is_some() => {
                return ax_err!(InvalidInput, "memory traps are delivered synchronously")
            }
            TrapKind::Bell if port.is_none() => {
                return ax_err!(InvalidInput, "bell traps need a port")
            }
            _ => {}
        }
        if len == 0 {
            return ax_err!(InvalidInput, "trap length must be non-zero");
        }
        if addr.checked_add(len).is_none() {
            return ax_err!(InvalidInput, "trap range overflows");
        }

        if !is_aligned_4k(addr) || !is_aligned_4k(len) {
            return ax_err!(InvalidInput, "memory traps must be page aligned");
        }
        self.gpas.unmap_range(GuestPhysAddr::from(addr), len)?;

        self.traps.insert_trap(kind, addr, len, port, key)?;
        debug!(
            "VMID {}: {:?} trap at [{:#x}, {:#x}) key {}",
            self.vmid,
            kind,
            addr,
            addr + len,
            key
        );
        Ok(())
    }

    /// Allocates a VCPU id, unique within this guest.
    pub fn alloc_vpid(&self) -> AxResult<u8> {
        self.vpid_allocator.lock().alloc()
    }

    pub fn free_vpid(&self, vpid: u8) -> AxResult {
        self.vpid_allocator.lock().free(vpid)
    }

    /// Number of VCPUs currently holding an id.
    pub fn num_vcpus(&self) -> usize {
        self.vpid_allocator.lock().allocated()
    }
}

impl<H: AxGuestHal> Drop for Guest<H> {
    fn drop(&mut self) {
        debug_assert!(
            self.vpid_allocator.get_mut().is_empty(),
            "guest destroyed with live VCPUs"
        );
        self.vmid_pool.free(self.vmid);
        debug!("guest with VMID {} destroyed", self.vmid);
    }
}
