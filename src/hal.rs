use axaddrspace::{GuestPhysAddr, HostPhysAddr, HostVirtAddr};
use axerrno::AxResult;

use crate::vcpu::CpuMask;

/// How the privileged guest-entry primitive came back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum El2Exit {
    /// The guest took a synchronous exception routed to EL2. The syndrome is
    /// saved in the guest state (`esr_el2`, `far_el2`, `hpfar_el2`).
    Exception,
    /// A physical interrupt arrived while the guest was running.
    Irq,
}

/// The interfaces which the underlying kernel must implement.
pub trait AxGuestHal: 'static {
    /// Allocator and mapper for page frames shared with EL2.
    type PagingHandler: page_table_multiarch::PagingHandler;
    /// The guest physical address space owned by each guest.
    type AddrSpace: GuestAddrSpace;

    /// Converts a host virtual address to a host physical address.
    ///
    /// # Parameters
    ///
    /// * `vaddr` - The virtual address to convert.
    ///
    /// # Returns
    ///
    /// * `HostPhysAddr` - The corresponding physical address.
    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr;

    /// Whether the virtualization extensions are usable on this system.
    fn has_hardware_support() -> bool {
        true
    }

    /// Index of the physical CPU the caller is running on.
    fn current_cpu() -> usize;

    /// Sends an inter-processor interrupt to every CPU in `mask`.
    fn send_ipi(mask: CpuMask);

    /// Gives up the CPU while waiting for a resource to become available.
    fn yield_now() {
        core::hint::spin_loop();
    }

    /// Current value of the system counter (`CNTPCT_EL0`).
    fn current_ticks() -> u64;

    /// Enters the guest through EL2 and returns on the next VM exit.
    ///
    /// # Safety
    ///
    /// `el2_state` must be the physical address of a live, page-contained
    /// [`El2State`](crate::El2State) that is not accessed by the host until
    /// this function returns.
    unsafe fn el2_resume(vttbr: u64, el2_state: HostPhysAddr, hcr: u64) -> AxResult<El2Exit>;

    /// Dispatch an interrupt request (IRQ) to the underlying host OS.
    fn irq_handler() {}
}

/// Raw GICv3 register accessors used by [`GicV3`](crate::GicV3).
pub trait AxGicHal: 'static {
    /// Reads `ICH_VTR_EL2`.
    fn read_ich_vtr() -> u64;

    /// Saves the hypervisor control block of the current CPU into the
    /// [`IchState`](crate::IchState) at `state`.
    ///
    /// # Safety
    ///
    /// `state` must be the physical address of a valid `IchState`.
    unsafe fn el2_read_gich_state(state: HostPhysAddr);

    /// Loads the [`IchState`](crate::IchState) at `state` into the hypervisor
    /// control block of the current CPU and writes `ICH_HCR_EL2`.
    ///
    /// # Safety
    ///
    /// `state` must be the physical address of a valid `IchState`.
    unsafe fn el2_write_gich_state(state: HostPhysAddr, hcr: u64);

    /// Writes `GICD_ISACTIVER<index>`.
    fn gicd_write_isactiver(index: usize, bits: u32);

    /// Writes `GICR_ISACTIVER0` of the redistributor belonging to `cpu`.
    fn gicr_write_isactiver0(cpu: usize, bits: u32);

    /// Index of the physical CPU the caller is running on.
    fn current_cpu() -> usize;
}

/// The guest physical address space a [`Guest`](crate::Guest) owns.
pub trait GuestAddrSpace: Send + Sync {
    /// Physical address of the stage-2 translation table root.
    fn root_paddr(&self) -> HostPhysAddr;

    /// Removes any mapping of `[addr, addr + len)`, so that guest accesses
    /// to the range fault into the hypervisor.
    fn unmap_range(&self, addr: GuestPhysAddr, len: usize) -> AxResult;

    /// Resolves a stage-2 fault at `addr` that no trap claimed.
    fn page_fault(&self, addr: GuestPhysAddr) -> AxResult;
}
