//! Register blocks shared between the host and the EL2 world switch.
//!
//! The EL2 code addresses this memory by physical address while the host
//! uses its own mapping, so the whole [`El2State`] lives inside a single
//! page frame obtained from the paging handler.

use core::marker::PhantomData;
use core::mem::{offset_of, size_of};
use core::ptr::NonNull;

use axaddrspace::HostPhysAddr;
use axerrno::{ax_err_type, AxResult};
use memory_addr::{MemoryAddr, PAGE_SIZE_4K};
use page_table_multiarch::PagingHandler;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Maximum number of active priority registers per group.
pub const MAX_APRS: usize = 4;
/// Maximum number of list registers.
pub const MAX_LIST_REGISTERS: usize = 16;

/// EL1 system registers switched on every guest entry and exit.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct SystemState {
    pub sp_el0: u64,
    pub tpidr_el0: u64,
    pub tpidrro_el0: u64,
    pub cntkctl_el1: u64,
    pub contextidr_el1: u64,
    pub cpacr_el1: u64,
    pub csselr_el1: u64,
    pub elr_el1: u64,
    pub esr_el1: u64,
    pub far_el1: u64,
    pub mair_el1: u64,
    pub mdscr_el1: u64,
    pub par_el1: u64,
    pub sctlr_el1: u64,
    pub sp_el1: u64,
    pub spsr_el1: u64,
    pub tcr_el1: u64,
    pub tpidr_el1: u64,
    pub ttbr0_el1: u64,
    pub ttbr1_el1: u64,
    pub vbar_el1: u64,
}

/// SIMD and floating point registers.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct FpState {
    pub q: [u128; 32],
    pub fpsr: u64,
    pub fpcr: u64,
}

/// Hardware breakpoint and watchpoint registers.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct DebugState {
    pub dbgbcr: [u64; 16],
    pub dbgbvr: [u64; 16],
    pub dbgwcr: [u64; 16],
    pub dbgwvr: [u64; 16],
}

/// Guest register context, including the syndrome of the last exit.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GuestState {
    pub x: [u64; 31],
    pub system_state: SystemState,
    pub elr_el2: u64,
    pub spsr_el2: u64,
    pub vmpidr_el2: u64,
    pub cntv_ctl_el0: u64,
    pub cntv_cval_el0: u64,
    pub esr_el2: u64,
    pub far_el2: u64,
    pub hpfar_el2: u64,
    pub fp_state: FpState,
    pub debug_state: DebugState,
}

/// Host callee-saved context, restored by EL2 on every VM exit.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostState {
    /// `x19` to `x30`.
    pub x: [u64; 12],
    pub sp: u64,
    pub system_state: SystemState,
    pub fp_state: FpState,
}

/// The GICv3 hypervisor control block image of one VCPU.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IchState {
    /// Number of implemented `ICH_AP{0,1}R<n>_EL2` registers.
    pub num_aprs: u8,
    /// Number of implemented `ICH_LR<n>_EL2` registers.
    pub num_lrs: u8,
    _reserved: [u8; 2],
    pub vmcr: u32,
    pub misr: u64,
    /// Bit `n` set means list register `n` holds no interrupt.
    pub elrsr: u64,
    pub ap0r: [u64; MAX_APRS],
    pub ap1r: [u64; MAX_APRS],
    pub lr: [u64; MAX_LIST_REGISTERS],
}

impl IchState {
    /// Resets the image for a CPU interface with the given capabilities.
    pub fn init(&mut self, num_aprs: u8, num_lrs: u8, vmcr: u32) {
        *self = Self {
            num_aprs,
            num_lrs,
            _reserved: [0; 2],
            vmcr,
            misr: 0,
            elrsr: (1u64 << num_lrs) - 1,
            ap0r: [0; MAX_APRS],
            ap1r: [0; MAX_APRS],
            lr: [0; MAX_LIST_REGISTERS],
        };
    }

    /// List registers that are in use.
    pub fn occupied_lrs(&self) -> impl Iterator<Item = u64> + '_ {
        self.lr[..self.num_lrs as usize]
            .iter()
            .enumerate()
            .filter(|(i, _)| self.elrsr & (1 << i) == 0)
            .map(|(_, lr)| *lr)
    }
}

/// Everything the EL2 world switch reads and writes for one VCPU.
#[repr(C, align(16))]
pub struct El2State {
    pub guest_state: GuestState,
    pub host_state: HostState,
    pub ich_state: IchState,
}

const _: () = assert!(size_of::<El2State>() <= PAGE_SIZE_4K);

/// A page frame holding exactly one [`El2State`].
///
/// The frame is page aligned and the state fits in it, so the state never
/// straddles a physical page boundary.
pub struct El2StatePage<P: PagingHandler> {
    paddr: HostPhysAddr,
    state: NonNull<El2State>,
    _phantom: PhantomData<P>,
}

// The page is owned exclusively by this handle.
unsafe impl<P: PagingHandler> Send for El2StatePage<P> {}
unsafe impl<P: PagingHandler> Sync for El2StatePage<P> {}

impl<P: PagingHandler> El2StatePage<P> {
    /// Allocates and zeroes a page for the EL2 state.
    pub fn new() -> AxResult<Self> {
        let paddr = P::alloc_frame()
            .ok_or_else(|| ax_err_type!(NoMemory, "failed to allocate an EL2 state page"))?;
        debug_assert!(paddr.is_aligned_4k());
        let vaddr = P::phys_to_virt(paddr);
        // SAFETY: the frame was just allocated for us and is PAGE_SIZE_4K bytes,
        // and all-zero is a valid `El2State`.
        let state = unsafe {
            core::ptr::write_bytes(vaddr.as_mut_ptr(), 0, PAGE_SIZE_4K);
            NonNull::new_unchecked(vaddr.as_mut_ptr() as *mut El2State)
        };
        Ok(Self {
            paddr,
            state,
            _phantom: PhantomData,
        })
    }

    /// Physical address of the [`El2State`], as handed to EL2.
    pub fn paddr(&self) -> HostPhysAddr {
        self.paddr
    }

    /// Physical address of the embedded [`IchState`].
    pub fn ich_state_paddr(&self) -> HostPhysAddr {
        self.paddr + offset_of!(El2State, ich_state)
    }

    pub fn state(&self) -> &El2State {
        // SAFETY: `state` points into the page we own for as long as `self` lives.
        unsafe { self.state.as_ref() }
    }

    pub fn state_mut(&mut self) -> &mut El2State {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { self.state.as_mut() }
    }
}

impl<P: PagingHandler> Drop for El2StatePage<P> {
    fn drop(&mut self) {
        P::dealloc_frame(self.paddr);
    }
}
