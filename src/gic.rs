//! The interrupt controller hypervisor backend.

use core::marker::PhantomData;

use axaddrspace::HostPhysAddr;
use axerrno::{ax_err_type, AxResult};
use bit_field::BitField;
use spin::Once;

use crate::el2::{IchState, MAX_APRS, MAX_LIST_REGISTERS};
use crate::hal::AxGicHal;

/// First shared peripheral interrupt. Vectors below are SGIs and PPIs,
/// which are banked per CPU.
pub const GIC_BASE_SPI: u32 = 32;

/// `ICH_HCR_EL2.En`: enables the virtual CPU interface.
pub const ICH_HCR_EN: u64 = 1 << 0;
/// `ICH_HCR_EL2.UIE`: maintenance interrupt when at most one list register is valid.
pub const ICH_HCR_UIE: u64 = 1 << 1;

/// `ICH_VMCR_EL2.VENG1`.
pub const ICH_VMCR_VENG1: u32 = 1 << 1;
/// `ICH_VMCR_EL2.VFIQEn`, RES1 where the non-secure `ICC_SRE_EL1.SRE` is fixed to 1.
pub const ICH_VMCR_VFIQEN: u32 = 1 << 3;
/// `ICH_VMCR_EL2.VPMR`, all priorities unmasked.
pub const ICH_VMCR_VPMR: u32 = 0xff << 24;

/// `ICH_LR<n>_EL2.vINTID`.
pub const ICH_LR_VIRTUAL_ID_MASK: u64 = 0xffff_ffff;
/// `ICH_LR<n>_EL2.pINTID`.
const ICH_LR_PHYSICAL_ID_SHIFT: u64 = 32;
const ICH_LR_PHYSICAL_ID_MASK: u64 = 0x3ff;
const ICH_LR_PRIORITY_SHIFT: u64 = 48;
pub const ICH_LR_GROUP1: u64 = 1 << 60;
pub const ICH_LR_HARDWARE: u64 = 1 << 61;
pub const ICH_LR_PENDING: u64 = 1 << 62;

/// GIC hypervisor interface consumed by every VCPU.
///
/// Unless noted otherwise, methods operate on the hypervisor control block
/// of the current physical CPU.
pub trait GicVirtIface: Send + Sync {
    /// Physical address of a memory-mapped virtual CPU interface to expose
    /// to guests. `None` means guests use the system register interface.
    fn get_gicv(&self) -> Option<HostPhysAddr>;

    /// Saves the control block into `state`, which lives at `state_paddr`.
    fn read_gich_state(&self, state: &mut IchState, state_paddr: HostPhysAddr);

    /// Loads `state`, which lives at `state_paddr`, into the control block.
    fn write_gich_state(&self, state: &IchState, state_paddr: HostPhysAddr, hcr: u64);

    /// Power-on value of `ICH_VMCR_EL2` for a new VCPU.
    fn default_gich_vmcr(&self) -> u32;

    /// Encodes a pending group 1 list register entry for `vector`.
    fn get_lr_from_vector(&self, hardware: bool, priority: u8, vector: u32) -> u64;

    /// Extracts the virtual interrupt id from a list register entry.
    fn get_vector_from_lr(&self, lr: u64) -> u32;

    /// Number of implemented virtual priority bits.
    fn get_num_pres(&self) -> u8;

    /// Number of implemented list registers.
    fn get_num_lrs(&self) -> u8;
}

static GIC_VIRT_IFACE: Once<&'static dyn GicVirtIface> = Once::new();

/// Installs the system's GIC hypervisor backend. Only the first call has
/// any effect.
pub fn register_gic_virt_iface(iface: &'static dyn GicVirtIface) {
    let mut installed = false;
    GIC_VIRT_IFACE.call_once(|| {
        installed = true;
        iface
    });
    if installed {
        info!(
            "GIC hypervisor backend registered: {} list registers, {} priority bits",
            iface.get_num_lrs(),
            iface.get_num_pres()
        );
    } else {
        warn!("GIC hypervisor backend already registered, ignoring");
    }
}

/// The registered GIC hypervisor backend.
pub fn gic_virt_iface() -> AxResult<&'static dyn GicVirtIface> {
    GIC_VIRT_IFACE
        .get()
        .copied()
        .ok_or_else(|| ax_err_type!(Unsupported, "no GIC hypervisor backend registered"))
}

/// GICv3 backend using the system register CPU interface.
pub struct GicV3<H: AxGicHal> {
    vtr: Once<u64>,
    _phantom: PhantomData<fn() -> H>,
}

impl<H: AxGicHal> GicV3<H> {
    pub const fn new() -> Self {
        Self {
            vtr: Once::new(),
            _phantom: PhantomData,
        }
    }

    fn vtr(&self) -> u64 {
        *self.vtr.call_once(H::read_ich_vtr)
    }

    /// Marks `vector` active on the physical GIC so that the guest's EOI
    /// deactivates it directly.
    fn set_physical_active(vector: u32) {
        let bit = 1u32 << (vector % 32);
        if vector < GIC_BASE_SPI {
            // SGIs and PPIs live in the redistributor under affinity routing.
            H::gicr_write_isactiver0(H::current_cpu(), bit);
        } else {
            H::gicd_write_isactiver((vector / 32) as usize, bit);
        }
    }
}

impl<H: AxGicHal> Default for GicV3<H> {
    fn default() -> Self {
        Self::new()
    }
}

fn check_bounds(state: &IchState) {
    assert!(state.num_aprs as usize <= MAX_APRS);
    assert!(state.num_lrs as usize <= MAX_LIST_REGISTERS);
}

impl<H: AxGicHal> GicVirtIface for GicV3<H> {
    fn get_gicv(&self) -> Option<HostPhysAddr> {
        None
    }

    fn read_gich_state(&self, state: &mut IchState, state_paddr: HostPhysAddr) {
        check_bounds(state);
        // SAFETY: `state_paddr` is where the exclusively borrowed `state` lives.
        unsafe { H::el2_read_gich_state(state_paddr) };
    }

    fn write_gich_state(&self, state: &IchState, state_paddr: HostPhysAddr, hcr: u64) {
        check_bounds(state);
        // Empty list registers keep the stale contents of the last interrupt
        // they held, which the guest has already deactivated.
        for lr in state.occupied_lrs() {
            if lr & ICH_LR_HARDWARE != 0 {
                Self::set_physical_active(self.get_vector_from_lr(lr));
            }
        }
        // SAFETY: `state_paddr` is where the borrowed `state` lives.
        unsafe { H::el2_write_gich_state(state_paddr, hcr) };
    }

    fn default_gich_vmcr(&self) -> u32 {
        ICH_VMCR_VPMR | ICH_VMCR_VFIQEN | ICH_VMCR_VENG1
    }

    fn get_lr_from_vector(&self, hardware: bool, priority: u8, vector: u32) -> u64 {
        let mut lr = ICH_LR_PENDING
            | ICH_LR_GROUP1
            | (priority as u64) << ICH_LR_PRIORITY_SHIFT
            | (vector as u64 & ICH_LR_VIRTUAL_ID_MASK);
        if hardware {
            lr |= ICH_LR_HARDWARE
                | (vector as u64 & ICH_LR_PHYSICAL_ID_MASK) << ICH_LR_PHYSICAL_ID_SHIFT;
        }
        lr
    }

    fn get_vector_from_lr(&self, lr: u64) -> u32 {
        (lr & ICH_LR_VIRTUAL_ID_MASK) as u32
    }

    fn get_num_pres(&self) -> u8 {
        // ICH_VTR_EL2.PRIbits holds the number of priority bits minus one.
        self.vtr().get_bits(29..32) as u8 + 1
    }

    fn get_num_lrs(&self) -> u8 {
        // ICH_VTR_EL2.ListRegs holds the number of list registers minus one.
        self.vtr().get_bits(0..5) as u8 + 1
    }
}
