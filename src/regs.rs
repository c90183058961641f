//! Register groups exposed through [`Vcpu::read_state`](crate::Vcpu::read_state)
//! and [`Vcpu::write_state`](crate::Vcpu::write_state).

use core::mem::size_of;

use axerrno::{ax_err, ax_err_type, AxError, AxResult};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::el2::{DebugState, FpState, GuestState, SystemState};

/// `SPSR_EL2` condition flags visible through the general register group.
const SPSR_NZCV: u64 = 0xf000_0000;

/// A group of guest registers accessible as a fixed-size byte buffer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuStateKind {
    /// [`VcpuGeneralRegs`].
    General = 0,
    /// [`SystemState`].
    System = 1,
    /// [`FpState`].
    Vector = 2,
    /// [`DebugState`].
    Debug = 3,
}

impl VcpuStateKind {
    /// Exact buffer size expected for this group.
    pub const fn size(self) -> usize {
        match self {
            Self::General => size_of::<VcpuGeneralRegs>(),
            Self::System => size_of::<SystemState>(),
            Self::Vector => size_of::<FpState>(),
            Self::Debug => size_of::<DebugState>(),
        }
    }
}

impl TryFrom<u32> for VcpuStateKind {
    type Error = AxError;

    fn try_from(kind: u32) -> AxResult<Self> {
        Ok(match kind {
            0 => Self::General,
            1 => Self::System,
            2 => Self::Vector,
            3 => Self::Debug,
            _ => return ax_err!(Unsupported, "unknown VCPU register group"),
        })
    }
}

/// General purpose registers, stack pointer and condition flags.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VcpuGeneralRegs {
    pub x: [u64; 31],
    pub sp: u64,
    pub cpsr: u64,
}

impl VcpuGeneralRegs {
    fn from_guest(guest_state: &GuestState) -> Self {
        Self {
            x: guest_state.x,
            sp: guest_state.system_state.sp_el1,
            cpsr: guest_state.spsr_el2 & SPSR_NZCV,
        }
    }

    fn apply(&self, guest_state: &mut GuestState) {
        guest_state.x = self.x;
        guest_state.system_state.sp_el1 = self.sp;
        guest_state.spsr_el2 = (guest_state.spsr_el2 & !SPSR_NZCV) | (self.cpsr & SPSR_NZCV);
    }
}

fn invalid<E>(_: E) -> AxError {
    ax_err_type!(InvalidInput)
}

fn check_len(kind: VcpuStateKind, len: usize) -> AxResult {
    if len != kind.size() {
        return ax_err!(InvalidInput, "register buffer size does not match the group");
    }
    Ok(())
}

pub(crate) fn read_group(guest_state: &GuestState, kind: VcpuStateKind, buf: &mut [u8]) -> AxResult {
    check_len(kind, buf.len())?;
    match kind {
        VcpuStateKind::General => {
            buf.copy_from_slice(VcpuGeneralRegs::from_guest(guest_state).as_bytes())
        }
        VcpuStateKind::System => buf.copy_from_slice(guest_state.system_state.as_bytes()),
        VcpuStateKind::Vector => buf.copy_from_slice(guest_state.fp_state.as_bytes()),
        VcpuStateKind::Debug => buf.copy_from_slice(guest_state.debug_state.as_bytes()),
    }
    Ok(())
}

pub(crate) fn write_group(guest_state: &mut GuestState, kind: VcpuStateKind, buf: &[u8]) -> AxResult {
    check_len(kind, buf.len())?;
    match kind {
        VcpuStateKind::General => VcpuGeneralRegs::read_from_bytes(buf)
            .map_err(invalid)?
            .apply(guest_state),
        VcpuStateKind::System => {
            guest_state.system_state = SystemState::read_from_bytes(buf).map_err(invalid)?
        }
        VcpuStateKind::Vector => {
            guest_state.fp_state = FpState::read_from_bytes(buf).map_err(invalid)?
        }
        VcpuStateKind::Debug => {
            guest_state.debug_state = DebugState::read_from_bytes(buf).map_err(invalid)?
        }
    }
    Ok(())
}
