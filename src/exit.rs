use axaddrspace::GuestPhysAddr;
use axerrno::{ax_err, AxError, AxResult};
use bit_field::BitField;

use crate::el2::GuestState;
use crate::gich::{GichState, StateInvalidator};
use crate::hal::GuestAddrSpace;
use crate::port::{AccessSize, MemAccess, PacketPayload, PortPacket};
use crate::trap::{TrapKind, TrapMap};
use crate::vcpu::HcrFlags;

/// The result of [`Vcpu::resume`](crate::Vcpu::resume).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuExit {
    /// The exit hit an asynchronous trap and was queued on its port. The
    /// VCPU can be resumed right away.
    Queued { key: u64 },
    /// The caller has to act on this packet before resuming.
    ///
    /// For a [`PacketPayload::Mem`] read, the emulated value must be written
    /// to register `xt` through the general register group.
    Packet(PortPacket),
}

/// `ESR_EL2.EC` values that reach the exit handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    WfiWfe,
    Hvc64,
    Smc64,
    SystemRegister,
    InstructionAbort,
    DataAbort,
    Other(u8),
}

impl ExceptionClass {
    pub fn from_esr(esr: u64) -> Self {
        match esr.get_bits(26..32) as u8 {
            0x01 => Self::WfiWfe,
            0x16 => Self::Hvc64,
            0x17 => Self::Smc64,
            0x18 => Self::SystemRegister,
            0x20 => Self::InstructionAbort,
            0x24 => Self::DataAbort,
            ec => Self::Other(ec),
        }
    }
}

fn iss(esr: u64) -> u64 {
    esr.get_bits(0..25)
}

/// Decoded instruction specific syndrome of a lower-EL data abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAbort {
    /// Whether the remaining fields hold valid instruction information.
    pub valid: bool,
    pub size: AccessSize,
    pub sign_extend: bool,
    pub xt: u8,
    pub read: bool,
}

impl DataAbort {
    pub fn from_esr(esr: u64) -> Self {
        let iss = iss(esr);
        Self {
            valid: iss.get_bit(24),
            size: AccessSize::from_sas(iss.get_bits(22..24)),
            sign_extend: iss.get_bit(21),
            xt: iss.get_bits(16..21) as u8,
            read: !iss.get_bit(6),
        }
    }
}

/// Builds the `<op0><op2><op1><CRn>00000<CRm>0` key of a trapped system
/// register, as laid out in `ESR_EL2.ISS` with `Rt` and the direction masked.
pub const fn sysreg_key(op0: u64, op1: u64, crn: u64, crm: u64, op2: u64) -> u64 {
    op0 << 20 | op2 << 17 | op1 << 14 | crn << 10 | crm << 1
}

const SYSREG_KEY_MASK: u64 = sysreg_key(0b11, 0b111, 0b1111, 0b1111, 0b111);

pub const SCTLR_EL1: u64 = sysreg_key(3, 0, 1, 0, 0);
pub const TTBR0_EL1: u64 = sysreg_key(3, 0, 2, 0, 0);
pub const TTBR1_EL1: u64 = sysreg_key(3, 0, 2, 0, 1);
pub const TCR_EL1: u64 = sysreg_key(3, 0, 2, 0, 2);
pub const ESR_EL1: u64 = sysreg_key(3, 0, 5, 2, 0);
pub const FAR_EL1: u64 = sysreg_key(3, 0, 6, 0, 0);
pub const MAIR_EL1: u64 = sysreg_key(3, 0, 10, 2, 0);
pub const CONTEXTIDR_EL1: u64 = sysreg_key(3, 0, 13, 0, 1);

/// A trapped `MSR`/`MRS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemRegisterAccess {
    pub key: u64,
    pub xt: u8,
    pub read: bool,
}

impl SystemRegisterAccess {
    pub fn from_esr(esr: u64) -> Self {
        let iss = iss(esr);
        Self {
            key: iss & SYSREG_KEY_MASK,
            xt: iss.get_bits(5..10) as u8,
            read: iss.get_bit(0),
        }
    }
}

/// `SCTLR_EL1.M`, the stage 1 MMU enable.
const SCTLR_ELX_M: u64 = 1 << 0;

pub const PSCI_CPU_ON_32: u64 = 0x8400_0003;
pub const PSCI_CPU_ON_64: u64 = 0xc400_0003;
const PSCI_SUCCESS: u64 = 0;

/// Guest physical address of the last stage 2 fault, combining the page
/// from `HPFAR_EL2.FIPA` with the offset from `FAR_EL2`.
pub fn fault_ipa(guest_state: &GuestState) -> GuestPhysAddr {
    let page = (guest_state.hpfar_el2 & 0x0000_0fff_ffff_fff0) << 8;
    GuestPhysAddr::from((page | (guest_state.far_el2 & 0xfff)) as usize)
}

fn next_pc(guest_state: &mut GuestState) {
    guest_state.elr_el2 += 4;
}

/// Reads `x<n>`, where 31 is the zero register.
fn read_x(guest_state: &GuestState, n: u8) -> u64 {
    guest_state.x.get(n as usize).copied().unwrap_or(0)
}

/// The low `size` bytes of a stored register value.
fn truncate(value: u64, size: AccessSize) -> u64 {
    match size {
        AccessSize::Double => value,
        _ => value & ((1u64 << (size.bytes() * 8)) - 1),
    }
}

fn write_x(guest_state: &mut GuestState, n: u8, value: u64) {
    if let Some(reg) = guest_state.x.get_mut(n as usize) {
        *reg = value;
    }
}

pub(crate) enum ExitAction {
    Continue,
    Return(VcpuExit),
}

fn exit_with(key: u64, payload: PacketPayload) -> AxResult<ExitAction> {
    Ok(ExitAction::Return(VcpuExit::Packet(PortPacket::new(
        key, payload,
    ))))
}

/// Everything an exit handler may touch.
pub(crate) struct ExitContext<'a, A: GuestAddrSpace> {
    pub hcr: &'a mut HcrFlags,
    pub guest_state: &'a mut GuestState,
    pub gich_state: &'a GichState,
    pub gpas: &'a A,
    pub traps: &'a TrapMap,
    pub invalidator: &'a mut dyn StateInvalidator,
}

impl<A: GuestAddrSpace> ExitContext<'_, A> {
    pub fn handle(&mut self) -> AxResult<ExitAction> {
        let esr = self.guest_state.esr_el2;
        match ExceptionClass::from_esr(esr) {
            ExceptionClass::WfiWfe => self.handle_wfi_wfe(esr),
            ExceptionClass::Hvc64 => {
                // The preferred return address of an HVC is the next instruction.
                let x = &self.guest_state.x;
                exit_with(
                    0,
                    PacketPayload::Hypercall {
                        nr: x[0],
                        args: [x[1], x[2], x[3], x[4], x[5], x[6]],
                    },
                )
            }
            ExceptionClass::Smc64 => self.handle_smc(),
            ExceptionClass::SystemRegister => self.handle_system_register(esr),
            ExceptionClass::InstructionAbort => {
                let addr = fault_ipa(self.guest_state);
                self.gpas.page_fault(addr)?;
                Ok(ExitAction::Continue)
            }
            ExceptionClass::DataAbort => self.handle_data_abort(esr),
            ExceptionClass::Other(ec) => {
                debug!("unhandled exception class {:#x}, esr {:#x}", ec, esr);
                exit_with(
                    0,
                    PacketPayload::Fault {
                        esr,
                        addr: GuestPhysAddr::from(self.guest_state.far_el2 as usize),
                    },
                )
            }
        }
    }

    fn handle_wfi_wfe(&mut self, esr: u64) -> AxResult<ExitAction> {
        next_pc(self.guest_state);
        let is_wfe = iss(esr).get_bit(0);
        if is_wfe || self.gich_state.interrupt_tracker.has_pending() {
            return Ok(ExitAction::Continue);
        }
        exit_with(0, PacketPayload::Wfi)
    }

    fn handle_smc(&mut self) -> AxResult<ExitAction> {
        // A trapped SMC returns to the SMC itself.
        next_pc(self.guest_state);
        let x = self.guest_state.x;
        match x[0] {
            PSCI_CPU_ON_32 | PSCI_CPU_ON_64 => {
                self.guest_state.x[0] = PSCI_SUCCESS;
                exit_with(
                    0,
                    PacketPayload::Startup {
                        id: x[1],
                        entry: GuestPhysAddr::from(x[2] as usize),
                    },
                )
            }
            nr => exit_with(
                0,
                PacketPayload::Hypercall {
                    nr,
                    args: [x[1], x[2], x[3], x[4], x[5], x[6]],
                },
            ),
        }
    }

    fn handle_system_register(&mut self, esr: u64) -> AxResult<ExitAction> {
        let access = SystemRegisterAccess::from_esr(esr);
        let xt_value = read_x(self.guest_state, access.xt);
        let sys = &mut self.guest_state.system_state;
        let reg = match access.key {
            SCTLR_EL1 => &mut sys.sctlr_el1,
            TTBR0_EL1 => &mut sys.ttbr0_el1,
            TTBR1_EL1 => &mut sys.ttbr1_el1,
            TCR_EL1 => &mut sys.tcr_el1,
            ESR_EL1 => &mut sys.esr_el1,
            FAR_EL1 => &mut sys.far_el1,
            MAIR_EL1 => &mut sys.mair_el1,
            CONTEXTIDR_EL1 => &mut sys.contextidr_el1,
            _ => {
                debug!("unhandled system register access {:#x}", access.key);
                return exit_with(
                    0,
                    PacketPayload::Fault {
                        esr,
                        addr: GuestPhysAddr::from(0),
                    },
                );
            }
        };
        if access.read {
            let value = *reg;
            write_x(self.guest_state, access.xt, value);
        } else {
            *reg = xt_value;
            if access.key == SCTLR_EL1 && xt_value & SCTLR_ELX_M != 0 {
                // The guest turned its MMU on: stop forcing cacheable
                // accesses and stop trapping VM control registers.
                self.hcr.remove(HcrFlags::DC | HcrFlags::TVM);
                debug!("guest enabled its MMU, hcr {:#x}", self.hcr.bits());
            }
        }
        next_pc(self.guest_state);
        Ok(ExitAction::Continue)
    }

    fn handle_data_abort(&mut self, esr: u64) -> AxResult<ExitAction> {
        let addr = fault_ipa(self.guest_state);
        let trap = match self.traps.find_trap(TrapKind::Bell, addr.as_usize()) {
            Ok(trap) => trap,
            Err(AxError::NotFound) => {
                self.gpas.page_fault(addr)?;
                return Ok(ExitAction::Continue);
            }
            Err(err) => return Err(err),
        };
        let data_abort = DataAbort::from_esr(esr);

        match trap.kind() {
            TrapKind::Bell => {
                if data_abort.read {
                    return ax_err!(Unsupported, "read from a doorbell trap");
                }
                next_pc(self.guest_state);
                let packet = PortPacket::new(trap.key(), PacketPayload::Bell { addr });
                let invalidator: &mut dyn StateInvalidator = &mut *self.invalidator;
                trap.queue(packet, Some(invalidator))?;
                Ok(ExitAction::Return(VcpuExit::Queued { key: trap.key() }))
            }
            TrapKind::Mem => {
                if !data_abort.valid {
                    return ax_err!(InvalidData, "memory trap without instruction syndrome");
                }
                let data = if data_abort.read {
                    0
                } else {
                    truncate(read_x(self.guest_state, data_abort.xt), data_abort.size)
                };
                next_pc(self.guest_state);
                exit_with(
                    trap.key(),
                    PacketPayload::Mem {
                        addr,
                        access: MemAccess {
                            size: data_abort.size,
                            sign_extend: data_abort.sign_extend,
                            xt: data_abort.xt,
                            read: data_abort.read,
                            data,
                        },
                    },
                )
            }
        }
    }
}
