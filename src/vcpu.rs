use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use axaddrspace::GuestPhysAddr;
use axerrno::{ax_err, ax_err_type, AxResult};
use bitflags::bitflags;
use spin::Mutex;

use crate::el2::{El2State, El2StatePage, GuestState, MAX_APRS, MAX_LIST_REGISTERS};
use crate::exit::{ExitAction, ExitContext, VcpuExit};
use crate::gic::{gic_virt_iface, GicVirtIface};
use crate::gich::{AutoGich, GichState, InterruptType};
use crate::guest::Guest;
use crate::hal::{AxGuestHal, El2Exit};
use crate::regs::{read_group, write_group, VcpuStateKind};

bitflags! {
    /// `HCR_EL2` bits applied on every guest entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcrFlags: u64 {
        /// Stage 2 translation.
        const VM = 1 << 0;
        /// Stage 2 protection of stage 1 table walks.
        const PTW = 1 << 2;
        /// Route FIQs to EL2.
        const FMO = 1 << 3;
        /// Route IRQs to EL2.
        const IMO = 1 << 4;
        /// Route SErrors to EL2.
        const AMO = 1 << 5;
        /// Default cacheable while the guest MMU is off.
        const DC = 1 << 12;
        /// Trap WFI.
        const TWI = 1 << 13;
        /// Trap WFE.
        const TWE = 1 << 14;
        /// Trap SMC.
        const TSC = 1 << 19;
        /// Trap set/way cache maintenance.
        const TSW = 1 << 22;
        /// Trap writes to the VM control registers.
        const TVM = 1 << 26;
        /// EL1 is AArch64.
        const RW = 1 << 31;
    }
}

impl HcrFlags {
    /// Configuration of a VCPU that has not enabled its MMU yet.
    pub const GUEST_DEFAULT: Self = Self::VM
        .union(Self::PTW)
        .union(Self::FMO)
        .union(Self::IMO)
        .union(Self::AMO)
        .union(Self::DC)
        .union(Self::TWI)
        .union(Self::TWE)
        .union(Self::TSC)
        .union(Self::TSW)
        .union(Self::TVM)
        .union(Self::RW);
}

/// EL1h with all of DAIF masked.
const SPSR_EL1H_DAIF: u64 = 0b0101 | 0xf << 6;
/// `MPIDR_EL1` bit 31 is RES1.
const MPIDR_RES1: u64 = 1 << 31;

/// PPI of the EL1 virtual timer.
pub const TIMER_VECTOR: u32 = 27;
const CNTV_CTL_ENABLE: u64 = 1 << 0;
const CNTV_CTL_IMASK: u64 = 1 << 1;

/// A set of physical CPUs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// CPUs beyond the 64th cannot be named and yield an empty mask.
    pub const fn from_cpu(cpu: usize) -> Self {
        if cpu < 64 {
            Self(1 << cpu)
        } else {
            Self(0)
        }
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, cpu: usize) -> bool {
        cpu < 64 && self.0 & (1 << cpu) != 0
    }
}

/// The state of a virtual CPU.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuState {
    /// The vcpu hit an unrecoverable error and can no longer run.
    Invalid = 0,
    /// The vcpu is created and has never been resumed.
    Created = 1,
    /// The vcpu returned from a resume and can be resumed again.
    Ready = 2,
    /// A resume is preparing to enter the guest.
    Resuming = 3,
    /// The vcpu is executing guest code.
    InGuest = 4,
    /// The vcpu is handling a VM exit.
    ExitHandling = 5,
    /// The vcpu was destroyed.
    Destroyed = 6,
}

impl From<u8> for VcpuState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Created,
            2 => Self::Ready,
            3 => Self::Resuming,
            4 => Self::InGuest,
            5 => Self::ExitHandling,
            6 => Self::Destroyed,
            _ => Self::Invalid,
        }
    }
}

/// The part of the vcpu that only the resuming thread touches.
struct VcpuInner<H: AxGuestHal> {
    el2_state: El2StatePage<H::PagingHandler>,
    hcr: HcrFlags,
}

/// A virtual CPU of a [`Guest`].
///
/// One thread resumes the vcpu; any thread may inject interrupts into it.
pub struct Vcpu<H: AxGuestHal> {
    guest: Arc<Guest<H>>,
    vpid: u8,
    gic: &'static dyn GicVirtIface,
    state: AtomicU8,
    /// Set while the vcpu is in guest mode, or about to enter it.
    running: AtomicBool,
    /// The physical CPU that last resumed the vcpu.
    cpu: AtomicUsize,
    gich_state: GichState,
    inner: Mutex<VcpuInner<H>>,
}

impl<H: AxGuestHal> Vcpu<H> {
    /// Creates a vcpu of `guest` that starts executing at `entry`.
    pub fn new(guest: Arc<Guest<H>>, entry: GuestPhysAddr) -> AxResult<Self> {
        if !H::has_hardware_support() {
            return ax_err!(Unsupported, "virtualization extensions are not available");
        }
        let gic = gic_virt_iface()?;
        let num_pres = gic.get_num_pres();
        let num_lrs = gic.get_num_lrs();
        if num_pres < 5 || (1usize << (num_pres - 5)) > MAX_APRS {
            return ax_err!(Unsupported, "unsupported number of GIC priority bits");
        }
        if num_lrs as usize > MAX_LIST_REGISTERS {
            return ax_err!(Unsupported, "unsupported number of GIC list registers");
        }
        let num_aprs = 1u8 << (num_pres - 5);

        let mut el2_state = El2StatePage::new()?;
        let vpid = guest.alloc_vpid()?;

        let state = el2_state.state_mut();
        let guest_state = &mut state.guest_state;
        guest_state.elr_el2 = entry.as_usize() as u64;
        guest_state.spsr_el2 = SPSR_EL1H_DAIF;
        guest_state.vmpidr_el2 = MPIDR_RES1 | (vpid as u64 - 1);
        state
            .ich_state
            .init(num_aprs, num_lrs, gic.default_gich_vmcr());

        debug!(
            "VMID {}: vcpu {} created, entry {:#x}",
            guest.vmid(),
            vpid,
            entry.as_usize()
        );
        Ok(Self {
            guest,
            vpid,
            gic,
            state: AtomicU8::new(VcpuState::Created as u8),
            running: AtomicBool::new(false),
            cpu: AtomicUsize::new(0),
            gich_state: GichState::new(),
            inner: Mutex::new(VcpuInner {
                el2_state,
                hcr: HcrFlags::GUEST_DEFAULT,
            }),
        })
    }

    /// Get the id of the vcpu, unique within its guest.
    pub const fn vpid(&self) -> u8 {
        self.vpid
    }

    pub fn guest(&self) -> &Arc<Guest<H>> {
        &self.guest
    }

    /// Get the state of the vcpu.
    pub fn state(&self) -> VcpuState {
        VcpuState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether the vcpu is in guest mode.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn gich_state(&self) -> &GichState {
        &self.gich_state
    }

    /// The `HCR_EL2` value used on the next entry. Waits for an in-progress
    /// resume to return.
    pub fn hcr(&self) -> HcrFlags {
        self.inner.lock().hcr
    }

    /// Transition the state of the vcpu. If the current state is not one of
    /// `from`, return an error and leave the state unchanged.
    pub fn transition_state(&self, from: &[VcpuState], to: VcpuState) -> AxResult {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                from.contains(&VcpuState::from(current))
                    .then_some(to as u8)
            })
            .map(|_| ())
            .map_err(|current| {
                ax_err_type!(
                    BadState,
                    format!(
                        "VCpu state is {:?}, expected one of {:?}",
                        VcpuState::from(current),
                        from
                    )
                )
            })
    }

    fn set_state(&self, state: VcpuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Runs the vcpu until an exit the caller has to see.
    ///
    /// Exits the hypervisor can handle itself (physical interrupts, stage 2
    /// faults outside any trap, trapped VM control register writes, WFE,
    /// WFI with an interrupt pending) re-enter the guest without returning.
    pub fn resume(&self) -> AxResult<VcpuExit> {
        self.transition_state(&[VcpuState::Created, VcpuState::Ready], VcpuState::Resuming)?;
        let result = self.resume_loop();
        // A fatal entry failure has already poisoned the vcpu.
        let _ = self.transition_state(
            &[
                VcpuState::Resuming,
                VcpuState::InGuest,
                VcpuState::ExitHandling,
            ],
            VcpuState::Ready,
        );
        result
    }

    fn resume_loop(&self) -> AxResult<VcpuExit> {
        let mut inner = self.inner.lock();
        let VcpuInner { el2_state, hcr } = &mut *inner;
        let el2_paddr = el2_state.paddr();
        let ich_paddr = el2_state.ich_state_paddr();
        let vttbr = self.guest.vttbr();

        loop {
            let El2State {
                guest_state,
                ich_state,
                ..
            } = el2_state.state_mut();
            self.timer_maybe_interrupt(guest_state)?;

            // `running` is raised before pending vectors are drained, so an
            // interrupt tracked after the drain always sees it and kicks us.
            self.cpu.store(H::current_cpu(), Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            let pending = self.gich_state.maybe_interrupt(self.gic, ich_state);

            let action = {
                let mut auto_gich = AutoGich::new(self.gic, ich_state, ich_paddr, pending);
                self.set_state(VcpuState::InGuest);
                trace!("vcpu {} entering guest, elr {:#x}", self.vpid, guest_state.elr_el2);
                // SAFETY: the EL2 state page is owned by this vcpu and not
                // touched by the host until the world switch returns.
                let exit = unsafe { H::el2_resume(vttbr, el2_paddr, hcr.bits()) };
                self.running.store(false, Ordering::SeqCst);
                self.set_state(VcpuState::ExitHandling);
                trace!("vcpu {} exited guest: {:?}", self.vpid, exit);

                match exit {
                    Ok(El2Exit::Irq) => {
                        H::irq_handler();
                        Ok(ExitAction::Continue)
                    }
                    Ok(El2Exit::Exception) => ExitContext {
                        hcr: &mut *hcr,
                        guest_state: &mut *guest_state,
                        gich_state: &self.gich_state,
                        gpas: self.guest.gpas(),
                        traps: self.guest.traps(),
                        invalidator: &mut auto_gich,
                    }
                    .handle(),
                    Err(err) => {
                        error!(
                            "VMID {}: vcpu {} entry failed with {:?}, state is lost",
                            self.guest.vmid(),
                            self.vpid,
                            err
                        );
                        self.set_state(VcpuState::Invalid);
                        ax_err!(BadState, "guest entry primitive failed")
                    }
                }
            };
            self.gich_state.update_active_interrupts(self.gic, ich_state);

            match action? {
                ExitAction::Continue => continue,
                ExitAction::Return(exit) => return Ok(exit),
            }
        }
    }

    fn timer_maybe_interrupt(&self, guest_state: &GuestState) -> AxResult {
        let ctl = guest_state.cntv_ctl_el0;
        if ctl & CNTV_CTL_ENABLE != 0
            && ctl & CNTV_CTL_IMASK == 0
            && H::current_ticks() >= guest_state.cntv_cval_el0
        {
            self.gich_state
                .interrupt_tracker
                .track(TIMER_VECTOR, InterruptType::Virtual)?;
        }
        Ok(())
    }

    /// Marks `vector` pending.
    ///
    /// If the vcpu is in guest mode on another CPU, returns that CPU so the
    /// caller can send it an IPI; the resulting exit makes the vector
    /// visible to the guest. Otherwise the next resume picks it up.
    pub fn interrupt(&self, vector: u32, ty: InterruptType) -> AxResult<CpuMask> {
        self.gich_state
            .interrupt_tracker
            .track_then(vector, ty, || {
                if !self.running.load(Ordering::SeqCst) {
                    return CpuMask::empty();
                }
                let cpu = self.cpu.load(Ordering::SeqCst);
                if cpu == H::current_cpu() {
                    CpuMask::empty()
                } else {
                    CpuMask::from_cpu(cpu)
                }
            })
    }

    /// Marks a purely virtual `vector` pending, and kicks the vcpu if it is
    /// running elsewhere.
    pub fn virtual_interrupt(&self, vector: u32) -> AxResult {
        let mask = self.interrupt(vector, InterruptType::Virtual)?;
        if !mask.is_empty() {
            H::send_ipi(mask);
        }
        Ok(())
    }

    /// Copies the register group `kind` into `buf`, which must be exactly
    /// [`VcpuStateKind::size`] bytes.
    pub fn read_state(&self, kind: VcpuStateKind, buf: &mut [u8]) -> AxResult {
        let inner = self
            .inner
            .try_lock()
            .ok_or_else(|| ax_err_type!(BadState, "vcpu is running"))?;
        read_group(&inner.el2_state.state().guest_state, kind, buf)
    }

    /// Loads the register group `kind` from `buf`, which must be exactly
    /// [`VcpuStateKind::size`] bytes.
    pub fn write_state(&self, kind: VcpuStateKind, buf: &[u8]) -> AxResult {
        let mut inner = self
            .inner
            .try_lock()
            .ok_or_else(|| ax_err_type!(BadState, "vcpu is running"))?;
        write_group(&mut inner.el2_state.state_mut().guest_state, kind, buf)
    }

    /// Retires the vcpu. Later resumes fail.
    pub fn destroy(&self) -> AxResult {
        self.transition_state(&[VcpuState::Created, VcpuState::Ready], VcpuState::Destroyed)?;
        debug!("VMID {}: vcpu {} destroyed", self.guest.vmid(), self.vpid);
        Ok(())
    }
}

impl<H: AxGuestHal> Drop for Vcpu<H> {
    fn drop(&mut self) {
        debug_assert!(!self.is_running(), "vcpu dropped while in guest mode");
        if self.guest.free_vpid(self.vpid).is_err() {
            warn!("vcpu {} id was already released", self.vpid);
        }
    }
}
