// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxGuest - Guest and virtual CPU core for ArceOS hypervisors on AArch64.
//!
//! This crate owns the per-guest and per-VCPU state of a hypervisor running
//! at EL2 with a GICv3 interrupt controller. The host kernel plugs in the
//! privileged pieces through [`AxGuestHal`] and [`AxGicHal`], and registers a
//! [`GicVirtIface`] backend once at boot.
//!
//! # Features
//!
//! - Guests with a VMID, a guest physical address space and trapped ranges
//! - VCPU lifecycle (Created → Resuming → InGuest ⇄ ExitHandling → Destroyed)
//! - Virtual interrupt injection through GICv3 list registers
//! - Trap delivery to user-mode ports with bounded, blocking packet allocation
//! - Register group access for the VMM

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

mod el2; // Memory shared with the EL2 world switch
mod exit; // VM exit decoding and handling
mod gic; // GICv3 hypervisor interface backend
mod gich; // Pending and active virtual interrupt bookkeeping
mod guest; // Guests, VMIDs and trap registration
mod hal; // Hardware abstraction layer interfaces
mod id_alloc; // Small integer id allocator
mod port; // Port packets and the blocking packet allocator
mod regs; // Register groups exposed to the VMM
mod trap; // Trapped ranges
mod vcpu; // VCpu state machine and resume loop

// Public API exports
pub use el2::{
    DebugState, El2State, El2StatePage, FpState, GuestState, HostState, IchState, SystemState,
    MAX_APRS, MAX_LIST_REGISTERS,
};
pub use exit::{fault_ipa, DataAbort, ExceptionClass, SystemRegisterAccess, VcpuExit};
pub use gic::{gic_virt_iface, register_gic_virt_iface, GicV3, GicVirtIface};
pub use gich::{
    AutoGich, GichState, InterruptBitmap, InterruptTracker, InterruptType, StateInvalidator,
    NUM_INTERRUPTS,
};
pub use guest::{global_vmid_pool, Guest, VmidPool, MAX_GUESTS, MAX_VCPUS_PER_GUEST};
pub use hal::{AxGicHal, AxGuestHal, El2Exit, GuestAddrSpace};
pub use port::{
    AccessSize, BlockingPortAllocator, MemAccess, PacketPayload, PacketRef, Port, PortPacket,
};
pub use regs::{VcpuGeneralRegs, VcpuStateKind};
pub use trap::{Trap, TrapKind, TrapMap, TRAP_PACKET_CAPACITY};
pub use vcpu::*;
