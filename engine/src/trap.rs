//! Trap engine: cause codes, prioritization, and trap entry/return.

use crate::csr::{interrupts, mstatus, CsrFile};
use crate::Mode;

/// Synchronous exception causes used by this core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    InstructionAddressMisaligned,
    InstructionAccessFault,
    IllegalInstruction,
    Breakpoint,
    LoadAddressMisaligned,
    LoadAccessFault,
    StoreAddressMisaligned,
    StoreAccessFault,
    EcallFromU,
    EcallFromS,
    EcallFromM,
}

impl Exception {
    pub fn code(self) -> u64 {
        match self {
            Exception::InstructionAddressMisaligned => 0,
            Exception::InstructionAccessFault => 1,
            Exception::IllegalInstruction => 2,
            Exception::Breakpoint => 3,
            Exception::LoadAddressMisaligned => 4,
            Exception::LoadAccessFault => 5,
            Exception::StoreAddressMisaligned => 6,
            Exception::StoreAccessFault => 7,
            Exception::EcallFromU => 8,
            Exception::EcallFromS => 9,
            Exception::EcallFromM => 11,
        }
    }

    pub fn ecall_from(mode: Mode) -> Exception {
        match mode {
            Mode::U => Exception::EcallFromU,
            Mode::S => Exception::EcallFromS,
            Mode::M => Exception::EcallFromM,
        }
    }
}

/// Interrupt causes, by `mip`/`mie` bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interrupt {
    SupervisorSoftware,
    MachineSoftware,
    SupervisorTimer,
    MachineTimer,
    SupervisorExternal,
    MachineExternal,
}

impl Interrupt {
    pub fn code(self) -> u64 {
        match self {
            Interrupt::SupervisorSoftware => 1,
            Interrupt::MachineSoftware => 3,
            Interrupt::SupervisorTimer => 5,
            Interrupt::MachineTimer => 7,
            Interrupt::SupervisorExternal => 9,
            Interrupt::MachineExternal => 11,
        }
    }

    fn from_bit(bit: u64) -> Interrupt {
        match bit {
            interrupts::SSI => Interrupt::SupervisorSoftware,
            interrupts::MSI => Interrupt::MachineSoftware,
            interrupts::STI => Interrupt::SupervisorTimer,
            interrupts::MTI => Interrupt::MachineTimer,
            interrupts::SEI => Interrupt::SupervisorExternal,
            interrupts::MEI => Interrupt::MachineExternal,
            _ => unreachable!("not a single interrupt bit"),
        }
    }
}

/// Either a synchronous exception or a pending interrupt, ready for delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trap {
    Exception(Exception),
    Interrupt(Interrupt),
}

impl Trap {
    pub fn cause(self) -> u64 {
        match self {
            Trap::Exception(e) => e.code(),
            Trap::Interrupt(i) => (1 << 63) | i.code(),
        }
    }
}

/// `mcause` decoded back into a human-readable name, for the debugger's `csr
/// mcause` display.
pub fn describe_cause(mcause: u64) -> &'static str {
    if (mcause as i64) < 0 {
        match mcause & !(1 << 63) {
            1 => "supervisor software interrupt",
            3 => "machine software interrupt",
            5 => "supervisor timer interrupt",
            7 => "machine timer interrupt",
            9 => "supervisor external interrupt",
            11 => "machine external interrupt",
            _ => "unknown interrupt",
        }
    } else {
        match mcause {
            0 => "instruction address misaligned",
            1 => "instruction access fault",
            2 => "illegal instruction",
            3 => "breakpoint",
            4 => "load address misaligned",
            5 => "load access fault",
            6 => "store/amo address misaligned",
            7 => "store/amo access fault",
            8 => "ecall from u-mode",
            9 => "ecall from s-mode",
            11 => "ecall from m-mode",
            _ => "unknown exception",
        }
    }
}

/// Returns the highest-priority pending-and-enabled interrupt, if any.
///
/// Delegation is not modelled (`medeleg`/`mideleg` are always zero per
/// this core), so the global enable is simply `mstatus.MIE` while in
/// M-mode, and always-enabled while in S or U mode (a lower-privilege mode
/// can never mask an interrupt targeting a higher one).
pub fn pending_interrupt(csrs: &CsrFile, privilege: Mode) -> Option<Interrupt> {
    let global_enabled = match privilege {
        Mode::M => mstatus::get_field(csrs.mstatus, mstatus::MIE_OFFSET, mstatus::MIE_MASK) != 0,
        Mode::S | Mode::U => true,
    };
    if !global_enabled {
        return None;
    }
    let pending = csrs.mip & csrs.mie;
    for bit in interrupts::PRIORITY {
        if pending & bit != 0 {
            return Some(Interrupt::from_bit(bit));
        }
    }
    None
}

/// Trap entry: always targets M-mode (no delegation),
///
/// `pc` is the PC to record in `mepc`: the not-yet-executed instruction for
/// an interrupt, or the faulting/ECALL instruction for an exception.
pub fn enter_trap(csrs: &mut CsrFile, privilege: &mut Mode, pc: u64, trap: Trap, tval: u64) -> u64 {
    csrs.mcause = trap.cause();
    csrs.mepc = pc;
    csrs.mtval = tval;

    let mie = mstatus::get_field(csrs.mstatus, mstatus::MIE_OFFSET, mstatus::MIE_MASK);
    mstatus::set_field(&mut csrs.mstatus, mstatus::MPIE_OFFSET, mstatus::MPIE_MASK, mie);
    mstatus::set_field(&mut csrs.mstatus, mstatus::MIE_OFFSET, mstatus::MIE_MASK, 0);
    mstatus::set_field(
        &mut csrs.mstatus,
        mstatus::MPP_OFFSET,
        mstatus::MPP_MASK,
        (*privilege).to_bits(),
    );
    *privilege = Mode::M;

    match trap {
        Trap::Interrupt(i) if csrs.mtvec_is_vectored() => csrs.mtvec_base() + 4 * i.code(),
        _ => csrs.mtvec_base(),
    }
}

/// `MRET`: return from an M-mode trap. Returns the new PC.
pub fn mret(csrs: &mut CsrFile, privilege: &mut Mode) -> u64 {
    let mpie = mstatus::get_field(csrs.mstatus, mstatus::MPIE_OFFSET, mstatus::MPIE_MASK);
    mstatus::set_field(&mut csrs.mstatus, mstatus::MIE_OFFSET, mstatus::MIE_MASK, mpie);
    mstatus::set_field(&mut csrs.mstatus, mstatus::MPIE_OFFSET, mstatus::MPIE_MASK, 1);
    let mpp = mstatus::get_field(csrs.mstatus, mstatus::MPP_OFFSET, mstatus::MPP_MASK);
    *privilege = Mode::from_bits(mpp);
    mstatus::set_field(
        &mut csrs.mstatus,
        mstatus::MPP_OFFSET,
        mstatus::MPP_MASK,
        Mode::U.to_bits(),
    );
    csrs.mepc
}

/// `SRET`: return from an S-mode trap. Returns the new PC.
pub fn sret(csrs: &mut CsrFile, privilege: &mut Mode) -> u64 {
    let spie = mstatus::get_field(csrs.mstatus, mstatus::SPIE_OFFSET, mstatus::SPIE_MASK);
    mstatus::set_field(&mut csrs.mstatus, mstatus::SIE_OFFSET, mstatus::SIE_MASK, spie);
    mstatus::set_field(&mut csrs.mstatus, mstatus::SPIE_OFFSET, mstatus::SPIE_MASK, 1);
    let spp = mstatus::get_field(csrs.mstatus, mstatus::SPP_OFFSET, mstatus::SPP_MASK);
    *privilege = if spp == 0 { Mode::U } else { Mode::S };
    mstatus::set_field(
        &mut csrs.mstatus,
        mstatus::SPP_OFFSET,
        mstatus::SPP_MASK,
        Mode::U.to_bits() & 0b1,
    );
    csrs.sepc
}
