//! Interpreter: execute one decoded instruction against a [`Hart`] and [`Bus`].

use crate::bus::Bus;
use crate::csr::{mstatus, Csr, CsrFile};
use crate::decoder::{
    decode, AluOp, Branch, CsrOp, FpOp, Instr, LoadWidth, MulOp, StoreWidth,
};
use crate::device::Width;
use crate::registers::{FRegister, Register};
use crate::trap::{self, enter_trap, Exception, Trap};
use crate::{Hart, Mode};

/// A synchronous fault with the `mtval` value it should be recorded with.
struct Fault {
    exception: Exception,
    tval: u64,
}

impl From<Exception> for Fault {
    fn from(exception: Exception) -> Self {
        Fault { exception, tval: 0 }
    }
}

type StepResult = Result<Option<u64>, Fault>;

/// Fetch, decode and execute one instruction, handling any resulting
/// exception by entering a trap. Does not check for pending interrupts:
/// the core loop samples those immediately before calling this.
pub fn execute_one(hart: &mut Hart, bus: &mut Bus) {
    let pc = hart.pc;
    let outcome = run_one(hart, bus, pc);
    match outcome {
        Ok(Some(next_pc)) => hart.pc = next_pc,
        Ok(None) => hart.pc = pc.wrapping_add(4),
        Err(fault) => {
            let new_pc = enter_trap(
                &mut hart.csrs,
                &mut hart.privilege,
                pc,
                Trap::Exception(fault.exception),
                fault.tval,
            );
            hart.pc = new_pc;
        }
    }
    hart.retired = hart.retired.wrapping_add(1);
}

/// Deliver a pending interrupt, as sampled by the core loop before fetch.
pub fn take_interrupt(hart: &mut Hart, interrupt: trap::Interrupt) {
    let pc = hart.pc;
    let new_pc = enter_trap(&mut hart.csrs, &mut hart.privilege, pc, Trap::Interrupt(interrupt), 0);
    hart.pc = new_pc;
}

fn run_one(hart: &mut Hart, bus: &mut Bus, pc: u64) -> StepResult {
    let word = bus.fetch(pc).map_err(|e| Fault { exception: e, tval: pc })?;
    let instr = decode(word).map_err(Fault::from)?;
    execute(hart, bus, instr)
}

fn load_width_bytes(w: LoadWidth) -> Width {
    match w {
        LoadWidth::B | LoadWidth::Bu => Width::Byte,
        LoadWidth::H | LoadWidth::Hu => Width::Half,
        LoadWidth::W | LoadWidth::Wu => Width::Word,
        LoadWidth::D => Width::Double,
    }
}

fn store_width_bytes(w: StoreWidth) -> Width {
    match w {
        StoreWidth::B => Width::Byte,
        StoreWidth::H => Width::Half,
        StoreWidth::W => Width::Word,
        StoreWidth::D => Width::Double,
    }
}

fn sign_extend_load(value: u64, width: LoadWidth) -> u64 {
    match width {
        LoadWidth::B => (value as u8 as i8 as i64) as u64,
        LoadWidth::H => (value as u16 as i16 as i64) as u64,
        LoadWidth::W => (value as u32 as i32 as i64) as u64,
        LoadWidth::Bu | LoadWidth::Hu | LoadWidth::Wu | LoadWidth::D => value,
    }
}

fn alu(op: AluOp, a: u64, b: u64) -> u64 {
    match op {
        AluOp::Add => a.wrapping_add(b),
        AluOp::Sub => a.wrapping_sub(b),
        AluOp::Sll => a.wrapping_shl(b as u32 & 0x3f),
        AluOp::Slt => ((a as i64) < (b as i64)) as u64,
        AluOp::Sltu => (a < b) as u64,
        AluOp::Xor => a ^ b,
        AluOp::Srl => a.wrapping_shr(b as u32 & 0x3f),
        AluOp::Sra => ((a as i64).wrapping_shr(b as u32 & 0x3f)) as u64,
        AluOp::Or => a | b,
        AluOp::And => a & b,
    }
}

fn alu32(op: AluOp, a: u32, b: u32) -> i32 {
    match op {
        AluOp::Add => a.wrapping_add(b) as i32,
        AluOp::Sub => a.wrapping_sub(b) as i32,
        AluOp::Sll => a.wrapping_shl(b & 0x1f) as i32,
        AluOp::Srl => a.wrapping_shr(b & 0x1f) as i32,
        AluOp::Sra => (a as i32).wrapping_shr(b & 0x1f),
        _ => unreachable!("W-suffixed ops only use add/shift"),
    }
}

/// Division/remainder with the WARL-like quotient/remainder this core requires.
fn muldiv(op: MulOp, a: u64, b: u64) -> u64 {
    match op {
        MulOp::Mul => a.wrapping_mul(b),
        MulOp::Mulh => (((a as i64 as i128) * (b as i64 as i128)) >> 64) as u64,
        MulOp::Mulhsu => (((a as i64 as i128) * (b as u128 as i128)) >> 64) as u64,
        MulOp::Mulhu => (((a as u128) * (b as u128)) >> 64) as u64,
        MulOp::Div => {
            let (a, b) = (a as i64, b as i64);
            if b == 0 {
                u64::MAX
            } else if a == i64::MIN && b == -1 {
                a as u64
            } else {
                (a / b) as u64
            }
        }
        MulOp::Divu => {
            if b == 0 {
                u64::MAX
            } else {
                a / b
            }
        }
        MulOp::Rem => {
            let (a, b) = (a as i64, b as i64);
            if b == 0 {
                a as u64
            } else if a == i64::MIN && b == -1 {
                0
            } else {
                (a % b) as u64
            }
        }
        MulOp::Remu => {
            if b == 0 {
                a
            } else {
                a % b
            }
        }
    }
}

fn muldiv32(op: MulOp, a: u32, b: u32) -> i32 {
    match op {
        MulOp::Mul => a.wrapping_mul(b) as i32,
        MulOp::Div => {
            let (a, b) = (a as i32, b as i32);
            if b == 0 {
                -1
            } else if a == i32::MIN && b == -1 {
                a
            } else {
                a / b
            }
        }
        MulOp::Divu => {
            if b == 0 {
                -1i32
            } else {
                (a / b) as i32
            }
        }
        MulOp::Rem => {
            let (a, b) = (a as i32, b as i32);
            if b == 0 {
                a
            } else if a == i32::MIN && b == -1 {
                0
            } else {
                a % b
            }
        }
        MulOp::Remu => {
            if b == 0 {
                a as i32
            } else {
                (a % b) as i32
            }
        }
        _ => unreachable!("no W-suffixed mulh variants"),
    }
}

fn branch_taken(op: Branch, a: u64, b: u64) -> bool {
    match op {
        Branch::Beq => a == b,
        Branch::Bne => a != b,
        Branch::Blt => (a as i64) < (b as i64),
        Branch::Bge => (a as i64) >= (b as i64),
        Branch::Bltu => a < b,
        Branch::Bgeu => a >= b,
    }
}

fn require_fp_enabled(hart: &Hart) -> Result<(), Fault> {
    if mstatus::get_field(hart.csrs.mstatus, mstatus::FS_OFFSET, mstatus::FS_MASK) == 0 {
        return Err(Exception::IllegalInstruction.into());
    }
    Ok(())
}

fn csr_write_conditional(
    csrs: &mut CsrFile,
    csr: Csr,
    privilege: Mode,
    op: CsrOp,
    operand: u64,
    old: u64,
    should_write: bool,
) -> Result<(), Fault> {
    if !should_write {
        return Ok(());
    }
    let new = match op {
        CsrOp::Rw => operand,
        CsrOp::Rs => old | operand,
        CsrOp::Rc => old & !operand,
    };
    csrs.write(csr, new, privilege).map_err(Fault::from)
}

fn execute(hart: &mut Hart, bus: &mut Bus, instr: Instr) -> StepResult {
    match instr {
        Instr::Lui { rd, imm } => {
            hart.write_x(rd, imm as u64);
            Ok(None)
        }
        Instr::Auipc { rd, imm } => {
            hart.write_x(rd, hart.pc.wrapping_add(imm as u64));
            Ok(None)
        }
        Instr::Jal { rd, imm } => {
            let target = hart.pc.wrapping_add(imm as u64);
            if target % 4 != 0 {
                return Err(Fault { exception: Exception::InstructionAddressMisaligned, tval: target });
            }
            hart.write_x(rd, hart.pc.wrapping_add(4));
            Ok(Some(target))
        }
        Instr::Jalr { rd, rs1, imm } => {
            let target = hart.read_x(rs1).wrapping_add(imm as u64) & !1;
            if target % 4 != 0 {
                return Err(Fault { exception: Exception::InstructionAddressMisaligned, tval: target });
            }
            hart.write_x(rd, hart.pc.wrapping_add(4));
            Ok(Some(target))
        }
        Instr::Branch { op, rs1, rs2, imm } => {
            if branch_taken(op, hart.read_x(rs1), hart.read_x(rs2)) {
                let target = hart.pc.wrapping_add(imm as u64);
                if target % 4 != 0 {
                    return Err(Fault { exception: Exception::InstructionAddressMisaligned, tval: target });
                }
                Ok(Some(target))
            } else {
                Ok(None)
            }
        }
        Instr::Load { width, rd, rs1, imm } => {
            let addr = hart.read_x(rs1).wrapping_add(imm as u64);
            let bytes = load_width_bytes(width);
            let value = bus.read(addr, bytes).map_err(|e| Fault { exception: e, tval: addr })?;
            hart.write_x(rd, sign_extend_load(value, width));
            Ok(None)
        }
        Instr::Store { width, rs1, rs2, imm } => {
            let addr = hart.read_x(rs1).wrapping_add(imm as u64);
            let bytes = store_width_bytes(width);
            bus.write(addr, bytes, hart.read_x(rs2))
                .map_err(|e| Fault { exception: e, tval: addr })?;
            Ok(None)
        }
        Instr::AluImm { op, rd, rs1, imm } => {
            hart.write_x(rd, alu(op, hart.read_x(rs1), imm as u64));
            Ok(None)
        }
        Instr::AluImmW { op, rd, rs1, imm } => {
            let result = alu32(op, hart.read_x(rs1) as u32, imm as u32);
            hart.write_x(rd, result as i64 as u64);
            Ok(None)
        }
        Instr::Alu { op, rd, rs1, rs2 } => {
            hart.write_x(rd, alu(op, hart.read_x(rs1), hart.read_x(rs2)));
            Ok(None)
        }
        Instr::AluW { op, rd, rs1, rs2 } => {
            let result = alu32(op, hart.read_x(rs1) as u32, hart.read_x(rs2) as u32);
            hart.write_x(rd, result as i64 as u64);
            Ok(None)
        }
        Instr::Mul { op, rd, rs1, rs2 } => {
            hart.write_x(rd, muldiv(op, hart.read_x(rs1), hart.read_x(rs2)));
            Ok(None)
        }
        Instr::MulW { op, rd, rs1, rs2 } => {
            let result = muldiv32(op, hart.read_x(rs1) as u32, hart.read_x(rs2) as u32);
            hart.write_x(rd, result as i64 as u64);
            Ok(None)
        }
        Instr::Fence => Ok(None),
        Instr::Ecall => Err(Fault { exception: Exception::ecall_from(hart.privilege), tval: 0 }),
        Instr::Ebreak => Err(Fault { exception: Exception::Breakpoint, tval: hart.pc }),
        Instr::Mret => {
            if hart.privilege != Mode::M {
                return Err(Exception::IllegalInstruction.into());
            }
            Ok(Some(trap::mret(&mut hart.csrs, &mut hart.privilege)))
        }
        Instr::Sret => {
            if (hart.privilege as u8) < (Mode::S as u8) {
                return Err(Exception::IllegalInstruction.into());
            }
            Ok(Some(trap::sret(&mut hart.csrs, &mut hart.privilege)))
        }
        Instr::Wfi => Ok(None),
        Instr::Csr { op, rd, rs1, csr, use_imm, imm } => {
            let old = hart.csrs.read(csr, hart.privilege).map_err(Fault::from)?;
            let operand = if use_imm { imm } else { hart.read_x(rs1) };
            let should_write = match op {
                CsrOp::Rw => true,
                CsrOp::Rs | CsrOp::Rc => {
                    if use_imm {
                        imm != 0
                    } else {
                        rs1 != Register::X0
                    }
                }
            };
            csr_write_conditional(&mut hart.csrs, csr, hart.privilege, op, operand, old, should_write)?;
            if rd != Register::X0 {
                hart.write_x(rd, old);
            }
            Ok(None)
        }
        Instr::FLoad { rd, rs1, imm } => {
            require_fp_enabled(hart)?;
            let addr = hart.read_x(rs1).wrapping_add(imm as u64);
            let value = bus.read(addr, Width::Word).map_err(|e| Fault { exception: e, tval: addr })?;
            hart.f[rd.index()] = f32::from_bits(value as u32);
            Ok(None)
        }
        Instr::FStore { rs1, rs2, imm } => {
            require_fp_enabled(hart)?;
            let addr = hart.read_x(rs1).wrapping_add(imm as u64);
            let bits = hart.f[rs2.index()].to_bits();
            bus.write(addr, Width::Word, bits as u64)
                .map_err(|e| Fault { exception: e, tval: addr })?;
            Ok(None)
        }
        Instr::FOp2 { op, rd, rs1, rs2, .. } => {
            require_fp_enabled(hart)?;
            let a = hart.f[rs1.index()];
            let b = hart.f[rs2.index()];
            let result = match op {
                FpOp::Add => a + b,
                FpOp::Sub => a - b,
                FpOp::Mul => a * b,
                FpOp::Div => a / b,
                FpOp::SgnJ => f32::from_bits((a.to_bits() & 0x7fff_ffff) | (b.to_bits() & 0x8000_0000)),
                FpOp::SgnJn => f32::from_bits((a.to_bits() & 0x7fff_ffff) | (!b.to_bits() & 0x8000_0000)),
                FpOp::SgnJx => f32::from_bits(a.to_bits() ^ (b.to_bits() & 0x8000_0000)),
                FpOp::Min => fp_min(a, b),
                FpOp::Max => fp_max(a, b),
                _ => unreachable!("decoder only produces arithmetic ops here"),
            };
            hart.f[rd.index()] = result;
            Ok(None)
        }
        Instr::FOp1 { op, rd, rs1, .. } => {
            require_fp_enabled(hart)?;
            let a = hart.f[rs1.index()];
            let result = match op {
                FpOp::Sqrt => a.sqrt(),
                _ => unreachable!("decoder only produces sqrt here"),
            };
            hart.f[rd.index()] = result;
            Ok(None)
        }
        Instr::FOp1Int { op, rd, rs1, .. } => {
            require_fp_enabled(hart)?;
            let a = hart.f[rs1.index()];
            let value: u64 = match op {
                FpOp::CvtWS => (a as i32) as i64 as u64,
                FpOp::CvtWuS => (a as u32) as i64 as u64,
                FpOp::CvtLS => a as i64 as u64,
                FpOp::CvtLuS => a as u64,
                FpOp::MvXW => a.to_bits() as i32 as i64 as u64,
                FpOp::Class => fp_classify(a),
                _ => unreachable!(),
            };
            hart.write_x(rd, value);
            Ok(None)
        }
        Instr::FOp1FromInt { op, rd, rs1, .. } => {
            require_fp_enabled(hart)?;
            let x = hart.read_x(rs1);
            let result = match op {
                FpOp::CvtSW => (x as i32) as f32,
                FpOp::CvtSWu => (x as u32) as f32,
                FpOp::CvtSL => (x as i64) as f32,
                FpOp::CvtSLu => x as f32,
                FpOp::MvWX => f32::from_bits(x as u32),
                _ => unreachable!(),
            };
            hart.f[rd.index()] = result;
            Ok(None)
        }
        Instr::FCmp { op, rd, rs1, rs2 } => {
            require_fp_enabled(hart)?;
            let a = hart.f[rs1.index()];
            let b = hart.f[rs2.index()];
            let result = match op {
                FpOp::Eq => a == b,
                FpOp::Lt => a < b,
                FpOp::Le => a <= b,
                _ => unreachable!(),
            };
            hart.write_x(rd, result as u64);
            Ok(None)
        }
    }
}

fn fp_min(a: f32, b: f32) -> f32 {
    if a.is_nan() {
        b
    } else if b.is_nan() {
        a
    } else {
        a.min(b)
    }
}

fn fp_max(a: f32, b: f32) -> f32 {
    if a.is_nan() {
        b
    } else if b.is_nan() {
        a
    } else {
        a.max(b)
    }
}

fn fp_classify(a: f32) -> u64 {
    let bits = a.to_bits();
    let sign = bits >> 31 != 0;
    if a.is_nan() {
        let quiet = bits & (1 << 22) != 0;
        return if quiet { 1 << 9 } else { 1 << 8 };
    }
    if a.is_infinite() {
        return if sign { 1 << 0 } else { 1 << 7 };
    }
    if a == 0.0 {
        return if sign { 1 << 3 } else { 1 << 4 };
    }
    if a.is_subnormal() {
        return if sign { 1 << 2 } else { 1 << 5 };
    }
    if sign {
        1 << 1
    } else {
        1 << 6
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;

    fn enable_fp(hart: &mut Hart) {
        mstatus::set_field(&mut hart.csrs.mstatus, mstatus::FS_OFFSET, mstatus::FS_MASK, 1);
    }

    #[test]
    fn addi_writes_register() {
        let mut hart = Hart::new(0x8000_0000, 0);
        let mut bus = Bus::new();
        bus.ram.write(0x8000_0000, Width::Word, 0x00500093).unwrap(); // addi x1, x0, 5
        execute_one(&mut hart, &mut bus);
        assert_eq!(hart.read_x(Register::X1), 5);
        assert_eq!(hart.pc, 0x8000_0004);
    }

    #[test]
    fn div_by_zero_yields_all_ones_quotient() {
        assert_eq!(muldiv(MulOp::Div, 10, 0), u64::MAX);
        assert_eq!(muldiv(MulOp::Rem, 10, 0), 10);
    }

    #[test]
    fn div_overflow_yields_min_and_zero_remainder() {
        assert_eq!(muldiv(MulOp::Div, i64::MIN as u64, u64::MAX), i64::MIN as u64);
        assert_eq!(muldiv(MulOp::Rem, i64::MIN as u64, u64::MAX), 0);
    }

    #[test]
    fn jalr_misaligned_target_traps_without_writing_rd() {
        let mut hart = Hart::new(0x8000_0000, 0);
        let mut bus = Bus::new();
        hart.write_x(Register::X2, 0x8000_0001);
        // jalr x1, 1(x2): target = (0x8000_0002) & !1 = 0x8000_0002, not 4-aligned.
        let instr = Instr::Jalr { rd: Register::X1, rs1: Register::X2, imm: 1 };
        execute(&mut hart, &mut bus, instr).unwrap_err();
        assert_eq!(hart.read_x(Register::X1), 0, "rd must not be written when the jump traps");
    }

    #[test]
    fn ecall_from_m_traps_with_code_11() {
        let mut hart = Hart::new(0x8000_0000, 0);
        let mut bus = Bus::new();
        bus.ram.write(0x8000_0000, Width::Word, 0x00000073).unwrap(); // ecall
        execute_one(&mut hart, &mut bus);
        assert_eq!(hart.csrs.mcause, 11);
        assert_eq!(hart.csrs.mepc, 0x8000_0000);
    }

    #[test]
    fn fp_disabled_traps_illegal_instruction() {
        let mut hart = Hart::new(0x8000_0000, 0);
        let mut bus = Bus::new();
        // fadd.s f0, f0, f0
        bus.ram.write(0x8000_0000, Width::Word, 0x00000053).unwrap();
        execute_one(&mut hart, &mut bus);
        assert_eq!(hart.csrs.mcause, Exception::IllegalInstruction.code());
    }

    #[test]
    fn fp_add_computes_when_enabled() {
        let mut hart = Hart::new(0x8000_0000, 0);
        enable_fp(&mut hart);
        hart.f[1] = 1.5;
        hart.f[2] = 2.5;
        let mut bus = Bus::new();
        let instr = Instr::FOp2 { op: FpOp::Add, rd: FRegister::from(3), rs1: FRegister::from(1), rs2: FRegister::from(2), rm: 0 };
        execute(&mut hart, &mut bus, instr).unwrap();
        assert_eq!(hart.f[3], 4.0);
    }
}
