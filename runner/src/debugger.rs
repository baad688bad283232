//! Interactive single-step debugger, entered with `-g`.
//!
//! A minimal gdb-like line interface: `step`/`s`, `continue`/`c`, `regs`,
//! `csr <name>`, `break <addr>`, `quit`/`q`. Unknown input is echoed back
//! with a usage hint rather than treated as an error.

use std::io::{self, Write};

use virt64_engine::{decoder, trap};

use crate::disasm;
use crate::emulator::Emulator;

/// Why the debugger session ended.
pub enum DebuggerExit {
    /// The guest halted (power-off write observed).
    Halted,
    /// The user typed `quit`.
    Quit,
}

pub fn run(emu: &mut Emulator) -> DebuggerExit {
    let mut breakpoints: Vec<u64> = Vec::new();
    println!("virt64 debugger: step, continue, regs, csr <name>, break <addr>, quit");

    loop {
        print_next_instruction(emu);
        print!("(virt64-dbg) ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        if io::stdin().read_line(&mut line).unwrap_or(0) == 0 {
            return DebuggerExit::Quit;
        }
        let mut words = line.split_whitespace();
        match words.next() {
            Some("step") | Some("s") => {
                if emu.step() {
                    println!("guest halted");
                    return DebuggerExit::Halted;
                }
            }
            Some("continue") | Some("c") => {
                loop {
                    if emu.step() {
                        println!("guest halted");
                        return DebuggerExit::Halted;
                    }
                    if breakpoints.contains(&emu.hart.pc) {
                        println!("breakpoint hit at {:#x}", emu.hart.pc);
                        break;
                    }
                }
            }
            Some("regs") => print_regs(emu),
            Some("csr") => match words.next() {
                Some(name) => print_csr(emu, name),
                None => println!("usage: csr <name>"),
            },
            Some("break") => match words.next().and_then(|w| parse_addr(w)) {
                Some(addr) => {
                    breakpoints.push(addr);
                    println!("breakpoint set at {:#x}", addr);
                }
                None => println!("usage: break <addr>"),
            },
            Some("quit") | Some("q") => return DebuggerExit::Quit,
            Some(other) => println!("unrecognized command '{}'", other),
            None => {}
        }
    }
}

fn parse_addr(text: &str) -> Option<u64> {
    let text = text.trim_start_matches("0x");
    u64::from_str_radix(text, 16).ok()
}

fn print_next_instruction(emu: &mut Emulator) {
    match emu.bus.fetch(emu.hart.pc) {
        Ok(word) => match decoder::decode(word) {
            Ok(instr) => println!("{:#010x}: {}", emu.hart.pc, disasm::format(instr)),
            Err(_) => println!("{:#010x}: <illegal: {:#010x}>", emu.hart.pc, word),
        },
        Err(_) => println!("{:#010x}: <unmapped fetch>", emu.hart.pc),
    }
}

fn print_regs(emu: &Emulator) {
    for i in 0..32 {
        print!("x{:<2} {:#018x}  ", i, emu.hart.x[i]);
        if i % 4 == 3 {
            println!();
        }
    }
    println!("pc  {:#018x}  privilege {:?}", emu.hart.pc, emu.hart.privilege);
}

fn print_csr(emu: &Emulator, name: &str) {
    let value = match name.to_ascii_lowercase().as_str() {
        "mstatus" => emu.hart.csrs.mstatus,
        "mie" => emu.hart.csrs.mie,
        "mip" => emu.hart.csrs.mip,
        "mtvec" => emu.hart.csrs.mtvec,
        "mepc" => emu.hart.csrs.mepc,
        "mcause" => emu.hart.csrs.mcause,
        "mtval" => emu.hart.csrs.mtval,
        "mscratch" => emu.hart.csrs.mscratch,
        other => {
            println!("unknown csr '{}'", other);
            return;
        }
    };
    if name.eq_ignore_ascii_case("mcause") {
        println!("{} = {:#018x}  ({})", name, value, trap::describe_cause(value));
    } else {
        println!("{} = {:#018x}", name, value);
    }
}
