mod cli;
mod config;
mod debugger;
mod disasm;
mod elf;
mod emulator;
mod logger;

use std::process::ExitCode;

use clap::Parser;

use cli::Args;
use emulator::Emulator;

fn main() -> ExitCode {
    let args = Args::parse();
    let config = config::read_config(args.config.as_deref());

    let level = logger::parse_level(args.loglevel.as_deref().or(config.log.level.as_deref()));
    logger::RunnerLogger::init(level).expect("failed to install logger");

    let mut emu = match Emulator::build(&args, &config) {
        Ok(emu) => emu,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::from(2);
        }
    };

    if args.debug {
        match debugger::run(&mut emu) {
            debugger::DebuggerExit::Halted => ExitCode::SUCCESS,
            debugger::DebuggerExit::Quit => ExitCode::from(1),
        }
    } else {
        emu.run();
        ExitCode::SUCCESS
    }
}
