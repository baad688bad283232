//! Wires a [`Hart`] and [`Bus`] together, loads an image, and pumps UART
//! traffic to and from the host terminal.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use virt64_engine::bus::Bus;
use virt64_engine::Hart;

use crate::cli::Args;
use crate::config::Config;
use crate::elf::{self, LoadError};

pub struct Emulator {
    pub hart: Hart,
    pub bus: Bus,
    stdin: Receiver<u8>,
    max_instructions: Option<u64>,
}

impl Emulator {
    pub fn build(args: &Args, config: &Config) -> Result<Self, LoadError> {
        let mut bus = Bus::new();
        let entry = elf::load(&args.image, &mut bus)?;

        if let Some(spec) = args.virtio_block().map_err(LoadError::BadDeviceSpec)? {
            let backing = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&spec.path)
                .map_err(|e| LoadError::Io(spec.path.clone(), e))?;
            bus.attach_virtio_block(backing)?;
        }

        let hart = Hart::new(entry, 0);
        Ok(Emulator {
            hart,
            bus,
            stdin: spawn_stdin_reader(),
            max_instructions: config.debug.max_instructions,
        })
    }

    /// Run one core-loop iteration, pumping UART input/output around it.
    ///
    /// Returns `true` once the power controller has requested a halt.
    pub fn step(&mut self) -> bool {
        self.pump_uart_input();
        let halted = self.hart.tick(&mut self.bus);
        self.drain_uart_output();
        if let Some(violation) = self.bus.take_virtio_protocol_violation() {
            log::warn!("{}", violation);
        }
        halted
    }

    /// Run to completion (power-off), or until `max_instructions` retired
    /// instructions have run, whichever comes first.
    pub fn run(&mut self) {
        loop {
            if self.step() {
                return;
            }
            if let Some(limit) = self.max_instructions {
                if self.hart.retired >= limit {
                    log::warn!("stopping after {} retired instructions (debug.max_instructions)", limit);
                    return;
                }
            }
        }
    }

    fn pump_uart_input(&mut self) {
        loop {
            match self.stdin.try_recv() {
                Ok(byte) => self.bus.uart.push_input(byte),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn drain_uart_output(&mut self) {
        let out = self.bus.uart.drain_output();
        if !out.is_empty() {
            let mut stdout = io::stdout();
            let _ = stdout.write_all(&out);
            let _ = stdout.flush();
        }
    }
}

/// Spawn a background thread forwarding host stdin bytes so the core loop
/// never blocks waiting on the terminal.
fn spawn_stdin_reader() -> Receiver<u8> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut byte = [0u8; 1];
        let mut stdin = io::stdin();
        while let Ok(1) = stdin.read(&mut byte) {
            if tx.send(byte[0]).is_err() {
                break;
            }
        }
    });
    rx
}
