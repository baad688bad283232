//! Guest-physical address space: routes loads/stores/fetches to RAM or a
//! device by address range.
//!
//! The bus is the mediator this core calls for: it owns every device and
//! RAM, and is the only thing that ever touches more than one of them at
//! once (e.g. handing the VirtIO block device a view of RAM while it
//! processes a virtqueue). Devices never hold a reference back to the bus.

use std::fs::File;

use crate::device::clint::Clint;
use crate::device::plic::{self, Plic};
use crate::device::power::Power;
use crate::device::tester::{self, TestDevice};
use crate::device::uart::Uart;
use crate::device::virtio_blk::{GuestMemory, VirtioBlk};
use crate::device::{MmioDevice, Width};
use crate::ram::Ram;
use crate::trap::Exception;
use crate::EmulatorError;

pub const POWER_BASE: u64 = 0x0010_0000;
const POWER_SIZE: u64 = 0x1000;
pub const TEST_DEVICE_BASE: u64 = 0x0010_1000;
const TEST_DEVICE_SIZE: u64 = 0x1000;
pub const CLINT_BASE: u64 = 0x0200_0000;
const CLINT_SIZE: u64 = 0x1_0000;
pub const PLIC_BASE: u64 = 0x0C00_0000;
const PLIC_SIZE: u64 = 0x0400_0000;
pub const UART_BASE: u64 = 0x1000_0000;
const UART_SIZE: u64 = 0x08;
pub const VIRTIO_BASE: u64 = 0x1000_1000;
const VIRTIO_SIZE: u64 = 0x1000;
pub const RAM_BASE: u64 = 0x8000_0000;
pub const RAM_SIZE: u64 = 0x0800_0000;

/// PLIC source id the UART's RX-ready line is wired to.
pub const UART_IRQ: u32 = 10;
/// PLIC source id the VirtIO block device's used-buffer line is wired to.
pub const VIRTIO_IRQ: u32 = 1;

/// `&mut Ram` implements the narrow memory capability the block device is
/// handed while processing a virtqueue.
impl GuestMemory for Ram {
    fn read_bytes(&self, gpa: u64, len: usize) -> Result<Vec<u8>, Exception> {
        Ram::read_bytes(self, gpa, len).map(|s| s.to_vec())
    }

    fn write_bytes(&mut self, gpa: u64, data: &[u8]) -> Result<(), Exception> {
        Ram::write_bytes(self, gpa, data)
    }
}

pub struct Bus {
    pub ram: Ram,
    pub uart: Uart,
    pub power: Power,
    pub clint: Clint,
    pub plic: Plic,
    pub test_device: TestDevice,
    pub virtio: Option<VirtioBlk>,
}

impl Bus {
    pub fn new() -> Self {
        Bus {
            ram: Ram::new(RAM_BASE, RAM_SIZE),
            uart: Uart::new(),
            power: Power::new(),
            clint: Clint::new(),
            plic: Plic::new(),
            test_device: TestDevice::new(),
            virtio: None,
        }
    }

    pub fn attach_virtio_block(&mut self, backing: File) -> Result<(), EmulatorError> {
        self.virtio = Some(VirtioBlk::new(backing)?);
        Ok(())
    }

    /// Copy an ELF `PT_LOAD` segment into RAM.
    pub fn load_segment(&mut self, gpa: u64, data: &[u8]) -> Result<(), EmulatorError> {
        self.ram
            .load_segment(gpa, data)
            .map_err(|_| EmulatorError::MalformedImage(format!("segment at {:#x} out of RAM", gpa)))
    }

    fn mmio_aligned(gpa: u64, width: Width) -> Result<(), Exception> {
        if gpa % width.bytes() != 0 {
            return Err(Exception::LoadAddressMisaligned);
        }
        Ok(())
    }

    pub fn read(&mut self, gpa: u64, width: Width) -> Result<u64, Exception> {
        if self.ram.contains(gpa) {
            return self.ram.read(gpa, width);
        }
        if in_range(gpa, POWER_BASE, POWER_SIZE) {
            Self::mmio_aligned(gpa, width)?;
            return Ok(self.power.read(gpa - POWER_BASE, width));
        }
        if in_range(gpa, TEST_DEVICE_BASE, TEST_DEVICE_SIZE) {
            Self::mmio_aligned(gpa, width)?;
            return Ok(self.test_device.read(gpa - TEST_DEVICE_BASE, width));
        }
        if in_range(gpa, CLINT_BASE, CLINT_SIZE) {
            Self::mmio_aligned(gpa, width)?;
            return Ok(self.clint.read(gpa - CLINT_BASE, width));
        }
        if in_range(gpa, PLIC_BASE, PLIC_SIZE) {
            Self::mmio_aligned(gpa, width)?;
            return Ok(self.plic.read(gpa - PLIC_BASE, width));
        }
        if in_range(gpa, UART_BASE, UART_SIZE) {
            Self::mmio_aligned(gpa, width)?;
            return Ok(self.uart.read(gpa - UART_BASE, width));
        }
        if in_range(gpa, VIRTIO_BASE, VIRTIO_SIZE) {
            Self::mmio_aligned(gpa, width)?;
            return Ok(match &mut self.virtio {
                Some(dev) => dev.read(gpa - VIRTIO_BASE, width),
                None => 0,
            });
        }
        Err(Exception::LoadAccessFault)
    }

    pub fn write(&mut self, gpa: u64, width: Width, value: u64) -> Result<(), Exception> {
        if self.ram.contains(gpa) {
            return self.ram.write(gpa, width, value);
        }
        if in_range(gpa, POWER_BASE, POWER_SIZE) {
            Self::mmio_aligned(gpa, width).map_err(|_| Exception::StoreAddressMisaligned)?;
            self.power.write(gpa - POWER_BASE, width, value);
            return Ok(());
        }
        if in_range(gpa, TEST_DEVICE_BASE, TEST_DEVICE_SIZE) {
            Self::mmio_aligned(gpa, width).map_err(|_| Exception::StoreAddressMisaligned)?;
            self.test_device.write(gpa - TEST_DEVICE_BASE, width, value);
            if self.test_device.take_trigger() {
                self.plic.assert(tester::IRQ_ID);
            }
            return Ok(());
        }
        if in_range(gpa, CLINT_BASE, CLINT_SIZE) {
            Self::mmio_aligned(gpa, width).map_err(|_| Exception::StoreAddressMisaligned)?;
            self.clint.write(gpa - CLINT_BASE, width, value);
            return Ok(());
        }
        if in_range(gpa, PLIC_BASE, PLIC_SIZE) {
            Self::mmio_aligned(gpa, width).map_err(|_| Exception::StoreAddressMisaligned)?;
            self.plic.write(gpa - PLIC_BASE, width, value);
            return Ok(());
        }
        if in_range(gpa, UART_BASE, UART_SIZE) {
            Self::mmio_aligned(gpa, width).map_err(|_| Exception::StoreAddressMisaligned)?;
            self.uart.write(gpa - UART_BASE, width, value);
            return Ok(());
        }
        if in_range(gpa, VIRTIO_BASE, VIRTIO_SIZE) {
            Self::mmio_aligned(gpa, width).map_err(|_| Exception::StoreAddressMisaligned)?;
            if let Some(dev) = &mut self.virtio {
                dev.write(gpa - VIRTIO_BASE, width, value, &mut self.ram);
            }
            return Ok(());
        }
        Err(Exception::StoreAccessFault)
    }

    /// Fetch one 32-bit instruction word. Alignment fault if `pc % 4 != 0`.
    pub fn fetch(&mut self, pc: u64) -> Result<u32, Exception> {
        if pc % 4 != 0 {
            return Err(Exception::InstructionAddressMisaligned);
        }
        if self.ram.contains(pc) {
            return self
                .ram
                .read(pc, Width::Word)
                .map(|v| v as u32)
                .map_err(|_| Exception::InstructionAccessFault);
        }
        Err(Exception::InstructionAccessFault)
    }

    /// Advance CLINT by `delta` and aggregate every device interrupt line
    /// into the hart's `mip`.
    pub fn tick_and_sample_interrupts(&mut self, delta: u64) -> InterruptLines {
        self.clint.tick(delta);

        self.plic.assert_if(UART_IRQ, self.uart.irq_pending());
        if let Some(virtio) = &self.virtio {
            self.plic.assert_if(VIRTIO_IRQ, virtio.irq_pending());
        }

        InterruptLines {
            mti: self.clint.mti_pending(),
            msi: self.clint.msi_pending(),
            mei: self.plic.interrupt_pending(plic::CONTEXT_M),
            sei: self.plic.interrupt_pending(plic::CONTEXT_S),
        }
    }

    pub fn halt_requested(&self) -> bool {
        self.power.halt_requested()
    }

    /// Drain the most recent VirtIO driver protocol violation, if any, so
    /// the host can log it instead of the queue wedging silently.
    pub fn take_virtio_protocol_violation(&mut self) -> Option<EmulatorError> {
        self.virtio.as_mut()?.take_protocol_violation()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Device-driven interrupt lines sampled once per core-loop tick.
pub struct InterruptLines {
    pub mti: bool,
    pub msi: bool,
    pub mei: bool,
    pub sei: bool,
}

fn in_range(addr: u64, base: u64, size: u64) -> bool {
    addr >= base && addr < base + size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_address_faults() {
        let mut bus = Bus::new();
        let err = bus.read(0x2000_0000, Width::Word).unwrap_err();
        assert_eq!(err, Exception::LoadAccessFault);
    }

    #[test]
    fn fetch_past_ram_end_reports_instruction_access_fault() {
        let mut bus = Bus::new();
        // A RAM region whose size isn't a multiple of 4, so a 4-aligned PC
        // within it can still read past the end: `ram.read` itself would
        // fault with `LoadAccessFault`, but a fetch must report
        // `InstructionAccessFault` instead.
        bus.ram = Ram::new(RAM_BASE, 0x1002);
        let err = bus.fetch(RAM_BASE + 0x1000).unwrap_err();
        assert_eq!(err, Exception::InstructionAccessFault);
    }

    #[test]
    fn misaligned_mmio_access_faults() {
        let mut bus = Bus::new();
        let err = bus.read(UART_BASE + 1, Width::Half).unwrap_err();
        assert_eq!(err, Exception::LoadAddressMisaligned);
    }

    #[test]
    fn power_magic_sets_halt() {
        let mut bus = Bus::new();
        bus.write(POWER_BASE, Width::Word, 0x5555).unwrap();
        assert!(bus.halt_requested());
    }

    #[test]
    fn test_device_trigger_asserts_plic_source() {
        let mut bus = Bus::new();
        bus.write(TEST_DEVICE_BASE + 4, Width::Word, 1).unwrap();
        let lines = bus.tick_and_sample_interrupts(0);
        // Source 63 has zero priority by default, so it never clears the
        // threshold; this only checks the write path doesn't fault.
        let _ = lines;
    }
}
