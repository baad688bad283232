//! VirtIO-MMIO block device, device-side split-virtqueue processing
//!.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::device::Width;
use crate::error::EmulatorError;
use crate::trap::Exception;

pub const MAGIC_VALUE: u32 = 0x7472_6976;
pub const VERSION: u32 = 2;
pub const DEVICE_ID: u32 = 2;
pub const VENDOR_ID: u32 = 0x5256_4153;

const REG_MAGIC: u64 = 0x000;
const REG_VERSION: u64 = 0x004;
const REG_DEVICE_ID: u64 = 0x008;
const REG_VENDOR_ID: u64 = 0x00c;
const REG_DEVICE_FEATURES: u64 = 0x010;
const REG_DEVICE_FEATURES_SEL: u64 = 0x014;
const REG_DRIVER_FEATURES: u64 = 0x020;
const REG_DRIVER_FEATURES_SEL: u64 = 0x024;
const REG_QUEUE_SEL: u64 = 0x030;
const REG_QUEUE_NUM_MAX: u64 = 0x034;
const REG_QUEUE_NUM: u64 = 0x038;
const REG_QUEUE_READY: u64 = 0x044;
const REG_QUEUE_NOTIFY: u64 = 0x050;
const REG_INTERRUPT_STATUS: u64 = 0x060;
const REG_INTERRUPT_ACK: u64 = 0x064;
const REG_STATUS: u64 = 0x070;
const REG_QUEUE_DESC_LOW: u64 = 0x080;
const REG_QUEUE_DESC_HIGH: u64 = 0x084;
const REG_QUEUE_DRIVER_LOW: u64 = 0x090;
const REG_QUEUE_DRIVER_HIGH: u64 = 0x094;
const REG_QUEUE_DEVICE_LOW: u64 = 0x0a0;
const REG_QUEUE_DEVICE_HIGH: u64 = 0x0a4;
const REG_CONFIG_GENERATION: u64 = 0x0fc;
const REG_CONFIG: u64 = 0x100;

const QUEUE_NUM_MAX: u32 = 256;

/// `VIRTIO_F_VERSION_1`, bit 32 of the 64-bit feature space (bit 0 with
/// `DeviceFeaturesSel == 1`); the only feature this device advertises.
const FEATURE_VERSION_1_BIT: u32 = 1 << 0;

pub mod status {
    pub const ACKNOWLEDGE: u32 = 1;
    pub const DRIVER: u32 = 2;
    pub const DRIVER_OK: u32 = 4;
    pub const FEATURES_OK: u32 = 8;
    pub const DEVICE_NEEDS_RESET: u32 = 64;
    pub const FAILED: u32 = 128;
}

pub mod req_type {
    pub const IN: u32 = 0;
    pub const OUT: u32 = 1;
    pub const FLUSH: u32 = 4;
    pub const GET_ID: u32 = 8;
}

mod block_status {
    pub const OK: u8 = 0;
    pub const IOERR: u8 = 1;
    pub const UNSUPP: u8 = 2;
}

const DESC_NEXT: u16 = 1;
const DESC_WRITE: u16 = 2;
const DESC_INDIRECT: u16 = 4;

/// Set by the driver in the avail ring's `flags` field (offset 0) to ask the
/// device to hold off on interrupting it after processing a request.
const AVAIL_F_NO_INTERRUPT: u16 = 1;

const SECTOR_SIZE: u64 = 512;

/// Narrow capability the block device uses to touch guest memory, handed in
/// by whoever drives the device (the bus) rather than stored as a
/// back-pointer.
pub trait GuestMemory {
    fn read_bytes(&self, gpa: u64, len: usize) -> Result<Vec<u8>, Exception>;
    fn write_bytes(&mut self, gpa: u64, data: &[u8]) -> Result<(), Exception>;
    fn read_u16(&self, gpa: u64) -> Result<u16, Exception> {
        Ok(u16::from_le_bytes(
            self.read_bytes(gpa, 2)?.try_into().unwrap(),
        ))
    }
    fn read_u32(&self, gpa: u64) -> Result<u32, Exception> {
        Ok(u32::from_le_bytes(
            self.read_bytes(gpa, 4)?.try_into().unwrap(),
        ))
    }
    fn read_u64(&self, gpa: u64) -> Result<u64, Exception> {
        Ok(u64::from_le_bytes(
            self.read_bytes(gpa, 8)?.try_into().unwrap(),
        ))
    }
    fn write_u16(&mut self, gpa: u64, value: u16) -> Result<(), Exception> {
        self.write_bytes(gpa, &value.to_le_bytes())
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Descriptor {
    paddr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

/// Per-queue device-side state.
#[derive(Default)]
struct VirtQueue {
    desc_gpa: u64,
    avail_gpa: u64,
    used_gpa: u64,
    num: u32,
    ready: bool,
    last_avail_idx: u16,
    failed: bool,
}

pub struct VirtioBlk {
    backing: File,
    capacity_sectors: u64,

    status: u32,
    device_features_sel: u32,
    driver_features: [u32; 2],
    driver_features_sel: u32,
    queue_sel: u32,
    queue: VirtQueue,
    interrupt_status: u32,
    irq_pending: bool,
    protocol_violation: Option<EmulatorError>,
}

impl VirtioBlk {
    pub fn new(mut backing: File) -> std::io::Result<Self> {
        let len = backing.seek(SeekFrom::End(0))?;
        backing.seek(SeekFrom::Start(0))?;
        Ok(VirtioBlk {
            backing,
            capacity_sectors: len / SECTOR_SIZE,
            status: 0,
            device_features_sel: 0,
            driver_features: [0; 2],
            driver_features_sel: 0,
            queue_sel: 0,
            queue: VirtQueue::default(),
            interrupt_status: 0,
            irq_pending: false,
            protocol_violation: None,
        })
    }

    /// Interrupt line into the PLIC: high while an unacknowledged used-buffer
    /// notification is pending.
    pub fn irq_pending(&self) -> bool {
        self.irq_pending
    }

    /// Take the most recent protocol violation raised by the driver, if any.
    /// Returns `None` once drained; the bus surfaces this to the host as a
    /// warning rather than letting it silently wedge the queue.
    pub fn take_protocol_violation(&mut self) -> Option<EmulatorError> {
        self.protocol_violation.take()
    }

    fn reset(&mut self) {
        self.status = 0;
        self.driver_features = [0; 2];
        self.queue = VirtQueue::default();
        self.interrupt_status = 0;
        self.irq_pending = false;
        self.protocol_violation = None;
    }

    fn device_features(&self) -> u32 {
        match self.device_features_sel {
            1 => FEATURE_VERSION_1_BIT,
            _ => 0,
        }
    }

    /// Enforce the status register's monotonic transition chain.
    fn write_status(&mut self, value: u32) {
        if value == 0 {
            self.reset();
            return;
        }
        if self.status & status::FAILED != 0 {
            return;
        }
        // Each stage may only add bits on top of an allowed predecessor set.
        let allowed_additions = match self.status {
            0 => status::ACKNOWLEDGE,
            s if s == status::ACKNOWLEDGE => status::DRIVER,
            s if s == status::ACKNOWLEDGE | status::DRIVER => status::FEATURES_OK,
            s if s == status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK => {
                status::DRIVER_OK
            }
            s => s, // already fully negotiated; allow re-writes of the same bits
        };
        let added = value & !self.status;
        if added & !allowed_additions != 0 {
            self.status |= status::FAILED;
            self.protocol_violation = Some(EmulatorError::VirtioProtocolViolation(
                self.queue_sel as u16,
                "illegal status register transition",
            ));
            return;
        }
        self.status = value;
    }

    pub fn read(&mut self, offset: u64, _width: Width) -> u64 {
        match offset {
            REG_MAGIC => MAGIC_VALUE as u64,
            REG_VERSION => VERSION as u64,
            REG_DEVICE_ID => DEVICE_ID as u64,
            REG_VENDOR_ID => VENDOR_ID as u64,
            REG_DEVICE_FEATURES => self.device_features() as u64,
            REG_QUEUE_NUM_MAX => QUEUE_NUM_MAX as u64,
            REG_QUEUE_READY => self.queue.ready as u64,
            REG_INTERRUPT_STATUS => self.interrupt_status as u64,
            REG_STATUS => self.status as u64,
            REG_CONFIG_GENERATION => 0,
            REG_CONFIG => self.capacity_sectors & 0xffff_ffff,
            o if o == REG_CONFIG + 4 => self.capacity_sectors >> 32,
            _ => 0,
        }
    }

    /// Write an MMIO register. `mem` grants the narrow memory capability
    /// needed only while processing a `QueueNotify`.
    pub fn write(&mut self, offset: u64, _width: Width, value: u64, mem: &mut dyn GuestMemory) {
        let value = value as u32;
        match offset {
            REG_DEVICE_FEATURES_SEL => self.device_features_sel = value,
            REG_DRIVER_FEATURES => {
                let sel = (self.driver_features_sel & 1) as usize;
                // Driver-written features are accepted as a no-op.
                self.driver_features[sel] = value;
            }
            REG_DRIVER_FEATURES_SEL => self.driver_features_sel = value,
            REG_QUEUE_SEL => self.queue_sel = value,
            REG_QUEUE_NUM => {
                if self.queue_sel == 0 {
                    self.queue.num = value;
                }
            }
            REG_QUEUE_READY => {
                if self.queue_sel == 0 {
                    self.queue.ready = value & 1 != 0;
                }
            }
            REG_QUEUE_NOTIFY => {
                if value == 0 && self.queue.ready && !self.queue.failed {
                    self.process_queue(mem);
                }
            }
            REG_INTERRUPT_ACK => {
                self.interrupt_status &= !value;
                if self.interrupt_status == 0 {
                    self.irq_pending = false;
                }
            }
            REG_STATUS => self.write_status(value),
            REG_QUEUE_DESC_LOW => {
                self.queue.desc_gpa = (self.queue.desc_gpa & !0xffff_ffff) | value as u64
            }
            REG_QUEUE_DESC_HIGH => {
                self.queue.desc_gpa = (self.queue.desc_gpa & 0xffff_ffff) | ((value as u64) << 32)
            }
            REG_QUEUE_DRIVER_LOW => {
                self.queue.avail_gpa = (self.queue.avail_gpa & !0xffff_ffff) | value as u64
            }
            REG_QUEUE_DRIVER_HIGH => {
                self.queue.avail_gpa =
                    (self.queue.avail_gpa & 0xffff_ffff) | ((value as u64) << 32)
            }
            REG_QUEUE_DEVICE_LOW => {
                self.queue.used_gpa = (self.queue.used_gpa & !0xffff_ffff) | value as u64
            }
            REG_QUEUE_DEVICE_HIGH => {
                self.queue.used_gpa = (self.queue.used_gpa & 0xffff_ffff) | ((value as u64) << 32)
            }
            _ => {}
        }
    }

    fn read_descriptor(mem: &dyn GuestMemory, table_gpa: u64, index: u16) -> Result<Descriptor, Exception> {
        let base = table_gpa + 16 * index as u64;
        Ok(Descriptor {
            paddr: mem.read_u64(base)?,
            len: mem.read_u32(base + 8)?,
            flags: mem.read_u16(base + 12)?,
            next: mem.read_u16(base + 14)?,
        })
    }

    /// Walk a descriptor chain starting at `head`, following `NEXT` and
    /// substituting `INDIRECT` tables, bounded by `num` links to forbid cycles.
    fn walk_chain(
        mem: &dyn GuestMemory,
        desc_gpa: u64,
        num: u32,
        head: u16,
    ) -> Result<Vec<Descriptor>, &'static str> {
        let mut chain = Vec::new();
        let table = desc_gpa;
        let mut idx = head;
        loop {
            if chain.len() as u32 >= num.max(1) {
                return Err("descriptor chain exceeds queue bound (cycle?)");
            }
            let desc = Self::read_descriptor(mem, table, idx).map_err(|_| "descriptor out of range")?;
            if desc.flags & DESC_INDIRECT != 0 {
                // The referenced table replaces the remainder of the chain.
                let indirect_count = desc.len as usize / 16;
                let mut indirect_idx = 0u16;
                for _ in 0..indirect_count {
                    let d = Self::read_descriptor(mem, desc.paddr, indirect_idx)
                        .map_err(|_| "indirect descriptor out of range")?;
                    let has_next = d.flags & DESC_NEXT != 0;
                    let next = d.next;
                    chain.push(d);
                    if !has_next {
                        break;
                    }
                    indirect_idx = next;
                }
                return Ok(chain);
            }
            let has_next = desc.flags & DESC_NEXT != 0;
            let next = desc.next;
            chain.push(desc);
            if !has_next {
                break;
            }
            idx = next;
        }
        Ok(chain)
    }

    /// Drain newly-published avail entries.
    fn process_queue(&mut self, mem: &mut dyn GuestMemory) {
        let avail_idx = match mem.read_u16(self.queue.avail_gpa + 2) {
            Ok(v) => v,
            Err(_) => {
                self.queue.failed = true;
                self.protocol_violation = Some(EmulatorError::VirtioProtocolViolation(
                    self.queue_sel as u16,
                    "avail ring index out of bounds",
                ));
                return;
            }
        };

        while self.queue.last_avail_idx != avail_idx {
            let slot = (self.queue.last_avail_idx as u32 % self.queue.num.max(1)) as u16;
            let head = match mem.read_u16(self.queue.avail_gpa + 4 + 2 * slot as u64) {
                Ok(v) => v,
                Err(_) => {
                    self.queue.failed = true;
                    self.protocol_violation = Some(EmulatorError::VirtioProtocolViolation(
                        self.queue_sel as u16,
                        "avail ring entry out of bounds",
                    ));
                    return;
                }
            };

            let chain = match Self::walk_chain(mem, self.queue.desc_gpa, self.queue.num, head) {
                Ok(c) => c,
                Err(reason) => {
                    self.queue.failed = true;
                    self.protocol_violation =
                        Some(EmulatorError::VirtioProtocolViolation(self.queue_sel as u16, reason));
                    return;
                }
            };

            let bytes_written = self.service_request(mem, &chain);
            self.publish_used(mem, head, bytes_written);
            self.queue.last_avail_idx = self.queue.last_avail_idx.wrapping_add(1);
        }

        // Per the split-virtqueue interrupt suppression convention, the
        // driver asks to be left alone by setting this bit in avail.flags.
        let suppress = mem.read_u16(self.queue.avail_gpa).unwrap_or(0) & AVAIL_F_NO_INTERRUPT != 0;
        if !suppress {
            self.interrupt_status |= 0b1;
            self.irq_pending = true;
        }
    }

    /// Execute one request chain: header, data descriptors, status byte.
    /// Returns the byte count to report in the used ring.
    fn service_request(&mut self, mem: &mut dyn GuestMemory, chain: &[Descriptor]) -> u32 {
        if chain.len() < 2 {
            return 0;
        }
        let header = chain[0];
        let status_desc = chain[chain.len() - 1];
        let data = &chain[1..chain.len() - 1];

        let req_type = match mem.read_u32(header.paddr) {
            Ok(v) => v,
            Err(_) => {
                let _ = mem.write_bytes(status_desc.paddr, &[block_status::IOERR]);
                return 1;
            }
        };
        let sector = match mem.read_u64(header.paddr + 8) {
            Ok(v) => v,
            Err(_) => {
                let _ = mem.write_bytes(status_desc.paddr, &[block_status::IOERR]);
                return 1;
            }
        };

        let total_len: u32 = data.iter().map(|d| d.len).sum();
        let mut written_back = 0u32;

        let status = match req_type {
            req_type::IN | req_type::OUT if total_len % SECTOR_SIZE as u32 != 0 => {
                block_status::UNSUPP
            }
            req_type::IN => self.do_transfer(mem, sector, data, true, &mut written_back),
            req_type::OUT => self.do_transfer(mem, sector, data, false, &mut written_back),
            req_type::FLUSH => {
                if self.backing.sync_all().is_ok() {
                    block_status::OK
                } else {
                    block_status::IOERR
                }
            }
            _ => block_status::UNSUPP,
        };

        let _ = mem.write_bytes(status_desc.paddr, &[status]);
        written_back + 1
    }

    fn do_transfer(
        &mut self,
        mem: &mut dyn GuestMemory,
        sector: u64,
        data: &[Descriptor],
        read_from_disk: bool,
        written_back: &mut u32,
    ) -> u8 {
        let mut file_offset = sector * SECTOR_SIZE;
        for desc in data {
            let len = desc.len as usize;
            if read_from_disk {
                // IN: data descriptors must be device-writable.
                if desc.flags & DESC_WRITE == 0 {
                    return block_status::UNSUPP;
                }
                let mut buf = vec![0u8; len];
                if self.backing.seek(SeekFrom::Start(file_offset)).is_err()
                    || self.backing.read_exact(&mut buf).is_err()
                {
                    return block_status::IOERR;
                }
                if mem.write_bytes(desc.paddr, &buf).is_err() {
                    return block_status::IOERR;
                }
                *written_back += len as u32;
            } else {
                let buf = match mem.read_bytes(desc.paddr, len) {
                    Ok(b) => b,
                    Err(_) => return block_status::IOERR,
                };
                if self.backing.seek(SeekFrom::Start(file_offset)).is_err()
                    || self.backing.write_all(&buf).is_err()
                {
                    return block_status::IOERR;
                }
            }
            file_offset += len as u64;
        }
        block_status::OK
    }

    fn publish_used(&mut self, mem: &mut dyn GuestMemory, id: u16, len: u32) {
        let used_idx = mem.read_u16(self.queue.used_gpa + 2).unwrap_or(0);
        let slot = (used_idx as u32 % self.queue.num.max(1)) as u64;
        let elem_gpa = self.queue.used_gpa + 4 + 8 * slot;
        let _ = mem.write_bytes(elem_gpa, &(id as u32).to_le_bytes());
        let _ = mem.write_bytes(elem_gpa + 4, &len.to_le_bytes());
        // The driver must observe the used element before the updated
        // index, so the index write happens strictly after it.
        let _ = mem.write_u16(self.queue.used_gpa + 2, used_idx.wrapping_add(1));
    }

    pub fn name(&self) -> &'static str {
        "virtio-mmio-block"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// A byte-addressable scratch memory used only by these unit tests, since
    /// exercising real guest RAM requires the full `Bus`/`Ram` wiring covered
    /// by integration tests instead.
    struct FakeMem(RefCell<HashMap<u64, u8>>);

    impl FakeMem {
        fn new() -> Self {
            FakeMem(RefCell::new(HashMap::new()))
        }
    }

    impl GuestMemory for FakeMem {
        fn read_bytes(&self, gpa: u64, len: usize) -> Result<Vec<u8>, Exception> {
            let map = self.0.borrow();
            Ok((0..len as u64)
                .map(|i| *map.get(&(gpa + i)).unwrap_or(&0))
                .collect())
        }

        fn write_bytes(&mut self, gpa: u64, data: &[u8]) -> Result<(), Exception> {
            let mut map = self.0.borrow_mut();
            for (i, b) in data.iter().enumerate() {
                map.insert(gpa + i as u64, *b);
            }
            Ok(())
        }
    }

    #[test]
    fn status_illegal_transition_sets_failed() {
        let tmp = tempfile_with_sectors(1);
        let mut dev = VirtioBlk::new(tmp).unwrap();
        dev.write_status(status::DRIVER_OK);
        assert_eq!(dev.status & status::FAILED, status::FAILED);
        assert!(matches!(
            dev.take_protocol_violation(),
            Some(EmulatorError::VirtioProtocolViolation(0, _))
        ));
        assert!(dev.take_protocol_violation().is_none());
    }

    #[test]
    fn status_chain_reaches_driver_ok() {
        let tmp = tempfile_with_sectors(1);
        let mut dev = VirtioBlk::new(tmp).unwrap();
        dev.write_status(status::ACKNOWLEDGE);
        dev.write_status(status::ACKNOWLEDGE | status::DRIVER);
        dev.write_status(status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK);
        dev.write_status(
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK,
        );
        assert_eq!(dev.status & status::FAILED, 0);
        assert!(dev.status & status::DRIVER_OK != 0);
    }

    #[test]
    fn write_zero_resets_device() {
        let tmp = tempfile_with_sectors(1);
        let mut dev = VirtioBlk::new(tmp).unwrap();
        dev.write_status(status::ACKNOWLEDGE);
        dev.write_status(0);
        assert_eq!(dev.status, 0);
    }

    #[test]
    fn round_trip_single_sector_through_virtqueue() {
        let tmp = tempfile_with_sectors(2);
        let mut dev = VirtioBlk::new(tmp).unwrap();
        let mut mem = FakeMem::new();

        let desc_gpa = 0x1000;
        let avail_gpa = 0x2000;
        let used_gpa = 0x3000;
        dev.queue.desc_gpa = desc_gpa;
        dev.queue.avail_gpa = avail_gpa;
        dev.queue.used_gpa = used_gpa;
        dev.queue.num = 8;
        dev.queue.ready = true;

        let pattern: Vec<u8> = (0..512u32).map(|i| (i & 0xff) as u8).collect();

        // Descriptor 0: header (read-only), desc 1: data (device-writable on
        // IN not needed here because we write OUT), desc 2: status.
        write_desc(&mut mem, desc_gpa, 0, 0x5000, 16, DESC_NEXT, 1);
        write_desc(&mut mem, desc_gpa, 1, 0x6000, 512, DESC_NEXT, 2);
        write_desc(&mut mem, desc_gpa, 2, 0x7000, 1, DESC_WRITE, 0);

        mem.write_bytes(0x5000, &req_type::OUT.to_le_bytes()).unwrap();
        mem.write_bytes(0x5004, &0u32.to_le_bytes()).unwrap();
        mem.write_bytes(0x5008, &0u64.to_le_bytes()).unwrap();
        mem.write_bytes(0x6000, &pattern).unwrap();

        mem.write_bytes(avail_gpa, &0u16.to_le_bytes()).unwrap(); // flags
        mem.write_bytes(avail_gpa + 2, &1u16.to_le_bytes()).unwrap(); // idx
        mem.write_bytes(avail_gpa + 4, &0u16.to_le_bytes()).unwrap(); // ring[0] = head 0

        dev.write(REG_QUEUE_NOTIFY, Width::Word, 0, &mut mem);

        let status_byte = mem.read_bytes(0x7000, 1).unwrap()[0];
        assert_eq!(status_byte, block_status::OK);
        let used_idx = mem.read_u16(used_gpa + 2).unwrap();
        assert_eq!(used_idx, 1);
        assert!(dev.irq_pending());

        // Now read it back via an IN request into a fresh buffer.
        write_desc(&mut mem, desc_gpa, 3, 0x5000, 16, DESC_NEXT, 4);
        write_desc(&mut mem, desc_gpa, 4, 0x8000, 512, DESC_NEXT | DESC_WRITE, 5);
        write_desc(&mut mem, desc_gpa, 5, 0x7001, 1, DESC_WRITE, 0);
        mem.write_bytes(0x5000, &req_type::IN.to_le_bytes()).unwrap();
        mem.write_bytes(avail_gpa + 2, &2u16.to_le_bytes()).unwrap();
        mem.write_bytes(avail_gpa + 6, &3u16.to_le_bytes()).unwrap();

        dev.write(REG_QUEUE_NOTIFY, Width::Word, 0, &mut mem);

        let readback = mem.read_bytes(0x8000, 512).unwrap();
        assert_eq!(readback, pattern);
    }

    #[test]
    fn avail_no_interrupt_flag_suppresses_irq() {
        let tmp = tempfile_with_sectors(1);
        let mut dev = VirtioBlk::new(tmp).unwrap();
        let mut mem = FakeMem::new();

        let desc_gpa = 0x1000;
        let avail_gpa = 0x2000;
        let used_gpa = 0x3000;
        dev.queue.desc_gpa = desc_gpa;
        dev.queue.avail_gpa = avail_gpa;
        dev.queue.used_gpa = used_gpa;
        dev.queue.num = 8;
        dev.queue.ready = true;

        write_desc(&mut mem, desc_gpa, 0, 0x5000, 16, DESC_NEXT, 1);
        write_desc(&mut mem, desc_gpa, 1, 0x6000, 512, DESC_NEXT, 2);
        write_desc(&mut mem, desc_gpa, 2, 0x7000, 1, DESC_WRITE, 0);

        mem.write_bytes(0x5000, &req_type::OUT.to_le_bytes()).unwrap();
        mem.write_bytes(0x5004, &0u32.to_le_bytes()).unwrap();
        mem.write_bytes(0x5008, &0u64.to_le_bytes()).unwrap();
        mem.write_bytes(0x6000, &vec![0u8; 512]).unwrap();

        mem.write_bytes(avail_gpa, &AVAIL_F_NO_INTERRUPT.to_le_bytes()).unwrap();
        mem.write_bytes(avail_gpa + 2, &1u16.to_le_bytes()).unwrap();
        mem.write_bytes(avail_gpa + 4, &0u16.to_le_bytes()).unwrap();

        dev.write(REG_QUEUE_NOTIFY, Width::Word, 0, &mut mem);

        let used_idx = mem.read_u16(used_gpa + 2).unwrap();
        assert_eq!(used_idx, 1, "the request still completes");
        assert!(!dev.irq_pending(), "driver asked not to be interrupted");
    }

    fn write_desc(
        mem: &mut FakeMem,
        table: u64,
        idx: u16,
        paddr: u64,
        len: u32,
        flags: u16,
        next: u16,
    ) {
        let base = table + 16 * idx as u64;
        mem.write_bytes(base, &paddr.to_le_bytes()).unwrap();
        mem.write_bytes(base + 8, &len.to_le_bytes()).unwrap();
        mem.write_bytes(base + 12, &flags.to_le_bytes()).unwrap();
        mem.write_bytes(base + 14, &next.to_le_bytes()).unwrap();
    }

    fn tempfile_with_sectors(n: u64) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&vec![0u8; (n * SECTOR_SIZE) as usize]).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }
}
