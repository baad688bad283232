//! Platform-Level Interrupt Controller: priority, pending, per-context enable
//! and threshold, claim/complete.

use crate::device::{MmioDevice, Width};

/// Number of interrupt source ids the PLIC arbitrates, source 0 reserved.
const NUM_SOURCES: usize = 1024;
/// Number of PLIC contexts. Context 0 is hart0/M, context 1 is hart0/S;
/// a single hart needs no more.
const NUM_CONTEXTS: usize = 2;

const PRIORITY_BASE: u64 = 0x0;
const PRIORITY_END: u64 = 0x1000;
const PENDING_BASE: u64 = 0x1000;
const ENABLE_BASE: u64 = 0x2000;
const ENABLE_STRIDE: u64 = 0x80;
const ENABLE_END: u64 = 0x200000;
const CONTEXT_BASE: u64 = 0x200000;
const CONTEXT_STRIDE: u64 = 0x1000;
const CONTEXT_THRESHOLD: u64 = 0x0;
const CONTEXT_CLAIM: u64 = 0x4;

/// Machine-mode context index, the target of the UART and VirtIO IRQ wiring.
pub const CONTEXT_M: usize = 0;
pub const CONTEXT_S: usize = 1;

pub struct Plic {
    priority: [u32; NUM_SOURCES],
    pending: [bool; NUM_SOURCES],
    /// Per-context, per-source enable bits.
    enable: [[bool; NUM_SOURCES]; NUM_CONTEXTS],
    threshold: [u32; NUM_CONTEXTS],
}

impl Plic {
    pub fn new() -> Self {
        Plic {
            priority: [0; NUM_SOURCES],
            pending: [false; NUM_SOURCES],
            enable: [[false; NUM_SOURCES]; NUM_CONTEXTS],
            threshold: [0; NUM_CONTEXTS],
        }
    }

    /// Assert interrupt source `id`: sets its pending bit.
    pub fn assert(&mut self, id: u32) {
        if (id as usize) < NUM_SOURCES {
            self.pending[id as usize] = true;
        }
    }

    /// Assert `id` only while its owning device's line is currently high.
    /// There is no corresponding "deassert": once latched, a pending source
    /// is only cleared by a context's claim.
    pub fn assert_if(&mut self, id: u32, line_high: bool) {
        if line_high {
            self.assert(id);
        }
    }

    /// Highest-priority pending-and-enabled source for `ctx`, ties broken by lowest id.
    fn top_pending(&self, ctx: usize) -> Option<(u32, u32)> {
        let mut best: Option<(u32, u32)> = None;
        for id in 1..NUM_SOURCES {
            if !self.pending[id] || !self.enable[ctx][id] {
                continue;
            }
            let priority = self.priority[id];
            if priority <= self.threshold[ctx] {
                continue;
            }
            match best {
                Some((_, best_priority)) if priority <= best_priority => {}
                _ => best = Some((id as u32, priority)),
            }
        }
        best
    }

    /// External interrupt line for `ctx`: high iff the pending set is non-empty.
    pub fn interrupt_pending(&self, ctx: usize) -> bool {
        self.top_pending(ctx).is_some()
    }

    fn claim(&mut self, ctx: usize) -> u32 {
        match self.top_pending(ctx) {
            Some((id, _)) => {
                self.pending[id as usize] = false;
                id
            }
            None => 0,
        }
    }

    fn complete(&mut self, _ctx: usize, _id: u32) {
        // A completed source may be re-asserted on its next edge; nothing to
        // record beyond clearing `pending`, already done at claim time.
    }
}

impl Default for Plic {
    fn default() -> Self {
        Self::new()
    }
}

impl MmioDevice for Plic {
    fn read(&mut self, offset: u64, _width: Width) -> u64 {
        match offset {
            o if (PRIORITY_BASE..PRIORITY_END).contains(&o) => {
                let id = (o / 4) as usize;
                self.priority.get(id).copied().unwrap_or(0) as u64
            }
            o if (PENDING_BASE..ENABLE_BASE).contains(&o) => {
                let word = ((o - PENDING_BASE) / 4) as usize;
                let mut bits = 0u32;
                for bit in 0..32 {
                    let id = word * 32 + bit;
                    if id < NUM_SOURCES && self.pending[id] {
                        bits |= 1 << bit;
                    }
                }
                bits as u64
            }
            o if (ENABLE_BASE..ENABLE_END).contains(&o) => {
                let rel = o - ENABLE_BASE;
                let ctx = (rel / ENABLE_STRIDE) as usize;
                let word = ((rel % ENABLE_STRIDE) / 4) as usize;
                if ctx >= NUM_CONTEXTS {
                    return 0;
                }
                let mut bits = 0u32;
                for bit in 0..32 {
                    let id = word * 32 + bit;
                    if id < NUM_SOURCES && self.enable[ctx][id] {
                        bits |= 1 << bit;
                    }
                }
                bits as u64
            }
            o if o >= CONTEXT_BASE => {
                let rel = o - CONTEXT_BASE;
                let ctx = (rel / CONTEXT_STRIDE) as usize;
                let reg = rel % CONTEXT_STRIDE;
                if ctx >= NUM_CONTEXTS {
                    return 0;
                }
                match reg {
                    CONTEXT_THRESHOLD => self.threshold[ctx] as u64,
                    CONTEXT_CLAIM => self.claim(ctx) as u64,
                    _ => 0,
                }
            }
            _ => 0,
        }
    }

    fn write(&mut self, offset: u64, _width: Width, value: u64) {
        match offset {
            o if (PRIORITY_BASE..PRIORITY_END).contains(&o) => {
                let id = (o / 4) as usize;
                if id < NUM_SOURCES {
                    self.priority[id] = value as u32;
                }
            }
            o if (PENDING_BASE..ENABLE_BASE).contains(&o) => {
                // Pending bits are device-latched; software cannot set them directly.
            }
            o if (ENABLE_BASE..ENABLE_END).contains(&o) => {
                let rel = o - ENABLE_BASE;
                let ctx = (rel / ENABLE_STRIDE) as usize;
                let word = ((rel % ENABLE_STRIDE) / 4) as usize;
                if ctx >= NUM_CONTEXTS {
                    return;
                }
                for bit in 0..32 {
                    let id = word * 32 + bit;
                    if id < NUM_SOURCES {
                        self.enable[ctx][id] = value & (1 << bit) != 0;
                    }
                }
            }
            o if o >= CONTEXT_BASE => {
                let rel = o - CONTEXT_BASE;
                let ctx = (rel / CONTEXT_STRIDE) as usize;
                let reg = rel % CONTEXT_STRIDE;
                if ctx >= NUM_CONTEXTS {
                    return;
                }
                match reg {
                    CONTEXT_THRESHOLD => self.threshold[ctx] = value as u32,
                    CONTEXT_CLAIM => self.complete(ctx, value as u32),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn name(&self) -> &'static str {
        "plic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enable(plic: &mut Plic, ctx: usize, id: u32) {
        let word = (id / 32) as u64;
        let bits = plic.read(ENABLE_BASE + ctx as u64 * ENABLE_STRIDE + word * 4, Width::Word);
        plic.write(
            ENABLE_BASE + ctx as u64 * ENABLE_STRIDE + word * 4,
            Width::Word,
            bits | (1 << (id % 32)),
        );
    }

    #[test]
    fn claim_returns_highest_priority_lowest_id_on_tie() {
        let mut plic = Plic::new();
        plic.write(PRIORITY_BASE + 4 * 1, Width::Word, 5);
        plic.write(PRIORITY_BASE + 4 * 2, Width::Word, 5);
        enable(&mut plic, CONTEXT_M, 1);
        enable(&mut plic, CONTEXT_M, 2);
        plic.assert(1);
        plic.assert(2);
        let claimed = plic.read(CONTEXT_BASE + CONTEXT_CLAIM, Width::Word);
        assert_eq!(claimed, 1);
        let next = plic.read(CONTEXT_BASE + CONTEXT_CLAIM, Width::Word);
        assert_eq!(next, 2);
    }

    #[test]
    fn threshold_masks_low_priority_sources() {
        let mut plic = Plic::new();
        plic.write(PRIORITY_BASE + 4 * 5, Width::Word, 1);
        enable(&mut plic, CONTEXT_M, 5);
        plic.write(
            CONTEXT_BASE + CONTEXT_THRESHOLD,
            Width::Word,
            1,
        );
        plic.assert(5);
        assert!(!plic.interrupt_pending(CONTEXT_M));
    }

    #[test]
    fn disabled_source_never_asserts_line() {
        let mut plic = Plic::new();
        plic.write(PRIORITY_BASE + 4 * 7, Width::Word, 3);
        plic.assert(7);
        assert!(!plic.interrupt_pending(CONTEXT_M));
    }
}
