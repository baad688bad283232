//! Emulator-internal invariant violations: host-level failures like a
//! malformed image, a bad device backing file, or a guest driver that broke
//! a device's wire protocol. Guest-visible CPU faults are never represented
//! here: they travel in-band as [`crate::trap::Trap`] values delivered to
//! the guest.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("backing file I/O error: {0}")]
    BackingFile(#[from] std::io::Error),

    #[error("malformed ELF image: {0}")]
    MalformedImage(String),

    #[error("virtio queue {0} protocol violation: {1}")]
    VirtioProtocolViolation(u16, &'static str),
}
