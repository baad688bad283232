//! ELF image loading.
//!
//! The board has no boot ROM and no firmware of its own: the runner loads
//! every `PT_LOAD` segment straight into guest RAM and starts the hart at
//! the image's entry point.

use std::fs;
use std::path::Path;

use object::read::Error as ObjectError;
use object::{Object, ObjectSegment};
use virt64_engine::bus::Bus;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {0}: {1}")]
    Io(std::path::PathBuf, std::io::Error),
    #[error("failed to parse ELF image: {0}")]
    Parse(#[from] ObjectError),
    #[error("loading segment into guest memory: {0}")]
    Engine(#[from] virt64_engine::EmulatorError),
    #[error("{0}")]
    BadDeviceSpec(String),
}

/// Load every loadable segment of `path` into `bus`'s RAM.
///
/// Returns the entry point PC the hart should reset to.
pub fn load(path: &Path, bus: &mut Bus) -> Result<u64, LoadError> {
    let bytes = fs::read(path).map_err(|e| LoadError::Io(path.to_owned(), e))?;
    let image = object::File::parse(&*bytes)?;
    let entry = image.entry();

    for segment in image.segments() {
        let data = segment.data()?;
        if data.is_empty() {
            continue;
        }
        bus.load_segment(segment.address(), data)?;
        // A segment's in-memory size can exceed its file size (.bss); RAM
        // starts zeroed, so there is nothing further to copy for the tail.
    }

    Ok(entry)
}
