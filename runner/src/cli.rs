//! Command line interface.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "virt64-runner", about = "Run a bare-metal RV64IMF+Zicsr image")]
pub struct Args {
    /// ELF image to load and execute.
    pub image: PathBuf,

    /// Attach a VirtIO block device backed by a file, e.g. `--device virtio-block:disk.img`.
    #[arg(long = "device", value_name = "virtio-block:PATH")]
    pub device: Option<String>,

    /// Start under the interactive single-step debugger instead of running to completion.
    #[arg(short = 'g', long = "debug", action)]
    pub debug: bool,

    /// Minimum log level to print (error, warn, info, debug, trace).
    #[arg(long = "loglevel")]
    pub loglevel: Option<String>,

    /// Path to an optional configuration file (defaults to `virt64.toml` in the
    /// current directory if present).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
}

/// A parsed `--device` argument.
#[derive(Debug)]
pub struct DeviceSpec {
    pub path: PathBuf,
}

impl Args {
    /// Parse `--device virtio-block:<path>`, the only device kind this core supports.
    pub fn virtio_block(&self) -> Result<Option<DeviceSpec>, String> {
        let Some(spec) = &self.device else {
            return Ok(None);
        };
        match spec.split_once(':') {
            Some(("virtio-block", path)) => Ok(Some(DeviceSpec { path: PathBuf::from(path) })),
            _ => Err(format!(
                "unrecognized --device spec '{}', expected 'virtio-block:<path>'",
                spec
            )),
        }
    }
}
