//! usbfs root discovery
//!
//! Strategies are tried in order:
//!
//! 1. well-known candidate directories, each with its own verifier
//! 2. any `usbfs`/`usbdevfs` entry in the mount table
//! 3. a private writable directory, mounted on demand
//!
//! Every strategy failing means USB is simply unavailable on this host.

use crate::error::{Result, UsbError};
use crate::settings::TransportSettings;
use nix::mount::{MsFlags, mount};
use nix::sys::statfs::{USBDEVICE_SUPER_MAGIC, statfs};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Checks whether a directory is a usable usbfs root
pub type Verifier = fn(&Path) -> bool;

/// Mounts usbfs on a directory, returning whether it worked
pub type Mounter = fn(&Path) -> bool;

/// Filesystem types accepted from the mount table
const MOUNT_TYPES: &[&str] = &["usbfs", "usbdevfs"];

/// Source name recorded for the private mount
const PRIVATE_MOUNT_SOURCE: &str = "brlusb-usbfs";

/// Accepts any existing directory
pub fn path_exists(path: &Path) -> bool {
    path.is_dir()
}

/// Accepts a directory whose filesystem reports the usbfs magic number
pub fn has_usbfs_magic(path: &Path) -> bool {
    match statfs(path) {
        Ok(stats) => stats.filesystem_type() == USBDEVICE_SUPER_MAGIC,
        Err(_) => false,
    }
}

/// Mounts usbfs at `path`
pub fn mount_usbfs(path: &Path) -> bool {
    match mount(
        Some(PRIVATE_MOUNT_SOURCE),
        path,
        Some("usbfs"),
        MsFlags::empty(),
        None::<&str>,
    ) {
        Ok(()) => {
            info!("usbfs mounted: {}", path.display());
            true
        }
        Err(errno) => {
            warn!(
                "usbfs mount failed: {}: {} ({})",
                path.display(),
                errno,
                errno as i32
            );
            false
        }
    }
}

struct PrivateMount {
    directory: PathBuf,
    verifier: Verifier,
    mounter: Mounter,
}

/// Finds the directory usbfs device nodes live under
pub struct UsbfsLocator {
    candidates: Vec<(PathBuf, Verifier)>,
    mount_tables: Vec<PathBuf>,
    mount_verifier: Verifier,
    private_mount: Option<PrivateMount>,
}

impl UsbfsLocator {
    /// The standard search for this host
    pub fn new(settings: &TransportSettings) -> Self {
        Self {
            candidates: vec![
                (PathBuf::from("/dev/bus/usb"), path_exists as Verifier),
                (PathBuf::from("/proc/bus/usb"), has_usbfs_magic as Verifier),
            ],
            mount_tables: vec![PathBuf::from("/proc/mounts"), PathBuf::from("/etc/mtab")],
            mount_verifier: has_usbfs_magic,
            private_mount: settings.private_mount_dir.clone().map(|directory| PrivateMount {
                directory,
                verifier: has_usbfs_magic,
                mounter: mount_usbfs,
            }),
        }
    }

    /// Replace the well-known candidate list
    pub fn with_candidates(mut self, candidates: Vec<(PathBuf, Verifier)>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Replace the mount tables searched and the check applied to their entries
    pub fn with_mount_table(mut self, tables: Vec<PathBuf>, verifier: Verifier) -> Self {
        self.mount_tables = tables;
        self.mount_verifier = verifier;
        self
    }

    /// Replace (or disable, with `None`) the private mount fallback
    pub fn with_private_mount(
        mut self,
        directory: Option<PathBuf>,
        verifier: Verifier,
        mounter: Mounter,
    ) -> Self {
        self.private_mount = directory.map(|directory| PrivateMount {
            directory,
            verifier,
            mounter,
        });
        self
    }

    /// Locate the usbfs root
    pub fn locate(&self) -> Result<PathBuf> {
        for (path, verifier) in &self.candidates {
            if verifier(path) {
                debug!("usbfs root found: {}", path.display());
                return Ok(path.clone());
            }
        }

        if let Some(path) = self.search_mount_table() {
            debug!("usbfs root found in mount table: {}", path.display());
            return Ok(path);
        }

        if let Some(path) = self.try_private_mount() {
            return Ok(path);
        }

        warn!("usbfs root not found");
        Err(UsbError::TransportUnavailable)
    }

    fn search_mount_table(&self) -> Option<PathBuf> {
        // Only the first readable table is consulted.
        let table = self
            .mount_tables
            .iter()
            .find_map(|path| fs::read_to_string(path).ok())?;

        table.lines().find_map(|line| {
            let mut fields = line.split_whitespace();
            let _source = fields.next()?;
            let target = decode_mount_field(fields.next()?);
            let fs_type = fields.next()?;

            if !MOUNT_TYPES.contains(&fs_type) {
                return None;
            }
            let target = PathBuf::from(target);
            (self.mount_verifier)(&target).then_some(target)
        })
    }

    fn try_private_mount(&self) -> Option<PathBuf> {
        let private = self.private_mount.as_ref()?;
        let directory = &private.directory;

        if let Err(e) = fs::create_dir_all(directory) {
            warn!(
                "usbfs private directory creation failed: {}: {}",
                directory.display(),
                e
            );
            return None;
        }

        if (private.verifier)(directory) || (private.mounter)(directory) {
            debug!("usbfs root at private mount: {}", directory.display());
            return Some(directory.clone());
        }
        None
    }
}

/// Decode the octal escapes (`\040` and friends) used in mount tables
fn decode_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |value, digit| value * 8 + u32::from(digit - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    decoded.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}
