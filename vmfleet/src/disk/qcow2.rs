//! Qcow2 header inspection.
//!
//! Only the fixed header fields needed to pick a backing format and to check
//! which file an existing overlay is backed by are parsed.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use vmfleet_shared::errors::{FleetError, FleetResult};

/// "QFI\xfb"
const QCOW2_MAGIC: u32 = 0x514649fb;

/// Version 2 header length; v3 extends it but keeps these fields in place.
const HEADER_LEN: usize = 72;

/// Backing file paths longer than this are not a sane overlay.
const MAX_BACKING_LEN: u32 = 4096;

/// Format of the image an overlay is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingFormat {
    Raw,
    Qcow2,
}

impl BackingFormat {
    /// Value for `qemu-img create -F`.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackingFormat::Raw => "raw",
            BackingFormat::Qcow2 => "qcow2",
        }
    }

    /// Detect the format of an image from its magic bytes.
    ///
    /// Anything without the qcow2 magic is treated as raw.
    pub fn detect(path: &Path) -> FleetResult<Self> {
        let mut file = File::open(path).map_err(|e| io_error(path, "open", e))?;
        let mut magic = [0u8; 4];
        match file.read_exact(&mut magic) {
            Ok(()) if u32::from_be_bytes(magic) == QCOW2_MAGIC => Ok(BackingFormat::Qcow2),
            Ok(()) => Ok(BackingFormat::Raw),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(BackingFormat::Raw),
            Err(e) => Err(io_error(path, "read", e)),
        }
    }
}

/// Parsed qcow2 header information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qcow2Header {
    pub version: u32,
    pub virtual_size: u64,
    pub cluster_bits: u32,
    /// Backing file recorded in the image, if any
    pub backing_file: Option<PathBuf>,
}

impl Qcow2Header {
    /// Read the header of a qcow2 image.
    pub fn read(path: &Path) -> FleetResult<Self> {
        let mut file = File::open(path).map_err(|e| io_error(path, "open", e))?;

        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)
            .map_err(|e| io_error(path, "read header from", e))?;

        // Parse qcow2 header (big-endian)
        let magic = be_u32(&header, 0);
        if magic != QCOW2_MAGIC {
            return Err(FleetError::Config(format!(
                "invalid qcow2 magic in {}: 0x{:08x}",
                path.display(),
                magic
            )));
        }

        let version = be_u32(&header, 4);
        let backing_offset = be_u64(&header, 8);
        let backing_len = be_u32(&header, 16);
        let cluster_bits = be_u32(&header, 20);
        let virtual_size = be_u64(&header, 24);

        let backing_file = if backing_offset == 0 || backing_len == 0 {
            None
        } else {
            if backing_len > MAX_BACKING_LEN {
                return Err(FleetError::Config(format!(
                    "backing file name in {} is {} bytes long",
                    path.display(),
                    backing_len
                )));
            }
            let mut name = vec![0u8; backing_len as usize];
            file.seek(SeekFrom::Start(backing_offset))
                .and_then(|_| file.read_exact(&mut name))
                .map_err(|e| io_error(path, "read backing file name from", e))?;
            Some(PathBuf::from(String::from_utf8_lossy(&name).into_owned()))
        };

        Ok(Self {
            version,
            virtual_size,
            cluster_bits,
            backing_file,
        })
    }
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn be_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

fn io_error(path: &Path, action: &str, e: std::io::Error) -> FleetError {
    FleetError::Io(std::io::Error::new(
        e.kind(),
        format!("failed to {action} {}: {e}", path.display()),
    ))
}

/// Build a minimal qcow2 v3 header, optionally with a backing file.
///
/// Only what [`Qcow2Header::read`] and [`BackingFormat::detect`] look at is
/// filled in. Used by tests and fakes that stand in for `qemu-img`.
#[cfg(any(test, feature = "test-utils"))]
pub fn header_bytes(virtual_size: u64, backing_file: Option<&Path>) -> Vec<u8> {
    let mut buf = vec![0u8; 512];
    buf[0..4].copy_from_slice(&QCOW2_MAGIC.to_be_bytes());
    buf[4..8].copy_from_slice(&3u32.to_be_bytes());
    buf[20..24].copy_from_slice(&16u32.to_be_bytes());
    buf[24..32].copy_from_slice(&virtual_size.to_be_bytes());
    buf[100..104].copy_from_slice(&104u32.to_be_bytes());

    if let Some(backing) = backing_file {
        let name = backing.to_string_lossy();
        let offset = buf.len() as u64;
        buf[8..16].copy_from_slice(&offset.to_be_bytes());
        buf[16..20].copy_from_slice(&(name.len() as u32).to_be_bytes());
        buf.extend_from_slice(name.as_bytes());
    }
    buf
}
