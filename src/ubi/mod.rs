//! The UBI on-disk format: header encoding/decoding and volume extraction.
//!
//! UBI describes flash contents with three fixed-layout structures: an
//! erase-counter ("EC") header in the first page of every eraseblock, a
//! volume-identifier ("VID") header in the second page of every in-use
//! eraseblock, and a 128-entry volume table stored as the payload of the
//! reserved "layout" volume. [`headers`] implements the byte-level codec for
//! all three; [`extract`] walks them to pull a volume's contents back out of
//! an image.

pub mod extract;
pub mod headers;

use thiserror::Error;

/// Volume ID of the internal layout volume holding the volume table.
pub const UBI_LAYOUT_VOLUME_ID: u32 = 0x7FFFEFFF;

/// Number of (redundant) LEBs the layout volume occupies.
pub const UBI_LAYOUT_VOLUME_EBS: u32 = 2;

/// `compat` value of the layout volume's VID headers (reject: an
/// implementation that does not know this volume must refuse the image).
pub const UBI_LAYOUT_VOLUME_COMPAT: u8 = 5;

/// Number of slots in the volume table.
pub const UBI_MAX_VOLUMES: usize = 128;

/// Longest permitted volume name, in bytes.
pub const UBI_VOL_NAME_MAX: usize = 127;

/// Ways the UBI on-disk structures can fail to decode, or a volume can fail
/// to resolve against the volume table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("header truncated")]
    Truncated,

    #[error("bad header magic")]
    BadMagic,

    #[error("unsupported UBI version {0}")]
    BadVersion(u8),

    #[error("bad header CRC")]
    BadChecksum,

    #[error("invalid volume type {0}")]
    BadVolType(u8),

    #[error("invalid data offset {0}")]
    BadDataOffset(u32),

    #[error("volume name is not valid UTF-8")]
    BadName,

    #[error("volume name too long ({len} bytes, max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("volume table not found in image")]
    LayoutNotFound,

    #[error("volume '{0}' not found")]
    NoSuchVolume(String),

    #[error("volume #{0} does not exist")]
    EmptySlot(u32),
}
