//! Encoding and decoding of the UBI on-disk structures (EC header, VID
//! header, volume table record), with CRC computation and verification.
//!
//! Each structure exists in two layers: a raw deku struct matching the
//! on-disk byte layout exactly, and an ergonomic type carrying only the
//! fields callers work with. Conversions between the two compute and check
//! the CRC.

use crc::{Crc, CRC_32_JAMCRC};
use deku::prelude::*;

use super::{FormatError, UBI_MAX_VOLUMES, UBI_VOL_NAME_MAX};

/// CRC32 as UBI uses it: seed `0xFFFFFFFF`, reflected, no final XOR. This is
/// not the common zlib CRC32 (which XORs the result with `0xFFFFFFFF`).
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

const UBI_VERSION: u8 = 1;

pub const UBI_EC_HDR_MAGIC: [u8; 4] = *b"UBI#";
pub const UBI_VID_HDR_MAGIC: [u8; 4] = *b"UBI!";

/// What the magic field reads as in a fully-erased block.
const ERASED_MAGIC: [u8; 4] = [0xFF; 4];

pub const UBI_EC_HDR_SIZE: usize = 64;
pub const UBI_VID_HDR_SIZE: usize = 64;
pub const UBI_VTBL_RECORD_SIZE: usize = 172;

/// Raw on-disk erase-counter header, stored at offset 0 of every eraseblock.
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct EcHdr {
    pub magic: [u8; 4],
    pub version: u8,
    pub padding1: [u8; 3],
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
    pub padding2: [u8; 32],
    pub hdr_crc: u32,
}

/// Raw on-disk volume-identifier header, stored at `vid_hdr_offset`.
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct VidHdr {
    pub magic: [u8; 4],
    pub version: u8,
    pub vol_type: u8,
    pub copy_flag: u8,
    pub compat: u8,
    pub vol_id: u32,
    pub lnum: u32,
    pub padding1: [u8; 4],
    pub data_size: u32,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub data_crc: u32,
    pub padding2: [u8; 4],
    pub sqnum: u64,
    pub padding3: [u8; 12],
    pub hdr_crc: u32,
}

/// Raw on-disk volume table record. The table is exactly
/// [`UBI_MAX_VOLUMES`] of these, stored as the layout volume's payload.
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct VtblRecord {
    pub reserved_pebs: u32,
    pub alignment: u32,
    pub data_pad: u32,
    pub vol_type: u8,
    pub upd_marker: u8,
    pub name_len: u16,
    pub name: [u8; 128],
    pub flags: u8,
    pub padding: [u8; 23],
    pub crc: u32,
}

/// CRC handling common to all three structures: the stored CRC covers every
/// serialized byte except the trailing 4-byte CRC field itself.
pub trait HeaderCrc: DekuContainerWrite {
    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);

    fn compute_crc(&self) -> u32 {
        let bytes = self.to_bytes().unwrap();
        let crc_len = bytes.len() - std::mem::size_of::<u32>();
        UBI_CRC.checksum(&bytes[..crc_len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }
}

impl HeaderCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl HeaderCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl HeaderCrc for VtblRecord {
    fn get_crc(&self) -> u32 {
        self.crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.crc = crc;
    }
}

/// Shared parsing for the EC and VID headers.
///
/// Magic discrimination happens before anything else: an all-`0xFF` magic
/// means the block is empty (erased), not corrupt, and decodes to `None`.
/// Only a header with a plausible magic is held to the CRC check.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + HeaderCrc {
    const MAGIC: [u8; 4];

    fn hdr_magic(&self) -> [u8; 4];
    fn hdr_version(&self) -> u8;

    fn parse(buf: &'a [u8]) -> Result<Option<Self>, FormatError> {
        let (_, header) = Self::from_bytes((buf, 0)).map_err(|_| FormatError::Truncated)?;

        if header.hdr_magic() == ERASED_MAGIC {
            return Ok(None);
        }
        if header.hdr_magic() != Self::MAGIC {
            return Err(FormatError::BadMagic);
        }
        if header.hdr_version() != UBI_VERSION {
            return Err(FormatError::BadVersion(header.hdr_version()));
        }
        if !header.check_crc() {
            return Err(FormatError::BadChecksum);
        }

        Ok(Some(header))
    }
}

impl ParseHeader<'_> for EcHdr {
    const MAGIC: [u8; 4] = UBI_EC_HDR_MAGIC;

    fn hdr_magic(&self) -> [u8; 4] {
        self.magic
    }
    fn hdr_version(&self) -> u8 {
        self.version
    }
}

impl ParseHeader<'_> for VidHdr {
    const MAGIC: [u8; 4] = UBI_VID_HDR_MAGIC;

    fn hdr_magic(&self) -> [u8; 4] {
        self.magic
    }
    fn hdr_version(&self) -> u8 {
        self.version
    }
}

/// The fields of an EC header that callers actually work with.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    /// Decode from a byte slice. `Ok(None)` means the block is erased.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, FormatError> {
        Ok(EcHdr::parse(bytes)?.map(Into::into))
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = EcHdr::from(self).to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        } = value;

        let mut target = Self {
            magic: UBI_EC_HDR_MAGIC,
            version: UBI_VERSION,

            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for
    /// whole-volume updates
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = FormatError;

    fn try_from(value: u8) -> Result<Self, FormatError> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            x => Err(FormatError::BadVolType(x)),
        }
    }
}

/// The fields of a VID header that callers actually work with.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling
    /// purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how UBI should handle the
    /// volume.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    /// For `Static` volumes, the number of payload bytes covered by
    /// `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is
    /// `Dynamic`
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the PEB, to cut the LEB down
    /// to a multiple of the requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written, for
    /// resolving `vol_id:lnum` collisions.
    pub sqnum: u64,
}

impl Vid {
    /// Decode from a byte slice. `Ok(None)` means the VID area is erased.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, FormatError> {
        match VidHdr::parse(bytes)? {
            None => Ok(None),
            Some(header) => header.try_into().map(Some),
        }
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = VidHdr::from(self).to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = FormatError;

    fn try_from(value: VidHdr) -> Result<Self, FormatError> {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let copy_flag = copy_flag != 0;

        Ok(Self {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        })
    }
}

impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        } = value;

        let vol_type = vol_type.into();
        let copy_flag = copy_flag.into();

        let mut target = Self {
            magic: UBI_VID_HDR_MAGIC,
            version: UBI_VERSION,

            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// One populated slot of the volume table.
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// The total number of PEBs allocated to this volume.
    pub reserved_pebs: u32,

    /// All LEBs in this volume will be a multiple of this size.
    pub alignment: u32,

    /// The number of bytes reserved from the end of each PEB to ensure
    /// alignment.
    pub data_pad: u32,

    /// The type of volume.
    pub vol_type: VolType,

    /// Set during a whole-volume update, so that if interrupted, it's
    /// possible to detect that the volume is corrupt.
    pub upd_marker: bool,

    /// The name of the volume. Other UBI implementors might assume only
    /// ASCII, so it's best to stick to that.
    pub name: String,

    /// Any flags set on this volume.
    pub flags: u8,
}

impl VolTableRecord {
    /// Build a record for a freshly-created volume, validating the name.
    pub fn new(vol_type: VolType, name: &str, reserved_pebs: u32) -> Result<Self, FormatError> {
        if name.len() > UBI_VOL_NAME_MAX {
            return Err(FormatError::NameTooLong {
                len: name.len(),
                max: UBI_VOL_NAME_MAX,
            });
        }

        Ok(Self {
            reserved_pebs,
            alignment: 1,
            vol_type,
            name: name.to_string(),
            ..Default::default()
        })
    }

    /// Is this slot unoccupied? An empty slot is all-zero on disk, with only
    /// its CRC set.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    /// Decode one slot from a byte slice, verifying its CRC.
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let (_, record) = VtblRecord::from_bytes((bytes, 0)).map_err(|_| FormatError::Truncated)?;
        if !record.check_crc() {
            return Err(FormatError::BadChecksum);
        }
        record.try_into()
    }

    /// Serialize into the on-disk record bytes
    pub fn into_bytes(self) -> Vec<u8> {
        VtblRecord::from(self).to_bytes().unwrap()
    }

    /// Serialize an empty slot (still CRC'd)
    pub fn empty_bytes() -> Vec<u8> {
        let mut record = VtblRecord {
            reserved_pebs: Default::default(),
            alignment: Default::default(),
            data_pad: Default::default(),
            vol_type: Default::default(),
            upd_marker: Default::default(),
            name: std::array::from_fn(|_| 0u8),
            name_len: Default::default(),
            flags: Default::default(),
            crc: Default::default(),
            padding: Default::default(),
        };
        record.fix_crc();
        record.to_bytes().unwrap()
    }
}

impl TryFrom<VtblRecord> for VolTableRecord {
    type Error = FormatError;

    fn try_from(value: VtblRecord) -> Result<Self, FormatError> {
        let VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,
            ..
        } = value;

        // An empty slot stores zero in every field, including vol_type.
        let vol_type = match name_len {
            0 => VolType::default(),
            _ => vol_type.try_into()?,
        };
        let upd_marker = upd_marker != 0;

        let name_len = name_len as usize;
        if name_len > UBI_VOL_NAME_MAX {
            return Err(FormatError::NameTooLong {
                len: name_len,
                max: UBI_VOL_NAME_MAX,
            });
        }
        let name = std::str::from_utf8(&name[..name_len])
            .map_err(|_| FormatError::BadName)?
            .to_string();

        Ok(Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        })
    }
}

impl From<VolTableRecord> for VtblRecord {
    fn from(value: VolTableRecord) -> VtblRecord {
        let VolTableRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        } = value;

        let vol_type = vol_type.into();
        let upd_marker = upd_marker.into();
        let name_len = name.len() as _;

        let name_bytes = name.as_bytes();
        let mut name = std::array::from_fn(|_| 0u8);
        name[..name_bytes.len()].copy_from_slice(name_bytes);

        let mut target = Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,

            crc: Default::default(),
            padding: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// The full volume table: [`UBI_MAX_VOLUMES`] slots, stored back-to-back as
/// the payload of each layout-volume LEB.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeTable {
    records: [Option<VolTableRecord>; UBI_MAX_VOLUMES],
}

impl Default for VolumeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeTable {
    /// Size of the encoded table, in bytes.
    pub const BYTES: usize = UBI_MAX_VOLUMES * UBI_VTBL_RECORD_SIZE;

    /// Create a table of all-empty slots.
    pub fn new() -> Self {
        Self {
            records: std::array::from_fn(|_| None),
        }
    }

    /// Populate one slot.
    ///
    /// Panics if `slot` is out of range or already occupied.
    pub fn set(&mut self, slot: u32, record: VolTableRecord) {
        assert!(self.records[slot as usize].replace(record).is_none());
    }

    pub fn get(&self, slot: u32) -> Option<&VolTableRecord> {
        self.records.get(slot as usize)?.as_ref()
    }

    /// Serialize the whole table; every slot's CRC is computed, occupied or
    /// not.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::BYTES);
        for record in &self.records {
            match record {
                Some(record) => bytes.append(&mut record.clone().into_bytes()),
                None => bytes.append(&mut VolTableRecord::empty_bytes()),
            }
        }
        bytes
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode_decode() -> anyhow::Result<()> {
        let ec = Ec {
            vid_hdr_offset: 2048,
            data_offset: 4096,
            image_seq: 0x1234_5678,
            ..Default::default()
        };
        let vid = Vid {
            vol_id: 3,
            lnum: 17,
            ..Default::default()
        };
        let record = VolTableRecord::new(VolType::Dynamic, "rootfs", 100)?;

        let mut buf = vec![0u8; 1024];

        ec.encode(&mut buf)?;
        assert_eq!(Ec::decode(&buf)?, Some(ec));

        vid.encode(&mut buf)?;
        assert_eq!(Vid::decode(&buf)?, Some(vid));

        let bytes = record.clone().into_bytes();
        assert_eq!(bytes.len(), UBI_VTBL_RECORD_SIZE);
        assert_eq!(VolTableRecord::decode(&bytes)?, record);

        Ok(())
    }

    #[test]
    fn test_erased_is_empty_not_corrupt() -> anyhow::Result<()> {
        let buf = vec![0xFFu8; UBI_EC_HDR_SIZE];
        assert_eq!(Ec::decode(&buf)?, None);
        assert_eq!(Vid::decode(&buf)?, None);
        Ok(())
    }

    #[test]
    fn test_corruption_detected() -> anyhow::Result<()> {
        let ec = Ec {
            vid_hdr_offset: 2048,
            data_offset: 4096,
            image_seq: 99,
            ..Default::default()
        };

        let mut buf = vec![0u8; UBI_EC_HDR_SIZE];
        ec.encode(&mut buf)?;

        // Any corrupted body byte must fail the CRC check; a corrupted magic
        // is detected before the CRC is even computed.
        let mut corrupt = buf.clone();
        corrupt[9] ^= 0x01;
        assert_eq!(Ec::decode(&corrupt), Err(FormatError::BadChecksum));

        let mut corrupt = buf.clone();
        corrupt[0] ^= 0x01;
        assert_eq!(Ec::decode(&corrupt), Err(FormatError::BadMagic));

        let mut corrupt = buf.clone();
        corrupt[4] = 9;
        assert_eq!(Ec::decode(&corrupt), Err(FormatError::BadVersion(9)));

        // Flipping a bit of the stored CRC itself also fails the check.
        let mut corrupt = buf;
        corrupt[UBI_EC_HDR_SIZE - 1] ^= 0x80;
        assert_eq!(Ec::decode(&corrupt), Err(FormatError::BadChecksum));

        assert_eq!(Ec::decode(&[0u8; 10]), Err(FormatError::Truncated));

        Ok(())
    }

    #[test]
    fn test_vid_crc_covers_body() -> anyhow::Result<()> {
        let vid = Vid {
            vol_id: 1,
            lnum: 2,
            ..Default::default()
        };

        let mut buf = vec![0u8; UBI_VID_HDR_SIZE];
        vid.encode(&mut buf)?;

        for byte in 4..UBI_VID_HDR_SIZE - 4 {
            let mut corrupt = buf.clone();
            corrupt[byte] ^= 0xA5;
            assert!(Vid::decode(&corrupt).is_err(), "byte {byte} undetected");
        }

        Ok(())
    }

    #[test]
    fn test_empty_record() {
        let bytes = VolTableRecord::empty_bytes();
        assert_eq!(bytes.len(), UBI_VTBL_RECORD_SIZE);

        let record = VolTableRecord::decode(&bytes).unwrap();
        assert!(record.is_empty());

        // All-zero without the CRC is not a valid slot.
        assert_eq!(
            VolTableRecord::decode(&vec![0u8; UBI_VTBL_RECORD_SIZE]),
            Err(FormatError::BadChecksum)
        );
    }

    #[test]
    fn test_name_too_long() {
        let long = "x".repeat(UBI_VOL_NAME_MAX + 1);
        assert_eq!(
            VolTableRecord::new(VolType::Dynamic, &long, 1),
            Err(FormatError::NameTooLong {
                len: UBI_VOL_NAME_MAX + 1,
                max: UBI_VOL_NAME_MAX
            })
        );

        assert!(VolTableRecord::new(VolType::Dynamic, &long[..UBI_VOL_NAME_MAX], 1).is_ok());
    }

    #[test]
    fn test_volume_table() {
        let mut table = VolumeTable::new();
        table.set(5, VolTableRecord::new(VolType::Dynamic, "data", 40).unwrap());

        let bytes = table.encode();
        assert_eq!(bytes.len(), VolumeTable::BYTES);

        for slot in 0..UBI_MAX_VOLUMES {
            let record =
                VolTableRecord::decode(&bytes[slot * UBI_VTBL_RECORD_SIZE..]).unwrap();
            if slot == 5 {
                assert_eq!(record.name, "data");
                assert_eq!(record.reserved_pebs, 40);
                assert_eq!(record.alignment, 1);
            } else {
                assert!(record.is_empty());
            }
        }
    }
}
