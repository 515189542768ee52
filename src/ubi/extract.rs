//! Extraction of one volume's contents from a UBI image.
//!
//! Three phases: locate the layout volume by scanning eraseblock-sized
//! strides from the start of the image; resolve the requested volume against
//! the volume table it carries; then walk every eraseblock, copying the data
//! area of each block belonging to the volume to its logical position in the
//! output. Physical order need not match logical order, so the output is
//! written by seeking, not appending.

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{ensure, Context};

use super::headers::{Ec, Vid, VolTableRecord, UBI_EC_HDR_SIZE, UBI_VID_HDR_SIZE,
    UBI_VTBL_RECORD_SIZE};
use super::{FormatError, UBI_LAYOUT_VOLUME_ID, UBI_MAX_VOLUMES};
use crate::nand::FILL_PATTERN;

/// How the caller names the volume to extract.
#[derive(Debug, Clone)]
pub enum VolumeRef {
    /// By volume table index (0-based).
    Index(u32),

    /// By the unique name stored in the volume table.
    Name(String),
}

/// What [`extract_volume`] found and copied.
#[derive(Debug)]
pub struct ExtractSummary {
    /// The resolved volume ID.
    pub vol_id: u32,

    /// Usable bytes per eraseblock in this image (the LEB size).
    pub data_size: u32,

    /// Number of eraseblocks that belonged to the volume.
    pub blocks: u32,
}

/// EC+VID summary of one eraseblock of the image.
#[derive(Debug)]
enum BlockInfo {
    /// Fully erased; carries no headers at all.
    Empty,

    /// EC header only; the block holds no volume data.
    EcOnly,

    /// In use by some volume.
    Mapped { data_offset: u32, vid: Vid },
}

/// Decode the headers of the eraseblock at `base`.
///
/// I/O problems are the outer error (always fatal); malformed headers are
/// the inner one, so the caller can choose to skip the block.
fn read_block_info<F: Read + Seek>(
    input: &mut F,
    base: u64,
    peb_size: u32,
) -> anyhow::Result<Result<BlockInfo, FormatError>> {
    let mut ec_buf = [0u8; UBI_EC_HDR_SIZE];
    input.seek(SeekFrom::Start(base))?;
    input
        .read_exact(&mut ec_buf)
        .context("failed to read EC header")?;

    let ec = match Ec::decode(&ec_buf) {
        Err(err) => return Ok(Err(err)),
        Ok(None) => return Ok(Ok(BlockInfo::Empty)),
        Ok(Some(ec)) => ec,
    };

    let vid_end = ec.vid_hdr_offset.checked_add(UBI_VID_HDR_SIZE as u32);
    if ec.data_offset >= peb_size || vid_end.map_or(true, |end| ec.data_offset < end) {
        return Ok(Err(FormatError::BadDataOffset(ec.data_offset)));
    }

    let mut vid_buf = [0u8; UBI_VID_HDR_SIZE];
    input.seek(SeekFrom::Start(base + u64::from(ec.vid_hdr_offset)))?;
    input
        .read_exact(&mut vid_buf)
        .context("failed to read VID header")?;

    Ok(Vid::decode(&vid_buf).map(|vid| match vid {
        None => BlockInfo::EcOnly,
        Some(vid) => BlockInfo::Mapped {
            data_offset: ec.data_offset,
            vid,
        },
    }))
}

/// Determine the image size, validating it against the eraseblock size.
fn image_size<F: Seek>(input: &mut F, peb_size: u32) -> anyhow::Result<u64> {
    let size = input.seek(SeekFrom::End(0))?;
    ensure!(
        size > 0 && size % u64::from(peb_size) == 0,
        "bad size of input file ({size} bytes)"
    );
    Ok(size)
}

/// Scan for the first eraseblock holding the layout volume.
///
/// Returns its byte offset and data offset. Header errors during this scan
/// are fatal; without a readable layout volume there is nothing to extract.
fn locate_layout<F: Read + Seek>(
    input: &mut F,
    image_size: u64,
    peb_size: u32,
) -> anyhow::Result<(u64, u32)> {
    for base in (0..image_size).step_by(peb_size as usize) {
        let info = read_block_info(input, base, peb_size)?
            .with_context(|| format!("bad headers in eraseblock at {base:#010x}"))?;

        if let BlockInfo::Mapped { data_offset, vid } = info {
            if vid.vol_id == UBI_LAYOUT_VOLUME_ID {
                return Ok((base, data_offset));
            }
        }
    }

    Err(FormatError::LayoutNotFound.into())
}

/// Read and CRC-check all slots of the volume table at `table_base`;
/// empty slots come back as `None`.
fn read_records<F: Read + Seek>(
    input: &mut F,
    table_base: u64,
) -> anyhow::Result<Vec<Option<VolTableRecord>>> {
    input.seek(SeekFrom::Start(table_base))?;

    let mut buf = [0u8; UBI_VTBL_RECORD_SIZE];
    let mut records = Vec::with_capacity(UBI_MAX_VOLUMES);
    for slot in 0..UBI_MAX_VOLUMES {
        input
            .read_exact(&mut buf)
            .context("failed to read volume table record")?;
        let record = VolTableRecord::decode(&buf)
            .with_context(|| format!("bad volume table record {slot}"))?;
        records.push(Some(record).filter(|r| !r.is_empty()));
    }

    Ok(records)
}

/// Read the image's volume table. Empty slots come back as `None`.
pub fn read_volume_table<F: Read + Seek>(
    input: &mut F,
    peb_size: u32,
) -> anyhow::Result<Vec<Option<VolTableRecord>>> {
    let image_size = image_size(input, peb_size)?;
    let (base, data_offset) = locate_layout(input, image_size, peb_size)?;
    read_records(input, base + u64::from(data_offset))
}

/// Resolve a volume reference to its ID, against the table at `table_base`.
fn resolve_volume<F: Read + Seek>(
    input: &mut F,
    table_base: u64,
    target: &VolumeRef,
) -> anyhow::Result<u32> {
    match target {
        VolumeRef::Index(index) => {
            ensure!(
                (*index as usize) < UBI_MAX_VOLUMES,
                "bad volume index {index}"
            );

            let mut buf = [0u8; UBI_VTBL_RECORD_SIZE];
            input.seek(SeekFrom::Start(
                table_base + u64::from(*index) * UBI_VTBL_RECORD_SIZE as u64,
            ))?;
            input
                .read_exact(&mut buf)
                .context("failed to read volume table record")?;

            let record = VolTableRecord::decode(&buf)?;
            if record.is_empty() {
                return Err(FormatError::EmptySlot(*index).into());
            }
            Ok(*index)
        }

        VolumeRef::Name(name) => {
            let records = read_records(input, table_base)?;
            records
                .iter()
                .position(|r| r.as_ref().is_some_and(|r| r.name == *name))
                .map(|slot| slot as u32)
                .ok_or_else(|| FormatError::NoSuchVolume(name.clone()).into())
        }
    }
}

/// Copy one volume's contents out of a UBI image.
///
/// Each eraseblock belonging to the volume contributes its data area at
/// output offset `lnum * data_size`. Trailing erased bytes of each block are
/// trimmed, so regions of the output no block wrote read back as zeros
/// rather than the flash fill pattern.
///
/// `skip_bad` turns per-block header errors into silent skips; errors while
/// locating the layout volume or reading the volume table are always fatal.
pub fn extract_volume<F, W>(
    input: &mut F,
    peb_size: u32,
    target: &VolumeRef,
    skip_bad: bool,
    output: &mut W,
) -> anyhow::Result<ExtractSummary>
where
    F: Read + Seek,
    W: Write + Seek,
{
    let image_size = image_size(input, peb_size)?;
    let (layout_base, layout_data_offset) = locate_layout(input, image_size, peb_size)?;
    let vol_id = resolve_volume(
        input,
        layout_base + u64::from(layout_data_offset),
        target,
    )?;

    let data_size = peb_size - layout_data_offset;
    let mut buf = vec![0u8; data_size as usize];
    let mut blocks = 0;

    for base in (0..image_size).step_by(peb_size as usize) {
        let info = read_block_info(input, base, peb_size)?;

        // A block the volume check cannot even be made on is either skipped
        // or fatal, per the skip_bad policy.
        let checked = info.and_then(|info| match info {
            BlockInfo::Mapped { data_offset, vid }
                if u64::from(data_offset) + u64::from(data_size) > u64::from(peb_size) =>
            {
                Err(FormatError::BadDataOffset(data_offset))
            }
            info => Ok(info),
        });

        let info = match checked {
            Ok(info) => info,
            Err(_) if skip_bad => continue,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("bad headers in eraseblock at {base:#010x}"))
            }
        };

        let (data_offset, vid) = match info {
            BlockInfo::Mapped { data_offset, vid } if vid.vol_id == vol_id => (data_offset, vid),
            _ => continue,
        };

        input.seek(SeekFrom::Start(base + u64::from(data_offset)))?;
        input
            .read_exact(&mut buf)
            .with_context(|| format!("failed to read data at {base:#010x}"))?;

        let used = buf.len() - buf.iter().rev().take_while(|&&b| b == FILL_PATTERN).count();
        if used > 0 {
            output.seek(SeekFrom::Start(u64::from(vid.lnum) * u64::from(data_size)))?;
            output.write_all(&buf[..used])?;
        }

        blocks += 1;
    }

    Ok(ExtractSummary {
        vol_id,
        data_size,
        blocks,
    })
}
