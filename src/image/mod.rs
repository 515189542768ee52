//! Whole-image synthesis: erase and write sweeps over an eraseblock range.
//!
//! A run is two full sequential passes over the target range. The erase pass
//! clears every block up front (skipping ones marked bad); the write pass
//! then regenerates one block's content at a time and places it, sliding
//! past physical blocks that fail. An interruption between the passes leaves
//! the device erased but unwritten, a safe and detectable state.

pub mod block;
pub mod writer;

use std::io::Read;

use thiserror::Error;

use block::{BlockGenerator, UbiLayout};
use writer::{Attempt, CLEAN_MARKER};

use crate::nand::{FlashGeometry, Nand, NandBlock};
use crate::ubi::headers::VolumeTable;
use crate::ubi::{FormatError, UBI_LAYOUT_VOLUME_EBS, UBI_MAX_VOLUMES, UBI_VOL_NAME_MAX};

/// Configuration problems detected before anything touches the flash.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("start block {start} out of range (device has {blocks} blocks)")]
    StartOutOfRange { start: u32, blocks: u32 },

    #[error("block count out of range")]
    BlockCountOutOfRange,

    #[error("invalid volume ID {0}")]
    BadVolumeId(u32),

    #[error("eraseblocks of {0} bytes cannot hold the volume table")]
    PebTooSmall(u32),

    #[error("volume LEBs don't fit into the allocated blocks")]
    VolumeDoesNotFit,

    #[error("image does not fit into the allocated space")]
    ImageTooLarge,
}

/// The UBI volume to synthesize around the input data.
#[derive(Debug, Clone)]
pub struct UbiVolumeSpec {
    /// Volume table slot (and on-disk volume ID).
    pub vol_id: u32,

    /// Volume name, stored in the volume table.
    pub name: String,

    /// Requested LEB count. `0` means all available LEBs minus a headroom of
    /// [`DEFAULT_SPARE_LEBS`]; a negative value means "all available plus
    /// this" (i.e. all but N).
    pub lebs: i64,
}

/// What to write, and where.
#[derive(Debug, Clone, Default)]
pub struct WriteConfig {
    /// First eraseblock of the target range.
    pub start_block: u32,

    /// Number of eraseblocks in the range (None = to end of device).
    pub block_count: Option<u32>,

    /// Attach a JFFS2 clean marker to every written block.
    pub clean_markers: bool,

    /// Format the range as a UBI device around this volume, instead of
    /// writing the input verbatim.
    pub ubi: Option<UbiVolumeSpec>,
}

/// The source of payload bytes for a write run.
pub enum InputSpec<'a> {
    /// No payload: erase only (raw mode), or an empty volume (UBI mode).
    None,

    /// A source with a known byte count; ending early is an error.
    Sized {
        reader: &'a mut dyn Read,
        size: u64,
    },

    /// An unbounded stream (e.g. stdin); ends at EOF.
    Streaming { reader: &'a mut dyn Read },
}

impl InputSpec<'_> {
    /// The number of payload bytes this input will provide, if known.
    pub fn size(&self) -> Option<u64> {
        match self {
            InputSpec::None => Some(0),
            InputSpec::Sized { size, .. } => Some(*size),
            InputSpec::Streaming { .. } => None,
        }
    }
}

/// Headroom subtracted from the default volume size, leaving UBI spare
/// blocks for bad-block replacement over the device lifetime.
pub const DEFAULT_SPARE_LEBS: u64 = 20;

/// Turn a requested LEB count into an actual one, given how many LEBs the
/// target range can hold.
fn resolve_vol_lebs(configured: i64, total_available: u64) -> Result<u64, ConfigError> {
    let total = i64::try_from(total_available).map_err(|_| ConfigError::VolumeDoesNotFit)?;

    let resolved = match configured {
        0 => total - DEFAULT_SPARE_LEBS as i64,
        n if n < 0 => total + n,
        n => n,
    };

    if resolved < 0 || resolved > total {
        return Err(ConfigError::VolumeDoesNotFit);
    }
    Ok(resolved as u64)
}

/// A validated write run: the block range and, in UBI mode, the resolved
/// volume layout.
struct WritePlan {
    start: u32,
    end: u32,
    ubi: Option<UbiLayout>,
}

/// Check a configuration against the device geometry and input size.
///
/// Nothing destructive may happen before this passes.
fn validate(
    geometry: &FlashGeometry,
    cfg: &WriteConfig,
    input_size: Option<u64>,
) -> anyhow::Result<WritePlan> {
    let blocks = geometry.block_count();
    let eb_size = u64::from(geometry.eraseblock_size);

    if cfg.start_block >= blocks {
        return Err(ConfigError::StartOutOfRange {
            start: cfg.start_block,
            blocks,
        }
        .into());
    }

    let end = match cfg.block_count {
        None => blocks,
        Some(count) => cfg
            .start_block
            .checked_add(count)
            .filter(|&end| end <= blocks)
            .ok_or(ConfigError::BlockCountOutOfRange)?,
    };
    let range_blocks = u64::from(end - cfg.start_block);

    let Some(volume) = &cfg.ubi else {
        if let Some(size) = input_size {
            if size > range_blocks * eb_size {
                return Err(ConfigError::ImageTooLarge.into());
            }
        }

        return Ok(WritePlan {
            start: cfg.start_block,
            end,
            ubi: None,
        });
    };

    // UBI mode. Two pages per block go to headers; the rest is LEB payload,
    // and the first two blocks of the range go to the layout volume.
    if volume.vol_id as usize >= UBI_MAX_VOLUMES {
        return Err(ConfigError::BadVolumeId(volume.vol_id).into());
    }
    if volume.name.len() > UBI_VOL_NAME_MAX {
        return Err(FormatError::NameTooLong {
            len: volume.name.len(),
            max: UBI_VOL_NAME_MAX,
        }
        .into());
    }

    let leb_size = u64::from(geometry.eraseblock_size)
        .checked_sub(2 * u64::from(geometry.min_io_size))
        .filter(|&leb| leb >= VolumeTable::BYTES as u64)
        .ok_or(ConfigError::PebTooSmall(geometry.eraseblock_size))?;

    let total_available = range_blocks
        .checked_sub(u64::from(UBI_LAYOUT_VOLUME_EBS))
        .ok_or(ConfigError::VolumeDoesNotFit)?;
    let vol_lebs = resolve_vol_lebs(volume.lebs, total_available)?;

    if let Some(size) = input_size {
        if size > vol_lebs * leb_size {
            return Err(ConfigError::ImageTooLarge.into());
        }
    }

    Ok(WritePlan {
        start: cfg.start_block,
        end,
        ubi: Some(UbiLayout {
            vol_id: volume.vol_id,
            name: volume.name.clone(),
            lebs: vol_lebs as u32,
        }),
    })
}

/// Erase every block in `[start, end)`, skipping blocks already marked bad
/// and continuing past per-block erase failures.
fn erase_range<N: Nand>(nand: &mut N, start: u32, end: u32) -> anyhow::Result<()> {
    let geometry = nand.geometry();
    let rpt = howudoin::new()
        .label("Erasing blocks")
        .set_len(u64::from(end - start));

    for index in start..end {
        let addr = geometry.block_addr(index);
        match nand.block(index)? {
            None => {
                rpt.add_info(format!("Skipping erase of bad block at {addr:#010x}"));
            }
            Some(mut block) => {
                if block.erase().is_err() {
                    rpt.add_info(format!("Erase block failed at {addr:#010x}"));
                }
            }
        }
        rpt.inc();
    }

    rpt.close();
    Ok(())
}

/// Erase the configured block range and write the configured content to it.
///
/// Individual failing blocks are skipped (and marked bad where appropriate),
/// with their content retried at the following address. The run only
/// succeeds if every input byte ended up on flash.
pub fn write_image<N: Nand>(
    nand: &mut N,
    cfg: &WriteConfig,
    input: InputSpec<'_>,
) -> anyhow::Result<()> {
    let geometry = nand.geometry();
    let plan = validate(&geometry, cfg, input.size())?;

    erase_range(nand, plan.start, plan.end)?;

    if matches!(input, InputSpec::None) && plan.ubi.is_none() {
        // Erase-only run.
        return Ok(());
    }

    let marker = cfg.clean_markers.then_some(&CLEAN_MARKER[..]);
    let mut generator = BlockGenerator::new(geometry, plan.ubi, input);

    let rpt = howudoin::new()
        .label("Writing blocks")
        .set_len(u64::from(plan.end - plan.start));

    let mut index = plan.start;
    'sweep: while index < plan.end {
        let content = generator.next_content()?;
        let payload = generator.encode(content)?;

        loop {
            match writer::attempt(nand, index, &payload, marker)? {
                Attempt::Written => break,
                Attempt::Retry { next } => {
                    rpt.add_info(format!(
                        "Write failed at {:#010x}, retrying at next block",
                        geometry.block_addr(index)
                    ));
                    index = next;
                    if index >= plan.end {
                        break 'sweep;
                    }
                }
            }
        }

        index += 1;
        rpt.inc();
    }

    rpt.close();

    if generator.remaining().is_some_and(|left| left > 0) {
        anyhow::bail!("data only partially written due to error");
    }

    Ok(())
}
