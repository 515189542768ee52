//! Per-eraseblock content generation for image synthesis.
//!
//! The synthesizer walks logical block numbers; for each one,
//! [`BlockGenerator::next_content`] decides what belongs there (raw bytes, a
//! layout-volume LEB, a data LEB, or an erase-counter placeholder) and pulls
//! any payload from the input stream. [`encode_block`] then renders the
//! decision into the bytes to program, keeping structure separate from
//! offset arithmetic.

use std::io::Read;

use anyhow::{ensure, Context};

use super::InputSpec;
use crate::nand::{FlashGeometry, FILL_PATTERN};
use crate::ubi::headers::{Ec, Vid, VolTableRecord, VolType, VolumeTable, UBI_EC_HDR_SIZE};
use crate::ubi::{UBI_LAYOUT_VOLUME_COMPAT, UBI_LAYOUT_VOLUME_EBS, UBI_LAYOUT_VOLUME_ID};
use crate::util::ReadExt;

/// What one eraseblock of the target range should contain.
#[derive(Debug, PartialEq)]
pub enum BlockContent {
    /// Verbatim image bytes, no UBI structures
    Raw(Vec<u8>),

    /// One LEB of the layout volume, carrying the full volume table
    LayoutLeb { lnum: u32, vtbl: VolumeTable },

    /// One LEB of the data volume
    DataLeb {
        vol_id: u32,
        lnum: u32,
        payload: Vec<u8>,
    },

    /// Erase-counter placeholder past the end of the volume
    SpareLeb,
}

/// The UBI volume being synthesized, with its LEB count already resolved.
#[derive(Debug, Clone)]
pub struct UbiLayout {
    pub vol_id: u32,
    pub name: String,
    pub lebs: u32,
}

/// Produces the content of each logical block of a write run, in order.
///
/// Owns the run's mutable state: the monotonic logical block number, the
/// lazily-generated image sequence number, and the input stream position.
pub struct BlockGenerator<'a> {
    geometry: FlashGeometry,
    ubi: Option<UbiLayout>,
    reader: Option<&'a mut dyn Read>,

    /// Payload bytes still expected, or None for an unbounded stream.
    remaining: Option<u64>,

    blk_no: u32,
    image_seq: u32,
}

impl<'a> BlockGenerator<'a> {
    pub fn new(geometry: FlashGeometry, ubi: Option<UbiLayout>, input: InputSpec<'a>) -> Self {
        let (reader, remaining) = match input {
            InputSpec::None => (None, Some(0)),
            InputSpec::Sized { reader, size } => (Some(reader), Some(size)),
            InputSpec::Streaming { reader } => (Some(reader), None),
        };

        Self {
            geometry,
            ubi,
            reader,
            remaining,
            blk_no: 0,
            image_seq: 0,
        }
    }

    /// Payload bytes not yet consumed, if the input size is known.
    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    /// The image sequence number for this run, generated on first use.
    fn image_seq(&mut self) -> u32 {
        while self.image_seq == 0 {
            self.image_seq = rand::random();
        }
        self.image_seq
    }

    /// Usable payload bytes per eraseblock, after the two header pages.
    fn leb_size(&self) -> usize {
        (self.geometry.eraseblock_size - 2 * self.geometry.min_io_size) as usize
    }

    /// Generate the content of the next logical block.
    pub fn next_content(&mut self) -> anyhow::Result<BlockContent> {
        let blk_no = self.blk_no;
        self.blk_no += 1;

        let Some(ubi) = self.ubi.clone() else {
            let payload = self.read_payload(self.geometry.eraseblock_size as usize)?;
            return Ok(BlockContent::Raw(payload));
        };

        if blk_no < UBI_LAYOUT_VOLUME_EBS {
            let mut vtbl = VolumeTable::new();
            vtbl.set(
                ubi.vol_id,
                VolTableRecord::new(VolType::Dynamic, &ubi.name, ubi.lebs)?,
            );
            Ok(BlockContent::LayoutLeb { lnum: blk_no, vtbl })
        } else if blk_no - UBI_LAYOUT_VOLUME_EBS < ubi.lebs {
            let payload = self.read_payload(self.leb_size())?;
            Ok(BlockContent::DataLeb {
                vol_id: ubi.vol_id,
                lnum: blk_no - UBI_LAYOUT_VOLUME_EBS,
                payload,
            })
        } else {
            Ok(BlockContent::SpareLeb)
        }
    }

    /// Render a content decision into the bytes to program.
    pub fn encode(&mut self, content: BlockContent) -> anyhow::Result<Vec<u8>> {
        match content {
            BlockContent::Raw(payload) => Ok(payload),
            content => {
                let image_seq = self.image_seq();
                encode_block(&self.geometry, image_seq, content)
            }
        }
    }

    /// Pull up to `want` payload bytes from the input.
    ///
    /// A bounded input that ends early is an error; an unbounded stream
    /// simply runs dry.
    fn read_payload(&mut self, want: usize) -> anyhow::Result<Vec<u8>> {
        let want = match self.remaining {
            Some(left) => std::cmp::min(left, want as u64) as usize,
            None => want,
        };

        let mut payload = Vec::with_capacity(want);
        let Some(reader) = self.reader.as_mut() else {
            return Ok(payload);
        };
        if want == 0 {
            return Ok(payload);
        }

        reader
            .read_to_vec(&mut payload, want)
            .context("failed to read input data")?;

        match &mut self.remaining {
            Some(left) => {
                ensure!(payload.len() == want, "unexpected end of input data");
                *left -= payload.len() as u64;
            }
            None => {
                if payload.is_empty() {
                    // Stream is dry; stop asking.
                    self.remaining = Some(0);
                }
            }
        }

        Ok(payload)
    }
}

/// Render one UBI block's content into the bytes to program.
///
/// Only the meaningful prefix is returned; the rest of the eraseblock stays
/// in its erased state.
pub fn encode_block(
    geometry: &FlashGeometry,
    image_seq: u32,
    content: BlockContent,
) -> anyhow::Result<Vec<u8>> {
    let vid_ofs = geometry.min_io_size as usize;
    let data_ofs = vid_ofs * 2;

    let ec = Ec {
        ec: 0,
        vid_hdr_offset: geometry.min_io_size,
        data_offset: 2 * geometry.min_io_size,
        image_seq,
    };

    let (vid, data) = match content {
        BlockContent::Raw(payload) => return Ok(payload),

        BlockContent::SpareLeb => {
            let mut bytes = vec![FILL_PATTERN; UBI_EC_HDR_SIZE];
            ec.encode(&mut bytes)?;
            return Ok(bytes);
        }

        BlockContent::LayoutLeb { lnum, vtbl } => {
            let vid = Vid {
                vol_type: VolType::Dynamic,
                compat: UBI_LAYOUT_VOLUME_COMPAT,
                vol_id: UBI_LAYOUT_VOLUME_ID,
                lnum,
                ..Default::default()
            };
            (vid, vtbl.encode())
        }

        BlockContent::DataLeb {
            vol_id,
            lnum,
            payload,
        } => {
            let vid = Vid {
                vol_type: VolType::Dynamic,
                vol_id,
                lnum,
                ..Default::default()
            };
            (vid, payload)
        }
    };

    ensure!(
        data_ofs + data.len() <= geometry.eraseblock_size as usize,
        "LEB payload does not fit in an eraseblock"
    );

    let mut bytes = vec![FILL_PATTERN; data_ofs + data.len()];
    ec.encode(&mut bytes)?;
    vid.encode(&mut bytes[vid_ofs..])?;
    bytes[data_ofs..].copy_from_slice(&data);

    Ok(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    const TEST_GEOMETRY: FlashGeometry = FlashGeometry {
        eraseblock_size: 8 * 4096,
        min_io_size: 4096,
        total_size: 16 * 8 * 4096,
    };

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_raw_blocks() -> anyhow::Result<()> {
        let eb = TEST_GEOMETRY.eraseblock_size as usize;
        let data = pattern(eb * 2 + eb / 2);

        let mut cursor = &data[..];
        let input = InputSpec::Sized {
            reader: &mut cursor,
            size: data.len() as u64,
        };
        let mut generator = BlockGenerator::new(TEST_GEOMETRY, None, input);

        assert_eq!(generator.next_content()?, BlockContent::Raw(data[..eb].to_vec()));
        assert_eq!(
            generator.next_content()?,
            BlockContent::Raw(data[eb..2 * eb].to_vec())
        );
        assert_eq!(
            generator.next_content()?,
            BlockContent::Raw(data[2 * eb..].to_vec())
        );
        assert_eq!(generator.next_content()?, BlockContent::Raw(vec![]));
        assert_eq!(generator.remaining(), Some(0));

        Ok(())
    }

    #[test]
    fn test_ubi_block_sequence() -> anyhow::Result<()> {
        let leb = TEST_GEOMETRY.eraseblock_size as usize
            - 2 * TEST_GEOMETRY.min_io_size as usize;
        let data = pattern(leb + leb / 2);

        let mut cursor = &data[..];
        let input = InputSpec::Sized {
            reader: &mut cursor,
            size: data.len() as u64,
        };
        let ubi = UbiLayout {
            vol_id: 0,
            name: "rootfs".to_string(),
            lebs: 3,
        };
        let mut generator = BlockGenerator::new(TEST_GEOMETRY, Some(ubi), input);

        for lnum in 0..2 {
            match generator.next_content()? {
                BlockContent::LayoutLeb { lnum: l, vtbl } => {
                    assert_eq!(l, lnum);
                    let record = vtbl.get(0).unwrap();
                    assert_eq!(record.name, "rootfs");
                    assert_eq!(record.reserved_pebs, 3);
                    assert!(vtbl.get(1).is_none());
                }
                other => panic!("expected layout LEB, got {other:?}"),
            }
        }

        assert_eq!(
            generator.next_content()?,
            BlockContent::DataLeb {
                vol_id: 0,
                lnum: 0,
                payload: data[..leb].to_vec()
            }
        );
        assert_eq!(
            generator.next_content()?,
            BlockContent::DataLeb {
                vol_id: 0,
                lnum: 1,
                payload: data[leb..].to_vec()
            }
        );

        // Volume has 3 LEBs but the input is dry: the last one is mapped
        // empty, and everything past the volume is a bare EC placeholder.
        assert_eq!(
            generator.next_content()?,
            BlockContent::DataLeb {
                vol_id: 0,
                lnum: 2,
                payload: vec![]
            }
        );
        assert_eq!(generator.next_content()?, BlockContent::SpareLeb);
        assert_eq!(generator.next_content()?, BlockContent::SpareLeb);

        Ok(())
    }

    #[test]
    fn test_sized_input_ending_early_is_an_error() {
        // Claims 1 MiB but only delivers 100 bytes.
        let data = pattern(100);
        let mut cursor = &data[..];
        let input = InputSpec::Sized {
            reader: &mut cursor,
            size: 1 << 20,
        };
        let mut generator = BlockGenerator::new(TEST_GEOMETRY, None, input);

        assert!(generator.next_content().is_err());
    }

    #[test]
    fn test_streaming_input_may_end_early() -> anyhow::Result<()> {
        let data = pattern(100);
        let mut cursor = &data[..];
        let input = InputSpec::Streaming {
            reader: &mut cursor,
        };
        let mut generator = BlockGenerator::new(TEST_GEOMETRY, None, input);

        assert_eq!(generator.next_content()?, BlockContent::Raw(data.clone()));
        assert_eq!(generator.next_content()?, BlockContent::Raw(vec![]));
        assert_eq!(generator.remaining(), Some(0));

        Ok(())
    }

    #[test]
    fn test_encode_block_offsets() -> anyhow::Result<()> {
        let vid_ofs = TEST_GEOMETRY.min_io_size as usize;
        let data_ofs = vid_ofs * 2;

        let mut vtbl = VolumeTable::new();
        vtbl.set(7, VolTableRecord::new(VolType::Dynamic, "v", 4).unwrap());
        let bytes = encode_block(
            &TEST_GEOMETRY,
            0xC0FFEE,
            BlockContent::LayoutLeb { lnum: 1, vtbl },
        )?;
        assert_eq!(bytes.len(), data_ofs + VolumeTable::BYTES);

        let ec = Ec::decode(&bytes)?.unwrap();
        assert_eq!(ec.image_seq, 0xC0FFEE);
        assert_eq!(ec.vid_hdr_offset, TEST_GEOMETRY.min_io_size);
        assert_eq!(ec.data_offset, 2 * TEST_GEOMETRY.min_io_size);

        let vid = Vid::decode(&bytes[vid_ofs..])?.unwrap();
        assert_eq!(vid.vol_id, UBI_LAYOUT_VOLUME_ID);
        assert_eq!(vid.compat, UBI_LAYOUT_VOLUME_COMPAT);
        assert_eq!(vid.lnum, 1);

        let record = VolTableRecord::decode(&bytes[data_ofs..])?;
        assert!(record.is_empty());

        // The gap between the headers stays erased.
        assert!(bytes[crate::ubi::headers::UBI_EC_HDR_SIZE..vid_ofs]
            .iter()
            .all(|&b| b == FILL_PATTERN));

        let spare = encode_block(&TEST_GEOMETRY, 1, BlockContent::SpareLeb)?;
        assert_eq!(spare.len(), UBI_EC_HDR_SIZE);
        assert!(Ec::decode(&spare)?.is_some());

        Ok(())
    }

    #[test]
    fn test_image_seq_constant_and_nonzero() -> anyhow::Result<()> {
        let input = InputSpec::None;
        let ubi = UbiLayout {
            vol_id: 0,
            name: "v".to_string(),
            lebs: 1,
        };
        let mut generator = BlockGenerator::new(TEST_GEOMETRY, Some(ubi), input);

        let mut seqs = Vec::new();
        for _ in 0..4 {
            let content = generator.next_content()?;
            let bytes = generator.encode(content)?;
            seqs.push(Ec::decode(&bytes)?.unwrap().image_seq);
        }

        assert_ne!(seqs[0], 0);
        assert!(seqs.iter().all(|&s| s == seqs[0]));

        Ok(())
    }
}
