//! Abstractions and code to access NAND flash.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::ensure;

#[cfg(target_os = "linux")]
pub mod mtd;

/// The byte value an erased, unwritten NAND cell reads as.
pub const FILL_PATTERN: u8 = 0xFF;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this buffer contain only the all-1s erase pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == FILL_PATTERN)
    }
}

/// The data layout of a NAND flash device, read once per run.
///
/// All offsets used by this crate are multiples of `min_io_size` within an
/// eraseblock and multiples of `eraseblock_size` across the device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FlashGeometry {
    /// Size of one physical eraseblock, in bytes.
    pub eraseblock_size: u32,

    /// The smallest programmable unit (the page size), in bytes.
    pub min_io_size: u32,

    /// Total size of the device, in bytes.
    pub total_size: u64,
}

impl FlashGeometry {
    /// Number of eraseblocks on the device.
    pub fn block_count(&self) -> u32 {
        (self.total_size / u64::from(self.eraseblock_size)) as u32
    }

    /// Number of pages in one eraseblock.
    pub fn pages_per_block(&self) -> u32 {
        self.eraseblock_size / self.min_io_size
    }

    /// Byte address of the first page of eraseblock `index`.
    pub fn block_addr(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.eraseblock_size)
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for FlashGeometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks: u32 = blocks.parse()?;
        let pages_per_block: u32 = pages_per_block.parse()?;
        let bytes_per_page: u32 = bytes_per_page.parse()?;

        ensure!(
            pages_per_block > 0 && bytes_per_page > 0,
            "geometry dimensions must be nonzero"
        );

        let eraseblock_size = pages_per_block
            .checked_mul(bytes_per_page)
            .ok_or(anyhow::anyhow!("eraseblock size overflows"))?;
        Ok(FlashGeometry {
            eraseblock_size,
            min_io_size: bytes_per_page,
            total_size: u64::from(blocks) * u64::from(eraseblock_size),
        })
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the geometry of the device
    fn geometry(&self) -> FlashGeometry;
}

/// Represents one eraseblock of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// Program a single page.
    ///
    /// `main` is the page's main-area content (None leaves the main area
    /// untouched); `oob` is out-of-band data placed per the driver's
    /// automatic OOB layout.
    ///
    /// Pages must be programmed in increasing order: programming a page makes
    /// it and all skipped pages nonwritable until the next erase. This is to
    /// comply with the sequential-write requirements of certain MLC NANDs.
    fn program(&mut self, page: u32, main: Option<&[u8]>, oob: Option<&[u8]>)
        -> anyhow::Result<()>;

    /// Erase the block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be
    /// retrieved again).
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// A simulated in-memory NAND flash, for testing and for operating on image
/// files instead of real hardware.
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    geometry: FlashGeometry,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// Out-of-band data, per page
    oob: BTreeMap<u32, Vec<u8>>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,
}

impl SimNand {
    /// Create an empty SimNand with the specified geometry
    pub fn new(geometry: FlashGeometry) -> Self {
        let blocks = vec![SimBlock::new(geometry); geometry.block_count() as usize];
        let blocks = blocks.into_boxed_slice();

        Self { blocks, geometry }
    }

    /// Initialize the NAND contents with content read from a type
    /// implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let page_size = self.geometry.min_io_size as usize;
        let mut buf = vec![0; page_size];

        for block in self.blocks.iter_mut() {
            block.marked_bad = false;
            block.data.clear();
            block.oob.clear();
            for page in 0..block.page_count {
                read.read_exact(&mut buf)?;
                block.write_page(page, &buf)?;
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream
    /// (such as a File)
    pub fn save<W: Write>(&mut self, write: &mut W) -> anyhow::Result<()> {
        let size = self.geometry.eraseblock_size as usize;
        let mut buf = vec![0; size];

        for index in 0..self.geometry.block_count() {
            match self.block(index)? {
                None => buf.fill(0xBD),
                Some(block) => block.read(0, &mut buf)?,
            };

            write.write_all(&buf)?;
        }

        Ok(())
    }

    /// Peek at the out-of-band data a page was programmed with.
    pub fn page_oob(&self, block: u32, page: u32) -> Option<&[u8]> {
        self.blocks
            .get(block as usize)?
            .oob
            .get(&page)
            .map(|x| &x[..])
    }
}

impl SimBlock {
    /// Construct an empty block within the given geometry
    fn new(geometry: FlashGeometry) -> Self {
        Self {
            data: Default::default(),
            oob: Default::default(),
            page_count: geometry.pages_per_block(),
            page_size: geometry.min_io_size as usize,
            marked_bad: false,
        }
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;

        ensure!(begin >= self.data.len(), "write in already-written area");

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, FILL_PATTERN);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;
        let end = begin + self.page_size;

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(FILL_PATTERN);
        }

        Ok(())
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
            .map(|x| Some(x).filter(|y| !y.marked_bad))
    }

    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }
}

impl NandBlock for &mut SimBlock {
    fn page_count(&self) -> u32 {
        self.page_count
    }
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks_mut(self.page_size()) {
            self.read_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    fn program(
        &mut self,
        page: u32,
        main: Option<&[u8]>,
        oob: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        ensure!(page < self.page_count, "page index out of bounds");

        if let Some(main) = main {
            self.write_page(page, main)?;
        }

        if let Some(oob) = oob {
            ensure!(
                self.oob.insert(page, oob.to_vec()).is_none(),
                "OOB area already written"
            );
        }

        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        self.data.clear();
        self.oob.clear();

        Ok(())
    }

    fn mark_bad(mut self) -> anyhow::Result<()> {
        self.erase()?;
        self.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_GEOMETRY: FlashGeometry = FlashGeometry {
    eraseblock_size: 16 * 256,
    min_io_size: 256,
    total_size: 8 * 16 * 256,
};

#[test]
fn test_geometry_parse() {
    let geometry: FlashGeometry = "8x16x256".parse().unwrap();
    assert_eq!(geometry, TEST_GEOMETRY);
    assert_eq!(geometry.block_count(), 8);
    assert_eq!(geometry.pages_per_block(), 16);
    assert_eq!(geometry.block_addr(3), 3 * 16 * 256);

    assert!("8x16".parse::<FlashGeometry>().is_err());
    assert!("8x16x0".parse::<FlashGeometry>().is_err());
}

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_GEOMETRY.block_count() - 1).unwrap().is_some());
    assert!(nand.block(TEST_GEOMETRY.block_count()).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    assert!(nand.block(0).unwrap().is_some());
    nand.block(0).unwrap().unwrap().mark_bad().unwrap();
    assert!(nand.block(0).unwrap().is_none());
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_GEOMETRY);

    let data_in = vec![0xA5u8; nand.geometry().min_io_size as usize];
    let mut data_out = data_in.clone();

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(2, Some(&data_in), None).unwrap();
    assert!(block.program(1, Some(&data_in), None).is_err());

    block.read(1, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    block.read(2, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    block.read(3, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_oob() {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    let marker = [0x19, 0x85];

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(0, None, Some(&marker)).unwrap();
    assert!(block.program(0, None, Some(&marker)).is_err());

    // An OOB-only program leaves the main area writable from page 0.
    let data = vec![0x5Au8; nand.geometry().min_io_size as usize];
    let mut block = nand.block(0).unwrap().unwrap();
    block.program(0, Some(&data), None).unwrap();

    assert_eq!(nand.page_oob(0, 0), Some(&marker[..]));
    assert_eq!(nand.page_oob(0, 1), None);

    nand.block(0).unwrap().unwrap().erase().unwrap();
    assert_eq!(nand.page_oob(0, 0), None);
}

#[test]
fn test_sim_load() {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    nand.load(&mut std::io::repeat(0x55u8)).unwrap();

    let mut buf = vec![0u8; nand.geometry().eraseblock_size as usize];

    let block = nand.block(0).unwrap().unwrap();
    block.read(0, &mut buf).unwrap();

    assert!(buf.iter().all(|&x| x == 0x55u8));
}
