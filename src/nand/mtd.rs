//! NAND abstraction layer implementation over the Linux MTD subsystem

use super::{FlashGeometry, Nand, NandBlock};

use anyhow::{bail, ensure};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    geometry: FlashGeometry,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let geometry = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, geometry })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                let mtd_dev = line.split(':').next().unwrap();
                return Self::open(Path::new("/dev").join(mtd_dev));
            }
        }

        bail!("MTD device {name} could not be found");
    }
}

impl Nand for MtdNand {
    type Block<'a> = MtdBlock<'a>;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<MtdBlock<'_>>> {
        ensure!(index < self.geometry.block_count(), "block {index} out of range");

        let block_base = self.geometry.block_addr(index);
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base)? };
        if bad == 0 {
            Ok(Some(MtdBlock { nand: self, index }))
        } else {
            Ok(None)
        }
    }

    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }
}

pub struct MtdBlock<'a> {
    nand: &'a MtdNand,
    index: u32,
}

impl MtdBlock<'_> {
    /// Compute the offset of the first byte of this block
    fn base(&self) -> u64 {
        self.nand.geometry.block_addr(self.index)
    }

    /// Ensure that the byte count and starting page range is valid, and
    /// compute the /dev/mtdX offset for the page
    fn offset_for(&self, start_page: u32, bytes: usize) -> anyhow::Result<u64> {
        ensure!(
            bytes % self.page_size() == 0,
            "buffer not multiple of page size"
        );

        let end_page = start_page + (bytes / self.page_size()) as u32;
        ensure!(
            end_page <= self.page_count(),
            "block {0}, page range {start_page}..{end_page} out of bounds",
            self.index
        );

        Ok(self.base() + u64::from(self.nand.geometry.min_io_size) * u64::from(start_page))
    }
}

impl NandBlock for MtdBlock<'_> {
    fn page_count(&self) -> u32 {
        self.nand.geometry.pages_per_block()
    }
    fn page_size(&self) -> usize {
        self.nand.geometry.min_io_size as usize
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(start_page, content.len())?;
        Ok(self.nand.file.read_exact_at(content, offset)?)
    }

    fn program(
        &mut self,
        page: u32,
        main: Option<&[u8]>,
        oob: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        let offset = self.offset_for(page, main.map_or(0, <[u8]>::len))?;

        match (main, oob) {
            (None, None) => Ok(()),

            // Main area only: an ordinary pwrite suffices.
            (Some(main), None) => Ok(self.nand.file.write_all_at(main, offset)?),

            // OOB data rides along via the MEMWRITE ioctl, letting the
            // driver place it per its automatic OOB layout.
            (main, Some(oob)) => {
                let mut req = ioctl::mtd_write_req {
                    start: offset,
                    len: main.map_or(0, <[u8]>::len) as u64,
                    ooblen: oob.len() as u64,
                    usr_data: main.map_or(0, |x| x.as_ptr() as u64),
                    usr_oob: oob.as_ptr() as u64,
                    mode: ioctl::MTD_OPS_AUTO_OOB,
                    padding: [0; 7],
                };
                unsafe {
                    ioctl::memwrite(self.nand.file.as_raw_fd(), &mut req)?;
                }
                Ok(())
            }
        }
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        let erase_info = ioctl::erase_info_user {
            start: self.base() as u32,
            length: self.nand.geometry.eraseblock_size,
        };
        unsafe {
            ioctl::memerase(self.nand.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }

    fn mark_bad(self) -> anyhow::Result<()> {
        let block_base = self.base();
        unsafe {
            ioctl::memsetbadblock(self.nand.file.as_raw_fd(), &block_base)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::FlashGeometry;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    /// Have the driver place OOB data automatically, skipping reserved areas
    pub const MTD_OPS_AUTO_OOB: u8 = 1;

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<FlashGeometry> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(mut self) -> anyhow::Result<FlashGeometry> {
            if self.writesize == 1 {
                // Hack for debugging on mtdram devices
                self.writesize = 64;
            }

            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            Ok(FlashGeometry {
                eraseblock_size: self.erasesize,
                min_io_size: self.writesize,
                total_size: u64::from(self.size),
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    #[repr(C)]
    pub struct mtd_write_req {
        pub start: u64,
        pub len: u64,
        pub ooblen: u64,
        pub usr_data: u64,
        pub usr_oob: u64,
        pub mode: u8,
        pub padding: [u8; 7],
    }
    ioctl_readwrite!(memwrite, MTD_IOC_MAGIC, 24, mtd_write_req);
}
