//! The eraseblock write protocol.
//!
//! One block at a time: split the payload into pages, skip programming pages
//! that hold nothing but the erased fill pattern, attach the JFFS2 clean
//! marker (when requested) to the out-of-band area of the first page only,
//! and recover from page-program failures by erasing the block (marking it
//! bad if even the very first page failed).

use crate::nand::{Nand, NandBlock, PageUtil, FILL_PATTERN};

/// The JFFS2 clean marker: an empty node of type "clean marker", attached as
/// out-of-band data to the first page of each written block.
pub const CLEAN_MARKER: [u8; 8] = [0x19, 0x85, 0x20, 0x03, 0x00, 0x00, 0x00, 0x08];

/// Outcome of trying to place one block's content at one physical address.
#[derive(Debug, Eq, PartialEq)]
pub enum Attempt {
    /// The content is on flash.
    Written,

    /// This physical block was bad or failed; retry the same content at
    /// `next`.
    Retry { next: u32 },
}

/// Outcome of driving the page-program protocol on one block.
#[derive(Debug, Eq, PartialEq)]
enum BlockStatus {
    Written,
    Failed { page: u32 },
}

/// Try to place `payload` at physical block `index`.
///
/// Blocks already marked bad, and blocks that fail while being programmed,
/// report [`Attempt::Retry`] with the next candidate address; the caller
/// decides when the range is exhausted. Input consumption must only advance
/// on [`Attempt::Written`].
pub fn attempt<N: Nand>(
    nand: &mut N,
    index: u32,
    payload: &[u8],
    clean_marker: Option<&[u8]>,
) -> anyhow::Result<Attempt> {
    let Some(block) = nand.block(index)? else {
        return Ok(Attempt::Retry { next: index + 1 });
    };

    match write_block(block, payload, clean_marker)? {
        BlockStatus::Written => Ok(Attempt::Written),
        BlockStatus::Failed { .. } => Ok(Attempt::Retry { next: index + 1 }),
    }
}

/// Program one (not-bad) block with `payload`, page by page.
///
/// A zero-length payload with no clean marker requested is a no-op success.
fn write_block<B: NandBlock>(
    mut block: B,
    payload: &[u8],
    clean_marker: Option<&[u8]>,
) -> anyhow::Result<BlockStatus> {
    if payload.is_empty() && clean_marker.is_none() {
        return Ok(BlockStatus::Written);
    }

    let page_size = block.page_size();
    let mut marker = clean_marker;
    let mut page_buf = Vec::new();

    let mut page: u32 = 0;
    let mut chunks = payload.chunks(page_size);
    loop {
        let chunk = chunks.next();
        if chunk.is_none() && marker.is_none() {
            break;
        }

        // Pad a final partial chunk out to a full page.
        let main = match chunk {
            Some(c) if c.len() < page_size => {
                page_buf.clear();
                page_buf.extend_from_slice(c);
                page_buf.resize(page_size, FILL_PATTERN);
                Some(&page_buf[..])
            }
            Some(c) => Some(c),
            None => None,
        };

        // Programming an erased page would change nothing; skip its main
        // area. The clean marker may still have to land in its OOB area.
        let main = main.filter(|c| !c.is_erased());

        if (main.is_some() || marker.is_some())
            && block.program(page, main, marker).is_err()
        {
            // Leave the block erased for reuse. A failure on the very first
            // page means the block cannot even begin to hold data: mark it
            // bad so it is never selected again.
            let _ = block.erase();
            if page == 0 {
                block.mark_bad()?;
            }
            return Ok(BlockStatus::Failed { page });
        }

        marker = None; // Clean marker on first page only
        page += 1;

        if chunk.is_none() {
            break;
        }
    }

    Ok(BlockStatus::Written)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{FlashGeometry, SimBlock, SimNand};

    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    const TEST_GEOMETRY: FlashGeometry = FlashGeometry {
        eraseblock_size: 8 * 128,
        min_io_size: 128,
        total_size: 4 * 8 * 128,
    };

    /// Bookkeeping shared between a [`FlakyNand`] and its blocks: which
    /// (block, page) programs to fail, and which actually ran.
    #[derive(Default)]
    struct Flaws {
        fail_once: HashSet<(u32, u32)>,
        programs: Vec<(u32, u32)>,
    }

    /// A SimNand wrapper that injects page-program failures.
    struct FlakyNand {
        sim: SimNand,
        flaws: Rc<RefCell<Flaws>>,
    }

    struct FlakyBlock<'a> {
        inner: &'a mut SimBlock,
        index: u32,
        flaws: Rc<RefCell<Flaws>>,
    }

    impl FlakyNand {
        fn new(geometry: FlashGeometry) -> Self {
            Self {
                sim: SimNand::new(geometry),
                flaws: Default::default(),
            }
        }

        fn fail_at(&self, block: u32, page: u32) {
            self.flaws.borrow_mut().fail_once.insert((block, page));
        }

        fn programs(&self) -> Vec<(u32, u32)> {
            self.flaws.borrow().programs.clone()
        }
    }

    impl Nand for FlakyNand {
        type Block<'a> = FlakyBlock<'a>;

        fn block(&mut self, index: u32) -> anyhow::Result<Option<FlakyBlock<'_>>> {
            let flaws = self.flaws.clone();
            Ok(self.sim.block(index)?.map(|inner| FlakyBlock {
                inner,
                index,
                flaws,
            }))
        }

        fn geometry(&self) -> FlashGeometry {
            self.sim.geometry()
        }
    }

    impl NandBlock for FlakyBlock<'_> {
        fn page_count(&self) -> u32 {
            self.inner.page_count()
        }
        fn page_size(&self) -> usize {
            self.inner.page_size()
        }
        fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
            self.inner.read(start_page, content)
        }

        fn program(
            &mut self,
            page: u32,
            main: Option<&[u8]>,
            oob: Option<&[u8]>,
        ) -> anyhow::Result<()> {
            let mut flaws = self.flaws.borrow_mut();
            if flaws.fail_once.remove(&(self.index, page)) {
                anyhow::bail!("injected program failure");
            }
            flaws.programs.push((self.index, page));
            drop(flaws);

            self.inner.program(page, main, oob)
        }

        fn erase(&mut self) -> anyhow::Result<()> {
            self.inner.erase()
        }
        fn mark_bad(self) -> anyhow::Result<()> {
            self.inner.mark_bad()
        }
    }

    /// Payload with pages 0 and 3 non-blank and pages 1-2 erased.
    fn gappy_payload(page_size: usize) -> Vec<u8> {
        let mut payload = vec![FILL_PATTERN; page_size * 4];
        payload[..page_size].fill(0x11);
        payload[page_size * 3..].fill(0x33);
        payload
    }

    #[test]
    fn test_blank_pages_skipped() -> anyhow::Result<()> {
        let mut nand = FlakyNand::new(TEST_GEOMETRY);
        let payload = gappy_payload(TEST_GEOMETRY.min_io_size as usize);

        assert_eq!(attempt(&mut nand, 0, &payload, None)?, Attempt::Written);
        assert_eq!(nand.programs(), [(0, 0), (0, 3)]);

        Ok(())
    }

    #[test]
    fn test_clean_marker_on_first_page_only() -> anyhow::Result<()> {
        let page_size = TEST_GEOMETRY.min_io_size as usize;

        let mut nand = FlakyNand::new(TEST_GEOMETRY);
        let payload = vec![0x22u8; page_size * 3];
        assert_eq!(
            attempt(&mut nand, 0, &payload, Some(&CLEAN_MARKER))?,
            Attempt::Written
        );
        assert_eq!(nand.sim.page_oob(0, 0), Some(&CLEAN_MARKER[..]));
        assert_eq!(nand.sim.page_oob(0, 1), None);
        assert_eq!(nand.sim.page_oob(0, 2), None);

        // A blank first page still receives the marker, in OOB only.
        let mut payload = vec![FILL_PATTERN; page_size * 2];
        payload[page_size..].fill(0x44);
        assert_eq!(
            attempt(&mut nand, 1, &payload, Some(&CLEAN_MARKER))?,
            Attempt::Written
        );
        assert_eq!(nand.sim.page_oob(1, 0), Some(&CLEAN_MARKER[..]));
        assert_eq!(nand.programs(), [(0, 0), (0, 1), (0, 2), (1, 0), (1, 1)]);

        // A zero-length payload with a marker is marker-only...
        assert_eq!(
            attempt(&mut nand, 2, &[], Some(&CLEAN_MARKER))?,
            Attempt::Written
        );
        assert_eq!(nand.sim.page_oob(2, 0), Some(&CLEAN_MARKER[..]));

        // ...and without one, a no-op.
        assert_eq!(attempt(&mut nand, 3, &[], None)?, Attempt::Written);
        assert_eq!(nand.programs().len(), 6);

        Ok(())
    }

    #[test]
    fn test_first_page_failure_marks_bad() -> anyhow::Result<()> {
        let mut nand = FlakyNand::new(TEST_GEOMETRY);
        nand.fail_at(0, 0);

        let payload = vec![0x55u8; TEST_GEOMETRY.min_io_size as usize];
        assert_eq!(
            attempt(&mut nand, 0, &payload, None)?,
            Attempt::Retry { next: 1 }
        );

        // Block 0 is now bad; a further attempt at it retries immediately.
        assert!(nand.sim.block(0)?.is_none());
        assert_eq!(
            attempt(&mut nand, 0, &payload, None)?,
            Attempt::Retry { next: 1 }
        );

        // The same content goes cleanly at the next address.
        assert_eq!(attempt(&mut nand, 1, &payload, None)?, Attempt::Written);

        Ok(())
    }

    #[test]
    fn test_later_page_failure_leaves_block_reusable() -> anyhow::Result<()> {
        let mut nand = FlakyNand::new(TEST_GEOMETRY);
        nand.fail_at(0, 2);

        let payload = vec![0x66u8; TEST_GEOMETRY.min_io_size as usize * 3];
        assert_eq!(
            attempt(&mut nand, 0, &payload, None)?,
            Attempt::Retry { next: 1 }
        );

        // Not marked bad, and erased back to a writable state.
        let block = nand.sim.block(0)?.expect("block should still be good");
        let mut readback = vec![0u8; TEST_GEOMETRY.min_io_size as usize];
        block.read(0, &mut readback)?;
        assert!(readback.is_erased());

        assert_eq!(attempt(&mut nand, 0, &payload, None)?, Attempt::Written);

        Ok(())
    }
}
