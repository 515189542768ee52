//! Payload compression and codec arbitration.
//!
//! Payload blocks destined for an image may be compressed by one of several
//! backends. This module owns the choice: under the favor-LZO policy the
//! fast codec and DEFLATE both run and the winner is picked by size (with a
//! configurable tolerance in the fast codec's favor); otherwise exactly the
//! requested codec runs. Whenever compression fails, or fails to actually
//! shrink the data, the buffer is stored verbatim instead: a codec problem
//! degrades the image's density, never the run.

use std::io::Write;

use flate2::write::DeflateEncoder;
use flate2::Compression as DeflateLevel;

/// Buffers shorter than this are always stored verbatim.
pub const MIN_COMPR_LEN: usize = 128;

/// How a buffer ended up encoded.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Codec {
    /// Stored verbatim.
    None,

    /// The fast codec.
    Lzo,

    /// Raw DEFLATE.
    Zlib,

    /// The high-ratio LZMA-family codec; reachable only as an explicitly
    /// requested codec.
    Lzma,
}

/// A single compression codec implementation.
pub trait CompressBackend {
    fn compress(&mut self, buf: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Raw-DEFLATE backend, matching the stream format the Linux kernel's
/// crypto API produces (no zlib wrapper).
pub struct Deflate {
    level: DeflateLevel,
}

impl Default for Deflate {
    fn default() -> Self {
        Self {
            level: DeflateLevel::default(),
        }
    }
}

impl CompressBackend for Deflate {
    fn compress(&mut self, buf: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(buf.len()), self.level);
        encoder.write_all(buf)?;
        Ok(encoder.finish()?)
    }
}

/// Codec selection context for one run: the installed backends, the
/// arbitration policy, and the failure tally.
///
/// DEFLATE is built in; LZO and LZMA backends are supplied by the caller. A
/// requested codec with no backend installed silently degrades to verbatim
/// storage, mirroring a build with that codec compiled out.
pub struct Compression {
    lzo: Option<Box<dyn CompressBackend>>,
    zlib: Option<Box<dyn CompressBackend>>,
    lzma: Option<Box<dyn CompressBackend>>,
    favor_lzo: bool,
    favor_percent: u32,
    errors: u64,
}

impl Default for Compression {
    fn default() -> Self {
        Self::new()
    }
}

impl Compression {
    /// Create a context with only the built-in DEFLATE backend installed.
    pub fn new() -> Self {
        Self {
            lzo: None,
            zlib: Some(Box::<Deflate>::default()),
            lzma: None,
            favor_lzo: false,
            favor_percent: 20,
            errors: 0,
        }
    }

    /// Install an LZO backend.
    pub fn lzo(mut self, backend: Box<dyn CompressBackend>) -> Self {
        self.lzo = Some(backend);
        self
    }

    /// Replace the DEFLATE backend.
    pub fn zlib(mut self, backend: Box<dyn CompressBackend>) -> Self {
        self.zlib = Some(backend);
        self
    }

    /// Install an LZMA-family backend.
    pub fn lzma(mut self, backend: Box<dyn CompressBackend>) -> Self {
        self.lzma = Some(backend);
        self
    }

    /// Always run both LZO and DEFLATE, keeping LZO's result as long as it
    /// is within `percent` percent of DEFLATE's size.
    pub fn favor_lzo(mut self, percent: u32) -> Self {
        self.favor_lzo = true;
        self.favor_percent = percent;
        self
    }

    /// Number of backend failures seen so far. Reported once at shutdown by
    /// the consumer; failures themselves are never fatal.
    pub fn error_count(&self) -> u64 {
        self.errors
    }

    /// Run one backend, counting a failure. An absent backend is not a
    /// failure, just a non-result.
    fn run(&mut self, codec: Codec, buf: &[u8]) -> Option<Vec<u8>> {
        let backend = match codec {
            Codec::None => None,
            Codec::Lzo => self.lzo.as_mut(),
            Codec::Zlib => self.zlib.as_mut(),
            Codec::Lzma => self.lzma.as_mut(),
        }?;

        match backend.compress(buf) {
            Ok(out) => Some(out),
            Err(_) => {
                self.errors += 1;
                None
            }
        }
    }

    /// Run both candidate codecs and pick by size.
    fn favor_lzo_compress(&mut self, buf: &[u8]) -> Option<(Vec<u8>, Codec)> {
        let lzo = self.run(Codec::Lzo, buf);
        let zlib = self.run(Codec::Zlib, buf);

        match (lzo, zlib) {
            (None, None) => None,
            (Some(out), None) => Some((out, Codec::Lzo)),
            (None, Some(out)) => Some((out, Codec::Zlib)),
            (Some(lzo), Some(zlib)) => {
                if lzo.len() <= zlib.len() {
                    return Some((lzo, Codec::Lzo));
                }

                let percent = zlib.len() as f64 / lzo.len() as f64 * 100.0;
                if percent > f64::from(100u32.saturating_sub(self.favor_percent)) {
                    Some((lzo, Codec::Lzo))
                } else {
                    Some((zlib, Codec::Zlib))
                }
            }
        }
    }

    /// Compress `buf` under the configured policy.
    ///
    /// Returns the encoded bytes and the codec that produced them. The
    /// result is never larger than the input: if no codec produces a
    /// strictly smaller output, the input comes back verbatim as
    /// [`Codec::None`].
    pub fn compress(&mut self, buf: &[u8], requested: Codec) -> (Vec<u8>, Codec) {
        if buf.len() < MIN_COMPR_LEN {
            return (buf.to_vec(), Codec::None);
        }

        let candidate = if self.favor_lzo {
            self.favor_lzo_compress(buf)
        } else {
            self.run(requested, buf).map(|out| (out, requested))
        };

        match candidate {
            Some((out, codec)) if out.len() < buf.len() => (out, codec),
            _ => (buf.to_vec(), Codec::None),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A backend that always "compresses" to a fixed number of bytes.
    struct Fixed(usize);

    impl CompressBackend for Fixed {
        fn compress(&mut self, _: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(vec![0xCC; self.0])
        }
    }

    /// A backend that always fails.
    struct Broken;

    impl CompressBackend for Broken {
        fn compress(&mut self, _: &[u8]) -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("backend is broken")
        }
    }

    fn input(len: usize) -> Vec<u8> {
        vec![0x41; len]
    }

    #[test]
    fn test_deflate_round_trip() -> anyhow::Result<()> {
        use std::io::Read;

        let data = input(4096);
        let mut compression = Compression::new();

        let (out, codec) = compression.compress(&data, Codec::Zlib);
        assert_eq!(codec, Codec::Zlib);
        assert!(out.len() < data.len());

        let mut decoded = Vec::new();
        flate2::read::DeflateDecoder::new(&out[..]).read_to_end(&mut decoded)?;
        assert_eq!(decoded, data);

        Ok(())
    }

    #[test]
    fn test_short_input_bypasses_codecs() {
        // Even a broken backend is never consulted below the threshold.
        let mut compression = Compression::new().zlib(Box::new(Broken));

        let data = input(MIN_COMPR_LEN - 1);
        let (out, codec) = compression.compress(&data, Codec::Zlib);
        assert_eq!((out, codec), (data, Codec::None));
        assert_eq!(compression.error_count(), 0);
    }

    #[test]
    fn test_favor_lzo_tolerates_size_regression() {
        let data = input(500);

        // DEFLATE wins by less than 10%: LZO keeps the job.
        let mut compression = Compression::new()
            .lzo(Box::new(Fixed(100)))
            .zlib(Box::new(Fixed(92)))
            .favor_lzo(10);
        assert_eq!(compression.compress(&data, Codec::None).1, Codec::Lzo);

        // DEFLATE wins by more than the tolerance: it takes over.
        let mut compression = Compression::new()
            .lzo(Box::new(Fixed(100)))
            .zlib(Box::new(Fixed(80)))
            .favor_lzo(10);
        let (out, codec) = compression.compress(&data, Codec::None);
        assert_eq!(codec, Codec::Zlib);
        assert_eq!(out.len(), 80);

        // A tie (or better) always goes to LZO.
        let mut compression = Compression::new()
            .lzo(Box::new(Fixed(90)))
            .zlib(Box::new(Fixed(90)))
            .favor_lzo(10);
        assert_eq!(compression.compress(&data, Codec::None).1, Codec::Lzo);
    }

    #[test]
    fn test_favor_lzo_single_survivor() {
        let data = input(500);

        let mut compression = Compression::new()
            .lzo(Box::new(Broken))
            .zlib(Box::new(Fixed(90)))
            .favor_lzo(10);
        assert_eq!(compression.compress(&data, Codec::None).1, Codec::Zlib);
        assert_eq!(compression.error_count(), 1);

        let mut compression = Compression::new()
            .lzo(Box::new(Fixed(90)))
            .zlib(Box::new(Broken))
            .favor_lzo(10);
        assert_eq!(compression.compress(&data, Codec::None).1, Codec::Lzo);

        // Both broken: verbatim, two failures on the books.
        let mut compression = Compression::new()
            .lzo(Box::new(Broken))
            .zlib(Box::new(Broken))
            .favor_lzo(10);
        let (out, codec) = compression.compress(&data, Codec::None);
        assert_eq!((out, codec), (data, Codec::None));
        assert_eq!(compression.error_count(), 2);
    }

    #[test]
    fn test_never_grows_the_data() {
        let data = input(500);

        let mut compression = Compression::new().zlib(Box::new(Fixed(500)));
        assert_eq!(
            compression.compress(&data, Codec::Zlib),
            (data.clone(), Codec::None)
        );

        let mut compression = Compression::new()
            .lzo(Box::new(Fixed(600)))
            .zlib(Box::new(Fixed(700)))
            .favor_lzo(10);
        assert_eq!(compression.compress(&data, Codec::None), (data, Codec::None));
    }

    #[test]
    fn test_missing_fixed_codec_falls_back_silently() {
        let data = input(500);

        // No LZMA backend installed: verbatim, and not counted as an error.
        let mut compression = Compression::new();
        assert_eq!(
            compression.compress(&data, Codec::Lzma),
            (data.clone(), Codec::None)
        );
        assert_eq!(compression.error_count(), 0);

        // With one installed, the request is honored.
        let mut compression = Compression::new().lzma(Box::new(Fixed(42)));
        let (out, codec) = compression.compress(&data, Codec::Lzma);
        assert_eq!(codec, Codec::Lzma);
        assert_eq!(out.len(), 42);

        // Codec::None is always a verbatim request.
        assert_eq!(
            compression.compress(&data, Codec::None),
            (data, Codec::None)
        );
    }

    #[test]
    fn test_failing_backend_counts_errors() {
        let data = input(500);

        let mut compression = Compression::new().zlib(Box::new(Broken));
        for _ in 0..3 {
            let (out, codec) = compression.compress(&data, Codec::Zlib);
            assert_eq!((out.as_slice(), codec), (data.as_slice(), Codec::None));
        }
        assert_eq!(compression.error_count(), 3);
    }
}
