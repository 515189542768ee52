//! Command-line front end: write images to NAND flash (raw or UBI), extract
//! volumes from UBI image files, and list image volume tables.

use anyhow::{ensure, Context, Result};
use clap::{Args, Parser, Subcommand};

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use ubiflash::nand::mtd::MtdNand;
use ubiflash::{
    image::{write_image, InputSpec, UbiVolumeSpec, WriteConfig},
    nand::{FlashGeometry, SimNand},
    ubi::extract::{extract_volume, read_volume_table, VolumeRef},
    util::parse_size,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to a NAND image file to operate on in simulation
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Geometry of the simulated NAND ("BLOCKSxPAGESxBYTES")
    #[clap(long)]
    sim_layout: Option<FlashGeometry>,

    /// Write the simulated NAND back to its file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(geometry) = self.sim_layout {
            let mut sim = SimNand::new(geometry);
            if let Some(path) = &self.sim_path {
                if path.exists() {
                    sim.load(&mut File::open(path)?)?;
                }
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(mut sim) = nand {
                    sim.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

impl NandImpl {
    fn do_write(&mut self, cfg: &WriteConfig, input: InputSpec<'_>) -> Result<()> {
        match self {
            NandImpl::Sim(nand) => write_image(nand, cfg, input),

            #[cfg(target_os = "linux")]
            NandImpl::Mtd(nand) => write_image(nand, cfg, input),
        }
    }
}

/// Erase a block range and write a raw or UBI-formatted image to it
#[derive(Args, Debug)]
struct WriteArgs {
    #[clap(flatten)]
    nand: NandOptions,

    /// First eraseblock to erase/write
    #[clap(short = 's', long, default_value_t = 0)]
    start: u32,

    /// Number of eraseblocks to erase/write (default: to end of device)
    #[clap(short = 'b', long)]
    blocks: Option<u32>,

    /// Offset into the input file
    #[clap(short = 'k', long, default_value_t = 0)]
    skip: u64,

    /// Length of data to write (default: to end of input file)
    #[clap(short = 'l', long)]
    length: Option<u64>,

    /// Read input data from stdin
    #[clap(short = 'i', long, conflicts_with = "image")]
    stdin: bool,

    /// Write JFFS2 clean markers
    #[clap(short = 'c', long)]
    clean_markers: bool,

    /// Format as a UBI device
    #[clap(short = 'u', long, requires = "vol_name")]
    ubi: bool,

    /// ID of the UBI volume
    #[clap(short = 'n', long, default_value_t = 0)]
    vol_id: u32,

    /// Name of the UBI volume
    #[clap(short = 'N', long)]
    vol_name: Option<String>,

    /// LEB count for the UBI volume; 0 means all minus bad-block headroom,
    /// negative means "all but N"
    #[clap(short = 'S', long, default_value_t = 0, allow_negative_numbers = true)]
    vol_lebs: i64,

    /// Input image file
    image: Option<PathBuf>,
}

/// Extract the contents of one UBI volume from an image file
#[derive(Args, Debug)]
struct ExtractArgs {
    /// Output file name
    #[clap(short, long)]
    output: PathBuf,

    /// Size of the physical eraseblock of the flash this image was created
    /// for (accepts KiB/MiB suffixes)
    #[clap(short, long, value_parser = parse_size)]
    peb_size: u64,

    /// Volume table index of the volume to extract
    #[clap(short = 'i', long, group = "volume")]
    vol_index: Option<u32>,

    /// Name of the volume to extract
    #[clap(short = 'n', long, group = "volume")]
    vol_name: Option<String>,

    /// Skip eraseblocks with broken headers when reading data
    #[clap(short, long)]
    skip_bad_blocks: bool,

    /// Be verbose
    #[clap(short, long)]
    verbose: bool,

    /// Input UBI image file
    image: PathBuf,
}

/// List the volume table of a UBI image file
#[derive(Args, Debug)]
struct VolumesArgs {
    /// Size of the physical eraseblock (accepts KiB/MiB suffixes)
    #[clap(short, long, value_parser = parse_size)]
    peb_size: u64,

    /// Input UBI image file
    image: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    Write(WriteArgs),
    Extract(ExtractArgs),
    Volumes(VolumesArgs),
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    cmd: Command,
}

fn run_write(args: WriteArgs) -> Result<()> {
    ensure!(
        !args.stdin || args.skip == 0,
        "--skip is not supported with --stdin"
    );
    if args.image.is_none() && !args.stdin {
        ensure!(
            args.skip == 0 && args.length.is_none(),
            "can't have --skip or --length without input data"
        );
    }

    let cfg = WriteConfig {
        start_block: args.start,
        block_count: args.blocks,
        clean_markers: args.clean_markers,
        ubi: args.ubi.then(|| UbiVolumeSpec {
            vol_id: args.vol_id,
            name: args
                .vol_name
                .clone()
                .expect("--ubi requires --vol-name"),
            lebs: args.vol_lebs,
        }),
    };

    let mut nand = args.nand.open()?;

    let mut stdin;
    let mut file;
    let input = if args.stdin {
        stdin = std::io::stdin().lock();
        match args.length {
            Some(size) => InputSpec::Sized {
                reader: &mut stdin,
                size,
            },
            None => InputSpec::Streaming { reader: &mut stdin },
        }
    } else if let Some(path) = &args.image {
        file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

        let file_size = file.metadata()?.len();
        ensure!(
            args.skip + args.length.unwrap_or(0) <= file_size,
            "image file is too small"
        );
        if args.skip > 0 {
            file.seek(SeekFrom::Start(args.skip))?;
        }

        InputSpec::Sized {
            reader: &mut file,
            size: args.length.unwrap_or(file_size - args.skip),
        }
    } else {
        InputSpec::None
    };

    nand.do_write(&cfg, input)?;
    args.nand.cleanup(nand)?;
    Ok(())
}

fn peb_size_arg(peb_size: u64) -> Result<u32> {
    u32::try_from(peb_size)
        .ok()
        .filter(|&size| size > 0)
        .context("bad physical eraseblock size")
}

fn run_extract(args: ExtractArgs) -> Result<()> {
    let peb_size = peb_size_arg(args.peb_size)?;

    let target = match (args.vol_index, &args.vol_name) {
        (Some(index), None) => VolumeRef::Index(index),
        (None, Some(name)) => VolumeRef::Name(name.clone()),
        _ => anyhow::bail!("UBI volume not specified (use --vol-index or --vol-name)"),
    };

    let mut input = File::open(&args.image)
        .with_context(|| format!("cannot open input file {}", args.image.display()))?;
    let mut output = File::create(&args.output)
        .with_context(|| format!("cannot open output file {}", args.output.display()))?;

    let summary = extract_volume(&mut input, peb_size, &target, args.skip_bad_blocks, &mut output)?;

    if args.verbose {
        println!("Volume id:   {}", summary.vol_id);
        println!("PEB size:    {peb_size}");
        println!("LEB size:    {}", summary.data_size);
        println!("LEBs copied: {}", summary.blocks);
    }

    Ok(())
}

fn run_volumes(args: VolumesArgs) -> Result<()> {
    let peb_size = peb_size_arg(args.peb_size)?;

    let mut input = File::open(&args.image)
        .with_context(|| format!("cannot open input file {}", args.image.display()))?;

    for (index, record) in read_volume_table(&mut input, peb_size)?.iter().enumerate() {
        if let Some(record) = record {
            println!(
                "{index:3}  {:7}  {:5} PEBs  {}",
                format!("{:?}", record.vol_type).to_lowercase(),
                record.reserved_pebs,
                record.name,
            );
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Write(args) => {
            howudoin::init(howudoin::consumers::TermLine::default());
            run_write(args)
        }
        Command::Extract(args) => run_extract(args),
        Command::Volumes(args) => run_volumes(args),
    }
}
