// parc command line interface

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use parc_common::{parc_version, CodecVariant};
use parc_core::{
    append_archive, create_archive, detect_multi_sample, CompressorConfig, Extractor,
    ExtractorConfig, FastaWriter, InputSet,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "parc")]
#[command(version, about = "Pan-genome archive compressor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct CompressionArgs {
    /// K-mer length for minimizer selection
    #[arg(short = 'k', long, default_value_t = 21)]
    kmer_length: u32,

    /// Minimizer window size
    #[arg(short = 'w', long, default_value_t = 11)]
    window: u32,

    /// Expected segment size
    #[arg(short = 's', long, default_value_t = 10_000)]
    segment_size: u32,

    /// Minimum match length for differential encoding
    #[arg(short = 'm', long, default_value_t = 18)]
    min_match_len: u32,

    /// ZSTD level for packed blocks (1-22)
    #[arg(short = 'c', long, default_value_t = 17)]
    compression_level: i32,

    /// Worker threads (0 = all cores)
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,

    /// Verbosity (0 = quiet, 1 = normal, 2 = debug)
    #[arg(short = 'v', long, default_value_t = 1)]
    verbosity: u32,

    /// Adaptive mode: split groups that outgrow their references
    #[arg(short = 'a', long)]
    adaptive: bool,

    /// Per-mille sampling of reference minimizers for fallback routing
    #[arg(long, default_value_t = 100)]
    fallback_permille: u32,

    /// Write the legacy V1 token format instead of V2
    #[arg(long)]
    v1: bool,

    /// Do not record the command line in the archive header
    #[arg(short = 'd', long)]
    no_cmd_line: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an archive; the first sample becomes the reference
    Create {
        /// Output archive path
        #[arg(short = 'o', long)]
        output: PathBuf,

        /// Input FASTA files (optionally gzipped; a single file may be
        /// multi-sample with sample#hap#chr headers)
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[command(flatten)]
        compression: CompressionArgs,
    },

    /// Append samples to an existing archive
    Append {
        /// Archive to extend
        archive: PathBuf,

        /// Input FASTA files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[command(flatten)]
        compression: CompressionArgs,
    },

    /// Extract every sample
    Getcol {
        archive: PathBuf,

        /// Output FASTA (default: stdout)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        #[arg(short = 'v', long, default_value_t = 0)]
        verbosity: u32,
    },

    /// Extract whole samples
    Getset {
        archive: PathBuf,

        /// Sample names
        #[arg(required = true)]
        samples: Vec<String>,

        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        #[arg(short = 'v', long, default_value_t = 0)]
        verbosity: u32,
    },

    /// Extract contigs; targets are contig[@sample][:from-to] with an
    /// inclusive-exclusive range
    Getctg {
        archive: PathBuf,

        /// Contig targets
        #[arg(required = true)]
        targets: Vec<String>,

        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        #[arg(short = 'v', long, default_value_t = 0)]
        verbosity: u32,
    },

    /// Print the reference sample name
    Listref { archive: PathBuf },

    /// List sample names
    Listset {
        archive: PathBuf,

        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },

    /// List contig names of the given samples (all samples if none)
    Listctg {
        archive: PathBuf,

        samples: Vec<String>,

        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },

    /// Print archive statistics
    Info { archive: PathBuf },
}

/// Sample name from a FASTA path, stripping the usual extensions
fn sample_name_from_path(path: &Path) -> String {
    let mut name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();
    for ext in [
        ".fa.gz", ".fasta.gz", ".fna.gz", ".fa", ".fasta", ".fna", ".gz",
    ] {
        if let Some(stripped) = name.strip_suffix(ext) {
            name = stripped.to_string();
            break;
        }
    }
    name
}

/// One extraction target: contig[@sample][:from-to]
#[derive(Debug, Clone, PartialEq, Eq)]
struct CtgTarget {
    contig: String,
    sample: Option<String>,
    range: Option<(usize, usize)>,
}

fn parse_target(target: &str) -> Result<CtgTarget> {
    let (name_part, range) = match target.rsplit_once(':') {
        Some((head, range_str)) => {
            let (from_str, to_str) = range_str
                .split_once('-')
                .ok_or_else(|| anyhow!("bad range in target {target}; expected from-to"))?;
            let from: usize = from_str
                .parse()
                .with_context(|| format!("bad range start in {target}"))?;
            let to: usize = to_str
                .parse()
                .with_context(|| format!("bad range end in {target}"))?;
            (head, Some((from, to)))
        }
        None => (target, None),
    };

    let (contig, sample) = match name_part.split_once('@') {
        Some((contig, sample)) => (contig.to_string(), Some(sample.to_string())),
        None => (name_part.to_string(), None),
    };
    if contig.is_empty() {
        bail!("empty contig name in target {target}");
    }
    Ok(CtgTarget {
        contig,
        sample,
        range,
    })
}

fn compressor_config(args: &CompressionArgs) -> CompressorConfig {
    let defaults = CompressorConfig::default();
    CompressorConfig {
        kmer_len: args.kmer_length,
        window: args.window,
        segment_size: args.segment_size,
        min_match_len: args.min_match_len,
        zstd_level: args.compression_level,
        no_threads: if args.threads == 0 {
            defaults.no_threads
        } else {
            args.threads
        },
        verbosity: args.verbosity,
        adaptive: args.adaptive,
        fallback_permille: args.fallback_permille,
        variant: if args.v1 {
            CodecVariant::V1
        } else {
            CodecVariant::V2
        },
        command_line: if args.no_cmd_line {
            String::new()
        } else {
            std::env::args().collect::<Vec<_>>().join(" ")
        },
        ..defaults
    }
}

fn gather_inputs(inputs: Vec<PathBuf>, verbosity: u32) -> Result<InputSet> {
    for input in &inputs {
        if !input.exists() {
            bail!("input file not found: {}", input.display());
        }
    }
    if inputs.len() == 1 && detect_multi_sample(&inputs[0])? {
        if verbosity > 0 {
            eprintln!("multi-sample input: grouping contigs by header sample names");
        }
        return Ok(InputSet::MultiSample(inputs.into_iter().next().unwrap()));
    }
    Ok(InputSet::Files(
        inputs
            .into_iter()
            .map(|p| (sample_name_from_path(&p), p))
            .collect(),
    ))
}

/// FASTA writer over stdout or a file
fn open_output(output: Option<PathBuf>) -> Result<FastaWriter<Box<dyn Write>>> {
    let sink: Box<dyn Write> = match output {
        Some(path) => Box::new(io::BufWriter::new(
            std::fs::File::create(&path)
                .with_context(|| format!("cannot create output {}", path.display()))?,
        )),
        None => Box::new(io::BufWriter::new(io::stdout())),
    };
    Ok(FastaWriter::new(sink))
}

fn open_listing(output: Option<PathBuf>) -> Result<Box<dyn Write>> {
    Ok(match output {
        Some(path) => Box::new(io::BufWriter::new(
            std::fs::File::create(&path)
                .with_context(|| format!("cannot create output {}", path.display()))?,
        )),
        None => Box::new(io::BufWriter::new(io::stdout())),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Create {
            output,
            inputs,
            compression,
        } => {
            let config = compressor_config(&compression);
            let input = gather_inputs(inputs, config.verbosity)?;
            create_archive(&output, input, &config)?;
        }

        Commands::Append {
            archive,
            inputs,
            compression,
        } => {
            let config = compressor_config(&compression);
            let input = gather_inputs(inputs, config.verbosity)?;
            append_archive(&archive, input, &config)?;
        }

        Commands::Getcol {
            archive,
            output,
            verbosity,
        } => {
            let mut extractor = Extractor::open(&archive, ExtractorConfig { verbosity })?;
            let mut writer = open_output(output)?;
            for sample in extractor.list_samples() {
                for (contig, data) in extractor.get_sample(&sample)? {
                    writer.write_contig(&contig, &data)?;
                }
            }
            writer.flush()?;
        }

        Commands::Getset {
            archive,
            samples,
            output,
            verbosity,
        } => {
            let mut extractor = Extractor::open(&archive, ExtractorConfig { verbosity })?;
            let mut writer = open_output(output)?;
            for sample in &samples {
                for (contig, data) in extractor.get_sample(sample)? {
                    writer.write_contig(&contig, &data)?;
                }
            }
            writer.flush()?;
        }

        Commands::Getctg {
            archive,
            targets,
            output,
            verbosity,
        } => {
            let mut extractor = Extractor::open(&archive, ExtractorConfig { verbosity })?;
            let mut writer = open_output(output)?;
            for target in &targets {
                let target = parse_target(target)?;
                let sample = match &target.sample {
                    Some(sample) => sample.clone(),
                    None => find_sample_with_contig(&extractor, &target.contig)?,
                };
                match target.range {
                    Some((from, to)) => {
                        let data =
                            extractor.get_contig_range(&sample, &target.contig, from, to)?;
                        writer.write_contig(
                            &format!("{}:{}-{}", target.contig, from, to),
                            &data,
                        )?;
                    }
                    None => {
                        let data = extractor.get_contig(&sample, &target.contig)?;
                        writer.write_contig(&target.contig, &data)?;
                    }
                }
            }
            writer.flush()?;
        }

        Commands::Listref { archive } => {
            let extractor = Extractor::open(&archive, ExtractorConfig::default())?;
            let reference = extractor
                .reference_sample()
                .ok_or_else(|| anyhow!("archive contains no samples"))?;
            println!("{reference}");
        }

        Commands::Listset { archive, output } => {
            let extractor = Extractor::open(&archive, ExtractorConfig::default())?;
            let mut out = open_listing(output)?;
            for sample in extractor.list_samples() {
                writeln!(out, "{sample}")?;
            }
            out.flush()?;
        }

        Commands::Listctg {
            archive,
            samples,
            output,
        } => {
            let extractor = Extractor::open(&archive, ExtractorConfig::default())?;
            let mut out = open_listing(output)?;
            let samples = if samples.is_empty() {
                extractor.list_samples()
            } else {
                samples
            };
            for sample in &samples {
                for contig in extractor.list_contigs(sample)? {
                    writeln!(out, "{sample}\t{contig}")?;
                }
            }
            out.flush()?;
        }

        Commands::Info { archive } => {
            let extractor = Extractor::open(&archive, ExtractorConfig::default())?;
            let info = extractor.info();
            println!("{}", parc_version());
            println!("archive format   : {}.{}", info.header.fmt_major, info.header.fmt_minor);
            println!("producer         : {}", info.header.producer);
            if !info.header.command_line.is_empty() {
                println!("command line     : {}", info.header.command_line);
            }
            println!("codec variant    : V{}", info.params.variant.to_wire());
            println!("k-mer length     : {}", info.params.kmer_len);
            println!("minimizer window : {}", info.params.window);
            println!("segment size     : {}", info.params.segment_size);
            println!("min match length : {}", info.params.min_match_len);
            println!("pack cardinality : {}", info.params.pack_cardinality);
            println!("adaptive mode    : {}", info.params.adaptive);
            println!("samples          : {}", info.no_samples);
            println!("contigs          : {}", info.no_contigs);
            println!("segment groups   : {}", info.no_groups);
            println!("total bases      : {}", info.total_bases);
            println!("reference blocks : {} bytes", info.reference_packed_bytes);
            println!("delta blocks     : {} bytes", info.delta_packed_bytes);
        }
    }

    Ok(())
}

fn find_sample_with_contig(extractor: &Extractor, contig: &str) -> Result<String> {
    for sample in extractor.list_samples() {
        if extractor
            .list_contigs(&sample)?
            .iter()
            .any(|c| c == contig)
        {
            return Ok(sample);
        }
    }
    bail!("contig {contig} not found in any sample")
}
