// PARC core library
// Segmentation, minimizer routing, LZ-diff coding, the parallel
// compression pipeline and archive extraction

pub mod codec;
pub mod extractor;
pub mod fasta;
pub mod groups;
pub mod kmer;
pub mod minimizers;
pub mod pipeline;
pub mod segmenter;

pub use codec::{LzDiff, HASHING_STEP, MIN_NRUN_LEN};
pub use extractor::{ArchiveInfo, Extractor, ExtractorConfig};
pub use fasta::{detect_multi_sample, parse_sample_header, FastaReader, FastaWriter};
pub use groups::{GroupManager, Placement, FANOUT_CAP};
pub use kmer::CanonicalKmer;
pub use minimizers::{contig_minimizers, sample_fallback_pool, Minimizer};
pub use pipeline::{append_archive, create_archive, CompressorConfig, InputSet};
pub use segmenter::{split_contig, Segment, SegmenterParams};
