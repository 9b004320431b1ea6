// PARC common library
// Shared types, the block container and the archive catalog

pub mod catalog;
pub mod container;
pub mod error;
pub mod hash;
pub mod naming;
pub mod types;
pub mod varint;

pub use catalog::{
    Catalog, ContigEntry, GroupEntry, GroupKey, Header, Params, SampleEntry, SegmentPlace,
    MISSING_MINIMIZER,
};
pub use container::{Container, StreamId};
pub use error::ParcError;
pub use hash::{mix64, mix64_pair};
pub use naming::{
    group_delta_stream, group_ref_stream, int_to_base64, STREAM_CONTIGS, STREAM_FALLBACK,
    STREAM_GROUPS, STREAM_HEADER, STREAM_PARAMS, STREAM_SAMPLES,
};
pub use types::{
    ascii_to_sym, complement, parc_version, sym_to_ascii, CodecVariant, Contig, PackedBlock,
    ARCHIVE_FMT_MAJOR, ARCHIVE_FMT_MINOR, ARCHIVE_MAGIC, SEGMENT_SEPARATOR, SYM_A, SYM_C, SYM_G,
    SYM_INVALID, SYM_N, SYM_T,
};
pub use varint::{
    push_cstr, push_vuint, read_vuint, take_cstr, take_vuint, write_vuint, zigzag_decode,
    zigzag_encode,
};
