// Typed error kinds raised by the core to its callers.
// Wrapped in anyhow::Error along the way; callers that need to
// distinguish kinds use downcast_ref::<ParcError>().

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParcError {
    /// Sample or contig not present in the archive
    #[error("{0} not found in archive")]
    NotFound(String),

    /// Archive written by a newer, incompatible format
    #[error("archive format {found_major}.{found_minor} is not supported (reader supports up to major {supported_major})")]
    VersionMismatch {
        found_major: u32,
        found_minor: u32,
        supported_major: u32,
    },

    /// Bad FASTA or bad command input
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Internal consistency failure while reading; the archive is corrupt
    #[error("corrupt archive: {0}")]
    Corrupt(String),
}
