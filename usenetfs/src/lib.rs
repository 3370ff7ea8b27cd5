//! Streaming access to Usenet binaries.
//!
//! Segments are fetched over NNTP from a ranked set of providers, yEnc
//! decoded, cached, and exposed as seekable files. Stored RAR and 7z volume
//! sets are read in place, without extracting them.

pub mod archive;
pub mod cache;
pub mod config;
pub mod fs;
pub mod inspect;
pub mod manager;
pub mod nntp;
pub mod nzb;
pub mod segment;
pub mod stream;
pub mod yenc;

#[cfg(test)]
pub(crate) mod testutil;

pub use archive::{Archive, ArchiveError, ArchiveFile, ArchiveHandle, FileType};
pub use cache::{SegmentCache, SegmentCacheConfig};
pub use config::{ProviderConfig, UsenetConfig};
pub use fs::{stream_segments, FileSystem, UsenetFile, UsenetFs};
pub use inspect::{inspect_nzb_content, ContentKind, NzbContent, NzbContentFile};
pub use manager::{Manager, ManagerError, SegmentFetcher};
pub use nntp::NntpError;
pub use nzb::Nzb;
pub use segment::{ByteRange, SegmentData};
pub use stream::{
    select_stream, stream_file, stream_file_by_name, stream_largest_file, Stream, StreamConfig,
    StreamError,
};
