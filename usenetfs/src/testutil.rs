//! In-memory fixtures shared by the filesystem, archive and stream tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::manager::SegmentFetcher;
use crate::nntp::NntpError;
use crate::nzb::{File, Nzb, Segment};
use crate::segment::{ByteRange, SegmentData};

pub(crate) fn test_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Serves pre-decoded segments and records every request.
#[derive(Default)]
pub(crate) struct MemoryFetcher {
    segments: Mutex<HashMap<String, Arc<SegmentData>>>,
    requests: Mutex<Vec<String>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits `data` into `part_size` segments named `{name}-{n}`.
    pub fn add_file(&self, name: &str, data: &[u8], part_size: usize) -> File {
        let part_size = part_size.max(1);
        let mut segments = Vec::new();
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&data[..0]]
        } else {
            data.chunks(part_size).collect()
        };
        let mut offset = 0u64;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let id = format!("{name}-{}", i + 1);
            let range = ByteRange::from_size(offset, chunk.len() as u64);
            self.segments.lock().insert(
                id.clone(),
                Arc::new(SegmentData {
                    body: Bytes::copy_from_slice(chunk),
                    range,
                    file_size: data.len() as u64,
                    part_size: chunk.len() as u64,
                }),
            );
            segments.push(Segment::new(id, chunk.len() as u64 + 64, i as u32 + 1));
            offset = range.end;
        }
        File::new(
            format!(r#"{name} yEnc (1/{})"#, segments.len()),
            vec!["alt.binaries.test".to_string()],
            segments,
        )
        .with_name(name)
    }

    /// Builds an NZB from `(name, data)` pairs.
    pub fn nzb(&self, files: &[(&str, &[u8])], part_size: usize) -> Nzb {
        Nzb::new(
            files
                .iter()
                .map(|(name, data)| self.add_file(name, data, part_size))
                .collect(),
        )
    }

    pub fn was_requested(&self, message_id: &str) -> bool {
        self.requests.lock().iter().any(|r| r == message_id)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl SegmentFetcher for MemoryFetcher {
    async fn fetch_segment(
        &self,
        message_id: &str,
        _groups: &[String],
    ) -> Result<Arc<SegmentData>, NntpError> {
        let id = message_id.trim_start_matches('<').trim_end_matches('>');
        self.requests.lock().push(id.to_string());
        self.segments
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| NntpError::command(format!("BODY <{id}>"), 430, "No such article"))
    }
}
