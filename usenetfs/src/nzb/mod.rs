//! NZB documents: the list of files of a Usenet post and the articles
//! (segments) each file was split into.

mod parser;
pub mod subject;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use parser::{parse, parse_bytes, parse_file, parse_with};
pub use subject::{FilenameStrategy, ResolvedName, SubjectParser};

#[derive(Debug, Error)]
pub enum NzbError {
    #[error("failed to parse NZB: {source}")]
    Parse {
        #[source]
        source: quick_xml::DeError,
    },
    #[error("NZB is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct Nzb {
    /// `None` when the document has no `<head>`.
    pub head: Option<Vec<Meta>>,
    pub files: Vec<File>,
}

impl Nzb {
    pub fn new(files: Vec<File>) -> Self {
        Self { head: None, files }
    }

    /// Value of the first `<meta type="...">` entry, or "" when absent.
    pub fn meta(&self, kind: &str) -> &str {
        self.head
            .iter()
            .flatten()
            .find(|m| m.kind == kind)
            .map(|m| m.value.as_str())
            .unwrap_or("")
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Sum of the declared (encoded) segment sizes.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(File::total_size).sum()
    }

    pub fn largest_file_idx(&self) -> Option<usize> {
        self.files
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.total_size().cmp(&b.total_size()).then(ib.cmp(ia)))
            .map(|(idx, _)| idx)
    }

    /// Resolves every file name from its subject. Names already set are kept.
    pub fn resolve_names(&mut self, strategy: &dyn FilenameStrategy) {
        let count = self.files.len();
        for file in &mut self.files {
            if file.resolved.is_none() {
                file.resolved = Some(strategy.resolve(&file.subject, count));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub message_id: String,
    /// Declared encoded size.
    pub bytes: u64,
    pub number: u32,
}

impl Segment {
    pub fn new(message_id: impl Into<String>, bytes: u64, number: u32) -> Self {
        Self {
            message_id: message_id.into(),
            bytes,
            number,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct File {
    pub poster: String,
    /// Unix seconds.
    pub date: i64,
    pub subject: String,
    pub groups: Vec<String>,
    /// Ascending by `number`.
    pub segments: Vec<Segment>,
    resolved: Option<ResolvedName>,
}

impl File {
    pub fn new(subject: impl Into<String>, groups: Vec<String>, mut segments: Vec<Segment>) -> Self {
        segments.sort_by_key(|s| s.number);
        Self {
            subject: subject.into(),
            groups,
            segments,
            ..Default::default()
        }
    }

    /// Sets the name directly instead of deriving it from the subject.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let number = self.resolved.as_ref().map_or(0, |r| r.number);
        self.resolved = Some(ResolvedName {
            name: name.into(),
            number,
        });
        self
    }

    pub fn name(&self) -> &str {
        self.resolved
            .as_ref()
            .map(|r| r.name.as_str())
            .unwrap_or(&self.subject)
    }

    /// Position within the post as announced in the subject, 0 when unknown.
    pub fn number(&self) -> u32 {
        self.resolved.as_ref().map_or(0, |r| r.number)
    }

    pub fn date_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.date, 0)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }

    pub fn message_ids(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.message_id.clone()).collect()
    }
}
