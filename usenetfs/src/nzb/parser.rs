use std::path::Path;

use serde::Deserialize;

use super::{File, FilenameStrategy, Meta, Nzb, NzbError, Segment, SubjectParser};

#[derive(Debug, Deserialize)]
struct RawNzb {
    head: Option<RawHead>,
    #[serde(rename = "file", default)]
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawHead {
    #[serde(rename = "meta", default)]
    meta: Vec<RawMeta>,
}

#[derive(Debug, Deserialize)]
struct RawMeta {
    #[serde(rename = "@type", default)]
    kind: String,
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(rename = "@poster", default)]
    poster: String,
    #[serde(rename = "@date", default)]
    date: i64,
    #[serde(rename = "@subject", default)]
    subject: String,
    #[serde(default)]
    groups: RawGroups,
    #[serde(default)]
    segments: RawSegments,
}

#[derive(Debug, Default, Deserialize)]
struct RawGroups {
    #[serde(rename = "group", default)]
    groups: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSegments {
    #[serde(rename = "segment", default)]
    segments: Vec<RawSegment>,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    #[serde(rename = "@bytes")]
    bytes: u64,
    #[serde(rename = "@number")]
    number: u32,
    #[serde(rename = "$value")]
    id: String,
}

impl From<RawFile> for File {
    fn from(raw: RawFile) -> Self {
        let segments = raw
            .segments
            .segments
            .into_iter()
            .map(|s| Segment::new(s.id.trim(), s.bytes, s.number))
            .collect();
        let mut file = File::new(raw.subject, raw.groups.groups, segments);
        file.poster = raw.poster;
        file.date = raw.date;
        file
    }
}

/// Parses an NZB document, naming files with the default subject parser.
pub fn parse(xml: &str) -> Result<Nzb, NzbError> {
    parse_with(xml, &SubjectParser)
}

pub fn parse_bytes(xml: &[u8]) -> Result<Nzb, NzbError> {
    parse(std::str::from_utf8(xml)?)
}

pub async fn parse_file(path: impl AsRef<Path>) -> Result<Nzb, NzbError> {
    let xml = tokio::fs::read(path).await?;
    parse_bytes(&xml)
}

pub fn parse_with(xml: &str, strategy: &dyn FilenameStrategy) -> Result<Nzb, NzbError> {
    let raw: RawNzb = quick_xml::de::from_str(xml).map_err(|source| NzbError::Parse { source })?;
    let mut nzb = Nzb {
        head: raw.head.map(|head| {
            head.meta
                .into_iter()
                .map(|m| Meta {
                    kind: m.kind,
                    value: m.value.trim().to_string(),
                })
                .collect()
        }),
        files: raw.files.into_iter().map(File::from).collect(),
    };
    nzb.resolve_names(strategy);
    Ok(nzb)
}
