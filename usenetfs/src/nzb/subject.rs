//! Filename recovery from Usenet subject lines.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedName {
    pub name: String,
    /// Position of the file within the post, 0 when unknown.
    pub number: u32,
}

/// Turns a post subject into a filename.
pub trait FilenameStrategy: Send + Sync {
    fn resolve(&self, subject: &str, file_count: usize) -> ResolvedName;
}

fn quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""([^"].+[^"])""#).unwrap())
}

fn bracketed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\[(?:(?:(?:[^/\[\]]*(?:\[[^\]]*\])?)*)?/)*([^\[\]]*(?:\[[^\]]*\])?[^\[/\.]*\.\w{2,5})\]",
        )
        .unwrap()
    })
}

fn count_name_yenc_size_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[\[\(]\d+/\d+[\]\)]\s-\s(.*)\syEnc\s[\[\(]\d+/\d+[\]\)]\s\d+").unwrap()
    })
}

fn count_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\[\(]\d+/\d+[\]\)]\s-\s(.*\.\w{2,5})").unwrap())
}

fn reply_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Re:\s*(.+\.\w{2,5})(?: [\[\(]\d+/\d+[\]\)])?").unwrap())
}

fn hash_prefixed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\\[A-Z0-9]+\\::(.+)\s+yEnc\s+(?:[\[\(]\d+/\d+[\)\]])?").unwrap()
    })
}

fn filename_like_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b([\w\-+()' .,]+(?:\[[\w\-/+()' .,]*\][\w\-+()' .,]*)*\.[A-Za-z0-9]{2,4})\b",
        )
        .unwrap()
    })
}

/// Which part of a match is cut from the subject once a name is found.
#[derive(Clone, Copy)]
enum Strip {
    Whole,
    Name,
}

/// The default cascade of subject conventions seen on indexers, tried from
/// most to least specific. Falls back to the raw subject.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubjectParser;

impl SubjectParser {
    fn file_index_re(file_count: usize) -> Option<Regex> {
        Regex::new(&format!(r"[(\[]\s*(\d+)\s*/\s*0?{file_count}\s*[\])]")).ok()
    }
}

impl FilenameStrategy for SubjectParser {
    fn resolve(&self, subject: &str, file_count: usize) -> ResolvedName {
        let mut rest = subject.to_string();
        let mut name = String::new();

        // Only an empty quoted name leaves the subject untouched.
        let cascade: [(&Regex, Strip, bool); 7] = [
            (quoted_re(), Strip::Whole, true),
            (bracketed_re(), Strip::Whole, false),
            (count_name_yenc_size_re(), Strip::Whole, false),
            (count_name_re(), Strip::Name, false),
            (reply_re(), Strip::Name, false),
            (hash_prefixed_re(), Strip::Whole, false),
            (filename_like_re(), Strip::Name, false),
        ];
        for (re, strip, skip_empty) in cascade {
            let Some((whole, group)) = re.captures(&rest).and_then(|caps| {
                Some((caps.get(0)?.as_str().to_string(), caps.get(1)?.as_str().to_string()))
            }) else {
                continue;
            };
            let candidate = group.trim();
            if candidate.is_empty() && skip_empty {
                continue;
            }
            name = candidate.to_string();
            let cut = match strip {
                Strip::Whole => whole,
                Strip::Name => group,
            };
            rest = rest.replacen(&cut, "", 1).trim().to_string();
            if !name.is_empty() {
                break;
            }
        }

        let mut number = 0;
        if file_count > 0 {
            if let Some(re) = Self::file_index_re(file_count) {
                let found = re.captures(&rest).and_then(|caps| {
                    let whole = caps.get(0)?.as_str().to_string();
                    let n = caps.get(1)?.as_str().parse().unwrap_or(0);
                    Some((whole, n))
                });
                if let Some((whole, n)) = found {
                    number = n;
                    rest = rest.replacen(&whole, "", 1).trim().to_string();
                }
            }
        }

        if name.is_empty() {
            name = rest;
        }
        ResolvedName { name, number }
    }
}
