use chrono::{DateTime, NaiveDateTime, Utc};

use super::error::{NntpError, Result};

pub const STATUS_CAPABILITY_LIST: u16 = 101;
pub const STATUS_SERVER_DATE: u16 = 111;
pub const STATUS_POSTING_ALLOWED: u16 = 200;
pub const STATUS_POSTING_NOT_ALLOWED: u16 = 201;
pub const STATUS_CLOSING_CONNECTION: u16 = 205;
pub const STATUS_GROUP_SELECTED: u16 = 211;
pub const STATUS_INFORMATION: u16 = 215;
pub const STATUS_ARTICLE: u16 = 220;
pub const STATUS_ARTICLE_HEADERS: u16 = 221;
pub const STATUS_ARTICLE_BODY: u16 = 222;
pub const STATUS_ARTICLE_EXISTS: u16 = 223;
pub const STATUS_OVERVIEW: u16 = 224;
pub const STATUS_AUTH_ACCEPTED: u16 = 281;
pub const STATUS_PASSWORD_REQUIRED: u16 = 381;

/// A parsed status line, e.g. `211 1234 3000234 3002322 misc.test`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub text: String,
}

impl StatusLine {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (code, text) = match line.split_once(' ') {
            Some((code, text)) => (code, text),
            None => (line, ""),
        };
        if code.len() != 3 {
            return Err(NntpError::protocol(0, format!("short response: {line}")));
        }
        let code = code
            .parse::<u16>()
            .map_err(|_| NntpError::protocol(0, format!("invalid response code: {line}")))?;
        Ok(StatusLine {
            code,
            text: text.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub version: String,
    pub capabilities: Vec<String>,
}

impl Capabilities {
    pub fn has(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| {
            c.split_whitespace()
                .next()
                .is_some_and(|first| first.eq_ignore_ascii_case(name))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub number: i64,
    pub low: i64,
    pub high: i64,
}

/// Article number and message-id, as carried by 22x status lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArticleId {
    pub number: i64,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Article headers in wire order. Lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(pub Vec<Header>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArticleOverview {
    pub number: i64,
    pub subject: String,
    pub from: String,
    pub date: String,
    pub message_id: String,
    pub references: String,
    pub bytes: i64,
    pub lines: i64,
    pub extra: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GroupStatus {
    #[default]
    Unknown,
    PostingPermitted,
    PostingNotPermitted,
    Moderated,
}

impl GroupStatus {
    fn parse(s: &str) -> Self {
        match s {
            "y" => GroupStatus::PostingPermitted,
            "n" => GroupStatus::PostingNotPermitted,
            "m" => GroupStatus::Moderated,
            _ => GroupStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveGroup {
    pub name: String,
    pub high: i64,
    pub low: i64,
    pub status: GroupStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupActiveTime {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub creator: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewsGroup {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistribPat {
    pub weight: i32,
    pub wildmat: String,
    pub header: String,
}

pub fn parse_capabilities(lines: &[String]) -> Result<Capabilities> {
    if lines.is_empty() {
        return Err(NntpError::protocol(
            STATUS_CAPABILITY_LIST,
            "empty CAPABILITIES response",
        ));
    }
    let mut caps = Capabilities {
        version: String::new(),
        capabilities: Vec::with_capacity(lines.len()),
    };
    for line in lines {
        if let Some(version) = line.strip_prefix("VERSION ") {
            caps.version = version.to_string();
        }
        caps.capabilities.push(line.clone());
    }
    Ok(caps)
}

pub fn parse_date(text: &str) -> Result<DateTime<Utc>> {
    let stamp = text.split_whitespace().next().unwrap_or_default();
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
        .map(|dt| dt.and_utc())
        .map_err(|e| {
            NntpError::protocol(STATUS_SERVER_DATE, format!("invalid DATE response {text:?}: {e}"))
        })
}

/// Parses `number low high group` from a 211 reply.
pub fn parse_group(text: &str) -> Result<Group> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(NntpError::protocol(
            STATUS_GROUP_SELECTED,
            format!("invalid GROUP response: {text}"),
        ));
    }
    let num = |s: &str| {
        s.parse::<i64>().map_err(|_| {
            NntpError::protocol(
                STATUS_GROUP_SELECTED,
                format!("invalid GROUP response: {text}"),
            )
        })
    };
    Ok(Group {
        number: num(fields[0])?,
        low: num(fields[1])?,
        high: num(fields[2])?,
        name: fields[3].to_string(),
    })
}

/// Parses `n message-id` from a 220-223 reply.
pub fn parse_article_id(code: u16, text: &str) -> Result<ArticleId> {
    let mut fields = text.split_whitespace();
    let number = fields
        .next()
        .and_then(|n| n.parse::<i64>().ok())
        .ok_or_else(|| NntpError::protocol(code, format!("invalid article response: {text}")))?;
    Ok(ArticleId {
        number,
        message_id: fields.next().unwrap_or_default().to_string(),
    })
}

/// Parses RFC 5322 style header lines, joining folded continuations.
pub fn parse_headers(lines: &[String]) -> Headers {
    let mut headers: Vec<Header> = Vec::new();
    for line in lines {
        if line.starts_with([' ', '\t']) {
            if let Some(last) = headers.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push(Header {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            });
        }
    }
    Headers(headers)
}

pub fn parse_overview(lines: &[String]) -> Vec<ArticleOverview> {
    lines
        .iter()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 8 {
                return None;
            }
            Some(ArticleOverview {
                number: fields[0].trim().parse().ok()?,
                subject: fields[1].to_string(),
                from: fields[2].to_string(),
                date: fields[3].to_string(),
                message_id: fields[4].to_string(),
                references: fields[5].to_string(),
                bytes: fields[6].trim().parse().unwrap_or(0),
                lines: fields[7].trim().parse().unwrap_or(0),
                extra: fields[8..].iter().map(|s| s.to_string()).collect(),
            })
        })
        .collect()
}

pub fn parse_article_numbers(lines: &[String]) -> Vec<i64> {
    lines
        .iter()
        .filter_map(|l| l.trim().parse::<i64>().ok())
        .collect()
}

/// `group high low status`
pub fn parse_active(lines: &[String]) -> Vec<ActiveGroup> {
    lines
        .iter()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            Some(ActiveGroup {
                name: fields[0].to_string(),
                high: fields[1].parse().ok()?,
                low: fields[2].parse().ok()?,
                status: GroupStatus::parse(fields[3]),
            })
        })
        .collect()
}

/// `group timestamp creator`
pub fn parse_active_times(lines: &[String]) -> Vec<GroupActiveTime> {
    lines
        .iter()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return None;
            }
            let ts = fields[1].parse::<i64>().ok()?;
            Some(GroupActiveTime {
                name: fields[0].to_string(),
                created_at: DateTime::from_timestamp(ts, 0)?,
                creator: fields[2].to_string(),
            })
        })
        .collect()
}

pub fn parse_newsgroups(lines: &[String]) -> Vec<NewsGroup> {
    lines
        .iter()
        .map(|line| {
            let (name, description) = line.split_once([' ', '\t']).unwrap_or((line, ""));
            NewsGroup {
                name: name.to_string(),
                description: description.trim().to_string(),
            }
        })
        .collect()
}

/// `weight:wildmat:header`
pub fn parse_distrib_pats(lines: &[String]) -> Vec<DistribPat> {
    lines
        .iter()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let weight = parts.next()?.parse::<i32>().ok()?;
            let wildmat = parts.next()?;
            let header = parts.next()?;
            Some(DistribPat {
                weight,
                wildmat: wildmat.to_string(),
                header: header.to_string(),
            })
        })
        .collect()
}
