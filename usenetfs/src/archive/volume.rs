use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use super::FileType;

fn rar_part_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\.part(\d+)\.rar$").unwrap())
}

fn rar_r_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\.r(\d+)$").unwrap())
}

fn rar_first_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\.rar$").unwrap())
}

fn sevenz_part_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\.7z\.(\d+)$").unwrap())
}

fn sevenz_first_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\.7z$").unwrap())
}

/// `Some(-1)` when `re` matches but the number does not fit.
fn captured_number(re: &Regex, name: &str) -> Option<i64> {
    let caps = re.captures(name)?;
    Some(caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(-1))
}

/// `.rar` is 0, `.rNN` is NN+1, `.partNN.rar` is NN, anything else -1.
pub fn rar_volume_number(name: &str) -> i64 {
    if let Some(n) = captured_number(rar_part_re(), name) {
        return n;
    }
    if let Some(n) = captured_number(rar_r_re(), name) {
        return if n < 0 { -1 } else { n.saturating_add(1) };
    }
    if rar_first_re().is_match(name) {
        return 0;
    }
    -1
}

/// `.7z` is 0, `.7z.NNN` is NNN, anything else -1.
pub fn sevenz_volume_number(name: &str) -> i64 {
    if let Some(n) = captured_number(sevenz_part_re(), name) {
        return n;
    }
    if sevenz_first_re().is_match(name) {
        return 0;
    }
    -1
}

/// Splits a volume name into the name shared by its set and the archive
/// type. `None` for names that are not archive volumes, including ones
/// whose volume number does not parse.
pub fn archive_base_name(name: &str) -> Option<(String, FileType)> {
    let patterns = [
        (rar_part_re(), FileType::Rar),
        (rar_r_re(), FileType::Rar),
        (rar_first_re(), FileType::Rar),
        (sevenz_part_re(), FileType::SevenZip),
        (sevenz_first_re(), FileType::SevenZip),
    ];
    let (base_name, file_type) = patterns.into_iter().find_map(|(re, file_type)| {
        re.find(name)
            .map(|m| (name[..m.start()].to_string(), file_type))
    })?;
    let number = match file_type {
        FileType::SevenZip => sevenz_volume_number(name),
        _ => rar_volume_number(name),
    };
    (number >= 0).then_some((base_name, file_type))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub size: u64,
    pub number: i64,
}

/// Sequentially numbered files that make up one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGroup {
    pub base_name: String,
    pub file_type: FileType,
    /// Ascending by volume number.
    pub volumes: Vec<Volume>,
    pub total_size: u64,
}

impl VolumeGroup {
    /// The volume an engine opens.
    pub fn first_volume(&self) -> Option<&str> {
        self.volumes.first().map(|v| v.name.as_str())
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.volumes.iter().map(|v| v.name.clone()).collect()
    }
}

/// Groups `(name, size)` pairs into archive volume sets, largest set first.
/// Names that are not archive volumes are ignored.
pub fn group_volumes<'a, I>(files: I) -> Vec<VolumeGroup>
where
    I: IntoIterator<Item = (&'a str, u64)>,
{
    let mut order = Vec::new();
    let mut groups: HashMap<(String, FileType), VolumeGroup> = HashMap::new();
    for (name, size) in files {
        let Some((base_name, file_type)) = archive_base_name(name) else {
            continue;
        };
        let number = match file_type {
            FileType::SevenZip => sevenz_volume_number(name),
            _ => rar_volume_number(name),
        };
        let key = (base_name.clone(), file_type);
        let group = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            VolumeGroup {
                base_name,
                file_type,
                volumes: Vec::new(),
                total_size: 0,
            }
        });
        group.volumes.push(Volume {
            name: name.to_string(),
            size,
            number,
        });
        group.total_size += size;
    }

    let mut result: Vec<VolumeGroup> = order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .map(|mut group| {
            group.volumes.sort_by_key(|v| v.number);
            group
        })
        .collect();
    result.sort_by(|a, b| b.total_size.cmp(&a.total_size));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rar_volume_number() {
        for (name, want) in [
            ("archive.rar", 0),
            ("archive.r00", 1),
            ("archive.r01", 2),
            ("archive.r99", 100),
            ("archive.part01.rar", 1),
            ("archive.part02.rar", 2),
            ("archive.PART99.RAR", 99),
            ("archive.r9223372036854775807", i64::MAX),
            ("archive.r99999999999999999999", -1),
            ("archive.part99999999999999999999.rar", -1),
            ("notrar.txt", -1),
            ("archive.zip", -1),
        ] {
            assert_eq!(rar_volume_number(name), want, "{name}");
        }
    }

    #[test]
    fn test_sevenz_volume_number() {
        for (name, want) in [
            ("archive.7z", 0),
            ("archive.7z.001", 1),
            ("archive.7z.002", 2),
            ("archive.7z.099", 99),
            ("archive.7z.99999999999999999999", -1),
            ("not7z.txt", -1),
            ("archive.zip", -1),
        ] {
            assert_eq!(sevenz_volume_number(name), want, "{name}");
        }
    }

    #[test]
    fn test_group_part_volumes_in_order() {
        let names: Vec<String> = [10, 3, 1, 7, 2, 4, 5, 6, 8, 9]
            .iter()
            .map(|n| format!("x.part{n:02}.rar"))
            .collect();
        let groups = group_volumes(names.iter().map(|n| (n.as_str(), 100)));
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.base_name, "x");
        assert_eq!(group.file_type, FileType::Rar);
        assert_eq!(group.total_size, 1000);
        let numbers: Vec<i64> = group.volumes.iter().map(|v| v.number).collect();
        assert_eq!(numbers, (1..=10).collect::<Vec<_>>());
        assert_eq!(group.first_volume(), Some("x.part01.rar"));
    }

    #[test]
    fn test_group_old_style_and_7z() {
        let files = [
            ("movie.r01", 50),
            ("movie.rar", 50),
            ("movie.r00", 50),
            ("data.7z.002", 10),
            ("data.7z.001", 100),
            ("readme.nfo", 1),
            ("other.mkv", 500),
        ];
        let groups = group_volumes(files.iter().map(|(n, s)| (*n, *s)));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].base_name, "movie");
        assert_eq!(
            groups[0].volume_names(),
            vec!["movie.rar", "movie.r00", "movie.r01"]
        );
        assert_eq!(groups[1].file_type, FileType::SevenZip);
        assert_eq!(groups[1].volume_names(), vec!["data.7z.001", "data.7z.002"]);
    }

    #[test]
    fn test_unrelated_names_never_group() {
        let files = [("a.part01.rar", 10), ("b.part02.rar", 10), ("a.7z", 10)];
        let groups = group_volumes(files.iter().map(|(n, s)| (*n, *s)));
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|g| g.volumes.len() == 1));
    }

    #[test]
    fn test_unparsable_volume_number_is_not_a_volume() {
        let huge = "x.r99999999999999999999";
        assert_eq!(archive_base_name(huge), None);
        let files = [("x.rar", 10), (huge, 10), ("x.r00", 10)];
        let groups = group_volumes(files.iter().map(|(n, s)| (*n, *s)));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].volume_names(), vec!["x.rar", "x.r00"]);
    }
}
