use std::collections::HashMap;

use async_trait::async_trait;

use super::{clean_path, FileSystem, FsError, Metadata, SeekableFile};
use crate::archive::ArchiveFile;

/// [`FileSystem`] over the entries of an already opened archive, keyed by
/// base name. Lets an archive engine read volumes stored inside another
/// archive.
pub struct ArchiveFs {
    files: HashMap<String, ArchiveFile>,
}

impl ArchiveFs {
    pub fn new(files: impl IntoIterator<Item = ArchiveFile>) -> Self {
        let files = files
            .into_iter()
            .map(|file| (file.base_name().to_string(), file))
            .collect();
        Self { files }
    }

    fn entry(&self, op: &'static str, path: &str) -> Result<&ArchiveFile, FsError> {
        let name = clean_path(path);
        if name == "." {
            return Err(FsError::not_exist(op, name));
        }
        self.files
            .get(&name)
            .ok_or_else(|| FsError::not_exist(op, name))
    }
}

#[async_trait]
impl FileSystem for ArchiveFs {
    async fn open(&self, path: &str) -> anyhow::Result<Box<dyn SeekableFile>> {
        let file = self.entry("open", path)?;
        Ok(Box::new(file.open()?))
    }

    async fn stat(&self, path: &str) -> anyhow::Result<Metadata> {
        let file = self.entry("stat", path)?;
        Ok(Metadata::file(file.base_name(), file.size, None))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::archive::fixtures::{self, Method};
    use crate::archive::{Archive, RarArchive};
    use crate::fs::UsenetFs;
    use crate::testutil::{test_bytes, MemoryFetcher};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_entries_by_base_name() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let inner = test_bytes(700);
        let outer = fixtures::rar4_archive(&[("folder/inner.bin", &inner[..])]);
        let nzb = fetcher.nzb(&[("outer.rar", &outer[..])], 200);
        let fs: Arc<dyn FileSystem> = Arc::new(UsenetFs::new(&nzb, fetcher, 2));

        let mut archive = RarArchive::new(fs, vec!["outer.rar".to_string()]);
        archive.open(None).await.unwrap();
        let afs = ArchiveFs::new(archive.files().to_vec());

        let meta = afs.stat("./inner.bin").await.unwrap();
        assert_eq!(meta.name, "inner.bin");
        assert_eq!(meta.size, 700);
        assert_eq!(meta.mode, 0o644);

        let mut out = Vec::new();
        afs.open("inner.bin").await.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, inner);

        for path in [".", "", "folder/inner.bin", "missing.bin"] {
            let err = afs.open(path).await.err().unwrap();
            assert!(err.downcast_ref::<FsError>().is_some(), "{path}");
        }
    }

    #[tokio::test]
    async fn test_non_streamable_entry_refuses_open() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let data = test_bytes(300);
        let volumes = fixtures::rar4_split("outer", "inner.bin", &data, 1, Method::Compressed);
        let nzb = fetcher.nzb(&[(volumes[0].0.as_str(), &volumes[0].1[..])], 200);
        let fs: Arc<dyn FileSystem> = Arc::new(UsenetFs::new(&nzb, fetcher, 2));

        let mut archive = RarArchive::new(fs, vec!["outer.rar".to_string()]);
        archive.open(None).await.unwrap();
        let afs = ArchiveFs::new(archive.files().to_vec());
        assert_eq!(afs.stat("inner.bin").await.unwrap().size, 300);
        let err = afs.open("inner.bin").await.err().unwrap();
        assert!(err.to_string().contains("cannot be streamed"));
    }
}
