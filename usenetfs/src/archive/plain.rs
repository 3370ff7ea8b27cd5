use std::sync::Arc;

use async_trait::async_trait;

use super::{Archive, ArchiveError, ArchiveFile};
use crate::fs::{Extent, FileSystem};

/// Presents plain files as the entries of a pass-through archive.
pub struct PlainArchive {
    fs: Arc<dyn FileSystem>,
    names: Vec<String>,
    files: Vec<ArchiveFile>,
}

impl PlainArchive {
    pub fn new(fs: Arc<dyn FileSystem>, names: Vec<String>) -> Self {
        Self {
            fs,
            names,
            files: Vec::new(),
        }
    }
}

#[async_trait]
impl Archive for PlainArchive {
    async fn open(&mut self, _password: Option<&str>) -> anyhow::Result<()> {
        if self.names.is_empty() {
            return Err(ArchiveError::NoVolumes.into());
        }
        let mut files = Vec::with_capacity(self.names.len());
        for name in &self.names {
            let meta = self.fs.stat(name).await?;
            files.push(ArchiveFile::new(
                name.clone(),
                meta.size,
                meta.size,
                true,
                vec![Extent::new(name.clone(), 0, meta.size)],
                self.fs.clone(),
            ));
        }
        self.files = files;
        Ok(())
    }

    async fn close(&mut self) {
        self.files.clear();
    }

    fn files(&self) -> &[ArchiveFile] {
        &self.files
    }

    fn is_streamable(&self) -> bool {
        true
    }
}
