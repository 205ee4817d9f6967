//! Filesystem-backed batch storage, for single-host deployments and tests.

use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    time::SystemTime,
};

use anyhow::Context as _;
use async_trait::async_trait;
use common::types::{
    BatchFileName,
    RunId,
    TickRange,
    TickRecord,
};
use tempfile::TempDir;

use crate::{
    batch_format::{
        decode_batch,
        encode_batch,
    },
    BatchListPage,
    BatchStorage,
    RunInfo,
};

pub struct LocalDirStorage {
    dir: PathBuf,
    _temp_dir: Option<Arc<TempDir>>,
}

impl std::fmt::Debug for LocalDirStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDirStorage")
            .field("dir", &self.dir)
            .finish()
    }
}

impl LocalDirStorage {
    /// Storage in a temporary directory that is deleted on drop.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = TempDir::new()?;
        Ok(Self {
            dir: temp_dir.path().to_owned(),
            _temp_dir: Some(Arc::new(temp_dir)),
        })
    }

    pub fn new_at_path(dir: PathBuf) -> anyhow::Result<Self> {
        let dir = if dir.is_absolute() {
            dir
        } else {
            std::env::current_dir()?.join(dir)
        };
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            _temp_dir: None,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.dir
    }

    /// Write a batch file the way the persistence service does: temp file,
    /// fsync, rename. Listers never observe a partial file. The filename is
    /// derived from the first and last tick of `ticks`.
    pub fn publish_batch(
        &self,
        prefix: &str,
        ticks: &[TickRecord],
    ) -> anyhow::Result<BatchFileName> {
        anyhow::ensure!(!ticks.is_empty(), "refusing to publish an empty batch");
        let range = TickRange::new(
            ticks.first().expect("nonempty").tick_number,
            ticks.last().expect("nonempty").tick_number,
        )?;
        let filename = BatchFileName::from_range(range);
        let parent = self.dir.join(prefix.trim_end_matches('/'));
        fs::create_dir_all(&parent)?;
        let temp_path = parent.join(format!(".{}.tmp", filename.as_str()));
        let final_path = parent.join(filename.as_str());
        {
            let mut file = fs::File::create(&temp_path)?;
            std::io::Write::write_all(&mut file, &encode_batch(ticks)?)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &final_path)?;
        Ok(filename)
    }

    fn published_files(&self, prefix: &str) -> anyhow::Result<Vec<BatchFileName>> {
        let parent = self.dir.join(prefix.trim_end_matches('/'));
        let entries = match fs::read_dir(&parent) {
            Ok(entries) => entries,
            // A run whose prefix has not been written yet is just empty.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).context(format!("listing {}", parent.display())),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            // In-flight temp files and anything else that does not match the
            // batch grammar are invisible to readers.
            if let Ok(parsed) = name.to_string_lossy().parse::<BatchFileName>() {
                files.push(parsed);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn page(
    files: impl Iterator<Item = BatchFileName>,
    continuation_token: Option<&str>,
    max_count: usize,
) -> BatchListPage {
    let files: Vec<_> = files
        .filter(|f| match continuation_token {
            Some(token) => f.as_str() > token,
            None => true,
        })
        .take(max_count)
        .collect();
    let next_token = files
        .last()
        .map(|f| f.as_str().to_owned())
        .or_else(|| continuation_token.map(str::to_owned));
    BatchListPage { files, next_token }
}

#[async_trait]
impl BatchStorage for LocalDirStorage {
    async fn list_batch_files(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
        max_count: usize,
    ) -> anyhow::Result<BatchListPage> {
        let files = self.published_files(prefix)?;
        Ok(page(files.into_iter(), continuation_token, max_count))
    }

    async fn list_batch_files_in_range(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
        max_count: usize,
        range: TickRange,
    ) -> anyhow::Result<BatchListPage> {
        let files = self.published_files(prefix)?;
        Ok(page(
            files.into_iter().filter(|f| f.range().intersects(&range)),
            continuation_token,
            max_count,
        ))
    }

    async fn read_batch(
        &self,
        prefix: &str,
        filename: &BatchFileName,
    ) -> anyhow::Result<Vec<TickRecord>> {
        let path = self
            .dir
            .join(prefix.trim_end_matches('/'))
            .join(filename.as_str());
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        decode_batch(&bytes).with_context(|| format!("decoding {}", path.display()))
    }

    async fn list_runs(&self) -> anyhow::Result<Vec<RunInfo>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let run_id: RunId = match entry.file_name().to_string_lossy().parse() {
                Ok(run_id) => run_id,
                Err(_) => continue,
            };
            let metadata = entry.metadata()?;
            let first_seen = metadata.created().or_else(|_| metadata.modified())?;
            runs.push(RunInfo { run_id, first_seen });
        }
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use common::types::TickRecord;

    use super::*;

    fn ticks(start: i64, end: i64, interval: i64) -> Vec<TickRecord> {
        (start..=end)
            .step_by(interval as usize)
            .map(|tick_number| TickRecord {
                tick_number,
                payload: tick_number.to_be_bytes().to_vec(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_listing_is_ordered_and_paged() -> anyhow::Result<()> {
        let storage = LocalDirStorage::new()?;
        // Publish out of order; listing must come back sorted.
        for (s, e) in [(2000, 2990), (0, 990), (1000, 1990)] {
            storage.publish_batch("run1/", &ticks(s, e, 10))?;
        }

        let first = storage.list_batch_files("run1/", None, 2).await?;
        assert_eq!(
            first.files.iter().map(|f| f.tick_start()).collect::<Vec<_>>(),
            vec![0, 1000]
        );
        let second = storage
            .list_batch_files("run1/", first.next_token.as_deref(), 2)
            .await?;
        assert_eq!(
            second.files.iter().map(|f| f.tick_start()).collect::<Vec<_>>(),
            vec![2000]
        );

        // Exhausted: empty page, token carried through.
        let third = storage
            .list_batch_files("run1/", second.next_token.as_deref(), 2)
            .await?;
        assert!(third.files.is_empty());
        assert_eq!(third.next_token, second.next_token);
        Ok(())
    }

    #[tokio::test]
    async fn test_unpublished_and_foreign_files_are_invisible() -> anyhow::Result<()> {
        let storage = LocalDirStorage::new()?;
        storage.publish_batch("run1/", &ticks(0, 990, 10))?;
        let dir = storage.path().join("run1");
        fs::write(dir.join(".batch_x.tmp"), b"partial")?;
        fs::write(dir.join("notes.txt"), b"hello")?;

        let listing = storage.list_batch_files("run1/", None, 10).await?;
        assert_eq!(listing.files.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_range_listing_includes_straddling_batches() -> anyhow::Result<()> {
        let storage = LocalDirStorage::new()?;
        storage.publish_batch("run1/", &ticks(500, 1500, 10))?;
        storage.publish_batch("run1/", &ticks(5000, 5990, 10))?;

        let range = TickRange::new(1000, 2990)?;
        let listing = storage
            .list_batch_files_in_range("run1/", None, 10, range)
            .await?;
        assert_eq!(
            listing.files.iter().map(|f| f.tick_start()).collect::<Vec<_>>(),
            vec![500]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_read_back_round_trips() -> anyhow::Result<()> {
        let storage = LocalDirStorage::new()?;
        let published = ticks(0, 990, 10);
        let filename = storage.publish_batch("run1/", &published)?;
        assert_eq!(storage.read_batch("run1/", &filename).await?, published);
        Ok(())
    }
}
