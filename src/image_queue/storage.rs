//! Queue storage - one file per image under the camera directory
//!
//! File name: `{sequence:020}_{captured_millis}_{t|u}.img`. The name carries
//! everything the index needs, so a restart rebuilds the queue with a single
//! directory scan.

use super::types::QueueEntry;
use crate::error::Result;
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const IMAGE_EXT: &str = "img";
const TMP_EXT: &str = "tmp";

#[derive(Debug, Clone)]
pub struct QueueStorage {
    dir: PathBuf,
}

impl QueueStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(sequence: u64, captured_at: DateTime<Utc>, time_trusted: bool) -> String {
        format!(
            "{:020}_{}_{}.{}",
            sequence,
            captured_at.timestamp_millis(),
            if time_trusted { "t" } else { "u" },
            IMAGE_EXT
        )
    }

    /// Parse a stored file name back into (sequence, captured_at, time_trusted)
    pub fn parse_name(name: &str) -> Option<(u64, DateTime<Utc>, bool)> {
        let stem = name.strip_suffix(&format!(".{}", IMAGE_EXT))?;
        let mut parts = stem.splitn(3, '_');
        let sequence = parts.next()?.parse().ok()?;
        let millis: i64 = parts.next()?.parse().ok()?;
        let trusted = match parts.next()? {
            "t" => true,
            "u" => false,
            _ => return None,
        };
        let captured_at = Utc.timestamp_millis_opt(millis).single()?;
        Some((sequence, captured_at, trusted))
    }

    /// Write image bytes; a crash mid-write leaves only a `.tmp` file
    pub async fn write(
        &self,
        sequence: u64,
        captured_at: DateTime<Utc>,
        time_trusted: bool,
        data: &[u8],
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;

        let final_path = self
            .dir
            .join(Self::file_name(sequence, captured_at, time_trusted));
        let tmp_path = final_path.with_extension(TMP_EXT);

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        Ok(final_path)
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path).await?)
    }

    /// Delete a stored image; already-gone is fine
    pub async fn delete(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to delete queue file");
            }
        }
    }

    /// Rebuild the index from disk, oldest sequence first
    ///
    /// Orphaned temp files and unparseable names are removed.
    pub async fn scan(&self) -> Result<Vec<QueueEntry>> {
        let mut entries = Vec::new();

        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let name = item.file_name().to_string_lossy().to_string();

            let meta = match item.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };

            match Self::parse_name(&name) {
                Some((sequence, captured_at, time_trusted)) => entries.push(QueueEntry {
                    sequence,
                    captured_at,
                    size_bytes: meta.len(),
                    time_trusted,
                    path,
                }),
                None => {
                    tracing::debug!(file = %name, "Removing stray queue file");
                    self.delete(&path).await;
                }
            }
        }

        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }
}
