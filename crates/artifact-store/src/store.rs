//! File-based artifact storage with atomic commits

use crate::error::{Result, StoreError};
use crate::types::{PurgeEvent, PurgeSelector, StoreCount, StoreStats, PURGE_HISTORY_LEN};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::fs::Metadata;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Span};

/// Anything that can drop entries matching a [`PurgeSelector`]
#[async_trait]
pub trait Purger: Send + Sync {
    /// Remove matching entries, returning how many were removed
    async fn purge(&self, selector: PurgeSelector) -> Result<u64>;
}

#[derive(Debug, Default)]
struct Counters {
    hit: u64,
    miss: u64,
    purge_history: VecDeque<PurgeEvent>,
}

/// Artifact store rooted at a directory, keyed by request path
pub struct ArtifactStore {
    /// Directory holding committed entries and in-flight writes
    root: PathBuf,
    /// Serializes namespace changes: directory creation, open, rename,
    /// removal and directory listing. Never held while data is copied.
    layout: Arc<Mutex<()>>,
    /// Hit/miss/purge bookkeeping, independent of `layout`
    counters: parking_lot::Mutex<Counters>,
    span: Span,
}

impl ArtifactStore {
    /// Create a store rooted at `root`; events are logged under `span`
    pub fn new(root: impl Into<PathBuf>, span: Span) -> Self {
        Self {
            root: root.into(),
            layout: Arc::new(Mutex::new(())),
            counters: parking_lot::Mutex::new(Counters::default()),
            span,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure the root directory exists
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;
        info!(parent: &self.span, root = ?self.root, "Store initialized");
        Ok(())
    }

    /// Map a key onto a path below the root
    fn entry_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        let mut path = self.root.clone();
        let mut depth = 0;

        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StoreError::InvalidKey {
                        key: key.to_string(),
                    })
                }
            }
        }

        if depth == 0 {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(path)
    }

    /// Open a committed entry, returning the open file and its size.
    ///
    /// The structural lock is only held while the file is opened and
    /// inspected; reading happens on the returned handle without it.
    pub async fn get(&self, key: &str) -> Result<(File, u64)> {
        let path = self.entry_path(key)?;

        let opened = {
            let _layout = self.layout.lock().await;
            open_entry(&path).await
        };

        match opened {
            Ok((file, size)) => {
                self.counters.lock().hit += 1;
                debug!(parent: &self.span, key, size, "Store hit");
                Ok((file, size))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.counters.lock().miss += 1;
                debug!(parent: &self.span, key, "Store miss");
                Err(StoreError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => {
                warn!(parent: &self.span, key, error = %e, "Store get failed");
                Err(StoreError::io(path, e))
            }
        }
    }

    /// Start writing a new entry for `key`.
    ///
    /// The data lands in `<name>.part.<suffix>` next to the final location
    /// and stays invisible to [`get`](Self::get) until committed.
    pub async fn put(&self, key: &str) -> Result<PartialWrite> {
        let target = self.entry_path(key)?;
        let (dir, name) = match (target.parent(), target.file_name()) {
            (Some(dir), Some(name)) => (dir.to_path_buf(), name.to_string_lossy().into_owned()),
            _ => {
                return Err(StoreError::InvalidKey {
                    key: key.to_string(),
                })
            }
        };

        let _layout = self.layout.lock().await;

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let prefix = format!("{}.part.", name);
        let temp_dir = dir.clone();
        let (file, current) = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .rand_bytes(8)
                .tempfile_in(&temp_dir)?
                .keep()
                .map_err(|e| e.error)
        })
        .await
        .map_err(|e| StoreError::io(&dir, io::Error::other(e)))?
        .map_err(|e| {
            warn!(parent: &self.span, key, error = %e, "Store put failed");
            StoreError::io(&dir, e)
        })?;

        debug!(parent: &self.span, key, temp = ?current, "Opened partial entry");

        Ok(PartialWrite {
            file: Some(File::from_std(file)),
            target,
            current,
            aborted: false,
            finished: false,
            layout: Arc::clone(&self.layout),
            span: self.span.clone(),
        })
    }

    /// Count entries and their total size
    pub async fn count(&self) -> Result<StoreCount> {
        let files = self.list_files().await?;
        let count = files.iter().fold(StoreCount::default(), |acc, (_, meta)| {
            StoreCount {
                items: acc.items + 1,
                total_size: acc.total_size + meta.len(),
            }
        });
        debug!(parent: &self.span, items = count.items, total_size = count.total_size, "Store counted");
        Ok(count)
    }

    /// Remove every entry matched by `selector`.
    ///
    /// Removal failures do not stop the sweep. The first one is returned
    /// together with the number of entries that were removed, and no purge
    /// event is recorded for that run.
    pub async fn purge(&self, selector: PurgeSelector) -> Result<u64> {
        self.purge_with(selector, |path: PathBuf| fs::remove_file(path))
            .await
    }

    async fn purge_with<F, Fut>(&self, selector: PurgeSelector, mut remove: F) -> Result<u64>
    where
        F: FnMut(PathBuf) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        let files = self.list_files().await?;
        let now = SystemTime::now();

        let mut removed = 0u64;
        let mut first_failure: Option<(PathBuf, io::Error)> = None;

        for (path, meta) in files {
            if !is_selected(&selector, &meta, now) {
                continue;
            }

            let result = {
                let _layout = self.layout.lock().await;
                remove(path.clone()).await
            };

            match result {
                Ok(()) => {
                    removed += 1;
                    debug!(parent: &self.span, path = ?path, "Purged entry");
                }
                Err(e) => {
                    warn!(parent: &self.span, path = ?path, error = %e, "Failed to purge entry");
                    if first_failure.is_none() {
                        first_failure = Some((path, e));
                    }
                }
            }
        }

        if let Some((path, source)) = first_failure {
            return Err(StoreError::Purge {
                removed,
                path,
                source,
            });
        }

        self.record_purge(removed);
        info!(parent: &self.span, removed, older_than = ?selector.older_than, "Store purged");
        Ok(removed)
    }

    /// Snapshot of the hit/miss counters and purge history
    pub fn stats(&self) -> StoreStats {
        let counters = self.counters.lock();
        StoreStats {
            hit: counters.hit,
            miss: counters.miss,
            purge_history: counters.purge_history.iter().cloned().collect(),
        }
    }

    fn record_purge(&self, removed: u64) {
        let mut counters = self.counters.lock();
        counters.purge_history.push_back(PurgeEvent {
            when: Utc::now(),
            removed,
        });
        while counters.purge_history.len() > PURGE_HISTORY_LEN {
            counters.purge_history.pop_front();
        }
    }

    /// Walk the whole tree, collecting every non-directory entry
    async fn list_files(&self) -> Result<Vec<(PathBuf, Metadata)>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let _layout = self.layout.lock().await;

            let walk_err = |e: io::Error| StoreError::Walk {
                path: dir.clone(),
                source: e,
            };

            let mut entries = fs::read_dir(&dir).await.map_err(walk_err)?;
            while let Some(entry) = entries.next_entry().await.map_err(walk_err)? {
                let path = entry.path();
                let meta = entry.metadata().await.map_err(|e| StoreError::Walk {
                    path: path.clone(),
                    source: e,
                })?;
                if meta.is_dir() {
                    pending.push(path);
                } else {
                    files.push((path, meta));
                }
            }
        }

        Ok(files)
    }
}

#[async_trait]
impl Purger for ArtifactStore {
    async fn purge(&self, selector: PurgeSelector) -> Result<u64> {
        ArtifactStore::purge(self, selector).await
    }
}

async fn open_entry(path: &Path) -> io::Result<(File, u64)> {
    let file = File::open(path).await?;
    let meta = file.metadata().await?;
    if meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "entry is a directory",
        ));
    }
    Ok((file, meta.len()))
}

fn is_selected(selector: &PurgeSelector, meta: &Metadata, now: SystemTime) -> bool {
    if selector.removes_everything() {
        return true;
    }
    meta.modified()
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .map(|age| age > selector.older_than)
        .unwrap_or(false)
}

/// An in-flight write for one entry.
///
/// Ends with exactly one of [`commit`](Self::commit) or
/// [`abort`](Self::abort). Dropping it without either discards the data.
#[derive(Debug)]
pub struct PartialWrite {
    file: Option<File>,
    target: PathBuf,
    current: PathBuf,
    aborted: bool,
    finished: bool,
    layout: Arc<Mutex<()>>,
    span: Span,
}

impl PartialWrite {
    /// Final location of the entry
    #[cfg(test)]
    fn target(&self) -> &Path {
        &self.target
    }

    /// Location of the data while the write is in flight
    #[cfg(test)]
    fn current(&self) -> &Path {
        &self.current
    }

    #[cfg(test)]
    fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let file = match self.file.as_mut() {
            Some(file) if !self.aborted => file,
            _ => {
                return Err(StoreError::io(
                    &self.current,
                    io::Error::other("partial entry already closed"),
                ))
            }
        };
        file.write_all(buf)
            .await
            .map_err(|e| StoreError::io(&self.current, e))
    }

    /// Close the data file and rename it onto the target.
    ///
    /// A no-op if the write was aborted.
    pub async fn commit(mut self) -> Result<()> {
        self.finished = true;

        if self.aborted {
            debug!(parent: &self.span, target = ?self.target, "Skipping commit of aborted entry");
            return Ok(());
        }

        if let Err(e) = self.close().await {
            let _ = fs::remove_file(&self.current).await;
            return Err(StoreError::io(&self.current, e));
        }

        debug!(parent: &self.span, from = ?self.current, to = ?self.target, "Committing entry");
        let renamed = {
            let _layout = self.layout.lock().await;
            fs::rename(&self.current, &self.target).await
        };

        if let Err(e) = renamed {
            warn!(parent: &self.span, target = ?self.target, error = %e, "Commit failed");
            let _ = fs::remove_file(&self.current).await;
            return Err(StoreError::io(&self.target, e));
        }
        Ok(())
    }

    /// Discard the written data, leaving the target untouched
    pub async fn abort(&mut self) -> Result<()> {
        if self.aborted {
            return Ok(());
        }
        self.aborted = true;
        debug!(parent: &self.span, temp = ?self.current, "Discarding entry");

        // Close errors are irrelevant, the data is thrown away.
        self.file.take();

        let removed = {
            let _layout = self.layout.lock().await;
            fs::remove_file(&self.current).await
        };
        match removed {
            Ok(()) => Ok(()),
            // A purge may have swept the file already.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.current, e)),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

impl Drop for PartialWrite {
    fn drop(&mut self) {
        if self.finished || self.aborted {
            return;
        }
        self.file.take();
        if let Err(e) = std::fs::remove_file(&self.current) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(parent: &self.span, temp = ?self.current, error = %e, "Failed to remove abandoned entry");
            }
        }
    }
}
