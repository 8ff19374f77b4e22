//! Per-job exclusive working directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use super::fs::{ensure_dir_all, remove_dir_all_if_exists};
use crate::domain::JobId;
use crate::{Error, Result};

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    allocated: DashMap<JobId, PathBuf>,
}

/// Allocates one directory per job under a common root.
#[derive(Debug, Clone)]
pub struct TempAreaManager {
    inner: Arc<Inner>,
}

impl TempAreaManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                allocated: DashMap::new(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Create the root and remove leftovers of previous runs.
    pub async fn start(&self) -> Result<()> {
        ensure_dir_all(&self.inner.root).await?;

        let mut entries = tokio::fs::read_dir(&self.inner.root)
            .await
            .map_err(|e| Error::io_path("reading directory", &self.inner.root, e))?;
        let mut removed = 0usize;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let result = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => tokio::fs::remove_dir_all(&path).await,
                Ok(_) => tokio::fs::remove_file(&path).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove leftover"),
            }
        }
        if removed > 0 {
            info!(root = %self.inner.root.display(), removed, "Removed temp leftovers");
        }
        Ok(())
    }

    /// Remove every area still allocated.
    pub async fn shutdown(&self) {
        let paths: Vec<(JobId, PathBuf)> = self
            .inner
            .allocated
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (job_id, path) in paths {
            if let Err(e) = remove_dir_all_if_exists(&path).await {
                warn!(job_id = %job_id, error = %e, "Failed to remove temp area");
            }
            self.inner.allocated.remove(&job_id);
        }
    }

    /// Create the job's directory. Fails if the job already has one.
    pub async fn allocate(&self, job_id: &JobId) -> Result<TempArea> {
        let path = self.inner.root.join(job_id.as_str());
        match self.inner.allocated.entry(job_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::invariant(format!(
                    "temp area already allocated for job {job_id}"
                )));
            }
            Entry::Vacant(v) => {
                v.insert(path.clone());
            }
        }

        if let Err(e) = tokio::fs::create_dir_all(&path).await {
            self.inner.allocated.remove(job_id);
            return Err(Error::io_path("creating temp area", &path, e));
        }
        debug!(job_id = %job_id, path = %path.display(), "Allocated temp area");
        Ok(TempArea {
            manager: self.clone(),
            job_id: job_id.clone(),
            path,
            destroyed: false,
        })
    }

    pub fn is_allocated(&self, job_id: &JobId) -> bool {
        self.inner.allocated.contains_key(job_id)
    }

    pub fn allocated_count(&self) -> usize {
        self.inner.allocated.len()
    }
}

/// A job's working directory, removed on [`TempArea::destroy`] or drop.
#[derive(Debug)]
pub struct TempArea {
    manager: TempAreaManager,
    job_id: JobId,
    path: PathBuf,
    destroyed: bool,
}

impl TempArea {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub async fn destroy(mut self) -> Result<()> {
        self.destroyed = true;
        self.manager.inner.allocated.remove(&self.job_id);
        remove_dir_all_if_exists(&self.path).await?;
        debug!(job_id = %self.job_id, "Destroyed temp area");
        Ok(())
    }
}

impl Drop for TempArea {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        self.manager.inner.allocated.remove(&self.job_id);
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Failed to remove temp area on drop")
            }
        }
    }
}
