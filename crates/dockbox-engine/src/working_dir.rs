use dockbox_core::{DockboxError, Result, UploadedFile};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::stream::StreamExt;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::traits::{is_conflict, ContainerRuntime};

/// A runtime volume mounted at the same path in every container of a session,
/// so files produced by one run are visible to the next.
///
/// Created through [`crate::Engine::open`]. Runs sharing a working directory
/// must be sequenced by the caller; the volume has no locking of its own.
pub struct WorkingDirectory {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    path: String,
    opened: bool,
    closed: Arc<AtomicBool>,
}

impl WorkingDirectory {
    pub(crate) fn new(runtime: Arc<dyn ContainerRuntime>, path: String) -> Self {
        Self {
            runtime,
            name: format!("sandbox-{}", Uuid::new_v4()),
            path,
            opened: false,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Name of the backing volume.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mount path inside containers.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.opened && !self.is_closed()
    }

    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }

    /// Creates the backing volume. Creating a volume that already exists is a no-op.
    #[instrument(skip(self), fields(volume = %self.name))]
    pub async fn open(&mut self) -> Result<()> {
        self.runtime
            .create_volume(&self.name)
            .await
            .map_err(|e| DockboxError::runtime("create_volume", e))?;

        self.opened = true;
        self.closed.store(false, Ordering::SeqCst);
        info!("Opened working directory {} at {}", self.name, self.path);
        Ok(())
    }

    /// Packs `files` into a gzip tar archive and extracts it at the mount path
    /// of `container_id`. Directories are added recursively.
    #[instrument(skip(self, files), fields(volume = %self.name, files = files.len()))]
    pub async fn add_files(&self, container_id: &str, files: &[UploadedFile]) -> Result<()> {
        if !self.is_open() {
            return Err(DockboxError::WorkingDirectoryClosed(self.name.clone()));
        }
        if files.is_empty() {
            return Ok(());
        }

        let prefix = self.name.clone();
        let owned = files.to_vec();
        let archive = tokio::task::spawn_blocking(move || build_archive(&prefix, &owned))
            .await
            .map_err(|e| DockboxError::Internal(format!("Archive task failed: {}", e)))?
            .map_err(DockboxError::Archive)?;

        let file = tokio::fs::File::open(archive.path())
            .await
            .map_err(DockboxError::Archive)?;
        debug!("Uploading {:?} to {}:{}", archive.path(), container_id, self.path);

        self.runtime
            .upload_archive(container_id, &self.path, ReaderStream::new(file).boxed())
            .await
            .map_err(|e| DockboxError::runtime("upload_archive", e))?;

        // Dropping the handle deletes the temporary archive
        drop(archive);
        Ok(())
    }

    /// Removes the backing volume. Every container using it must have been
    /// removed first, otherwise [`DockboxError::VolumeInUse`] is returned and
    /// the directory stays open.
    #[instrument(skip(self), fields(volume = %self.name))]
    pub async fn close(&mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        match self.runtime.remove_volume(&self.name).await {
            Ok(()) => {
                self.opened = false;
                self.closed.store(true, Ordering::SeqCst);
                info!("Closed working directory {}", self.name);
                Ok(())
            }
            Err(e) if is_conflict(&e) => Err(DockboxError::VolumeInUse {
                volume: self.name.clone(),
                source: Box::new(e),
            }),
            Err(e) => Err(DockboxError::runtime("remove_volume", e)),
        }
    }
}

impl std::fmt::Debug for WorkingDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingDirectory")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("opened", &self.opened)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Writes `files` into a temporary `.tar.gz` and returns its handle.
fn build_archive(prefix: &str, files: &[UploadedFile]) -> io::Result<NamedTempFile> {
    let archive = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".tar.gz")
        .tempfile()?;

    {
        let encoder = GzEncoder::new(archive.as_file(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for file in files {
            append_entry(&mut builder, &file.path, Path::new(&file.name))?;
        }

        builder.into_inner()?.finish()?.flush()?;
    }

    Ok(archive)
}

/// Adds `path` under `entry_name`; a directory entry is written before its children.
fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    entry_name: &Path,
) -> io::Result<()> {
    if path.is_dir() {
        builder.append_dir(entry_name, path)?;

        let mut children = std::fs::read_dir(path)?.collect::<io::Result<Vec<_>>>()?;
        children.sort_by_key(|child| child.file_name());

        for child in children {
            append_entry(builder, &child.path(), &entry_name.join(child.file_name()))?;
        }
    } else {
        let mut file = File::open(path)?;
        builder.append_file(entry_name, &mut file)?;
    }

    Ok(())
}
