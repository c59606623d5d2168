//! Locates the file a finished job left in the downloads directory.
//!
//! Files carrying the `{job_id}_` prefix win, newest first. When none match,
//! the newest file in the whole directory is taken; two jobs finishing at the
//! same moment on that branch can pick each other's output.

use std::{
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Download completed but file not found")]
    NoOutput,
    #[error("could not read downloads directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub async fn resolve_output_file(downloads_dir: &Path, job_id: &str) -> Result<PathBuf, ResolveError> {
    let files = list_files(downloads_dir).await?;
    let prefix = format!("{job_id}_");

    let matching = files
        .iter()
        .filter(|(path, _)| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix))
        })
        .max_by_key(|(_, modified)| *modified);

    if let Some((path, _)) = matching {
        return Ok(path.clone());
    }

    let (latest, _) = files
        .into_iter()
        .max_by_key(|(_, modified)| *modified)
        .ok_or(ResolveError::NoOutput)?;

    warn!(
        "No file with prefix {prefix:?} in {:?}; falling back to newest file {:?}",
        downloads_dir, latest
    );
    Ok(latest)
}

async fn list_files(dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>, ResolveError> {
    let io_error = |source: io::Error| ResolveError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_error)?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
            Err(error) => return Err(io_error(error)),
        };
        if !metadata.is_file() {
            continue;
        }

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((entry.path(), modified));
    }

    Ok(files)
}
