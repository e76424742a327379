use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("archive stream error: {0}")]
    Stream(#[from] io::Error),
}

/// Write a tar.gz of the data and sandbox directories. Directory basenames
/// become the top-level archive entries; missing directories are skipped.
pub fn export_state<W: Write>(
    data_dir: &Path,
    sandbox_dir: &Path,
    writer: W,
) -> Result<(), ArchiveError> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for dir in [data_dir, sandbox_dir] {
        if !dir.is_dir() {
            continue;
        }
        let name = archive_name(dir);
        builder
            .append_dir_all(&name, dir)
            .map_err(|source| ArchiveError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Extract the archive into a scratch directory, then copy the entries
/// matching the target basenames over the live directories.
pub fn import_state(
    archive: &Path,
    data_dir: &Path,
    sandbox_dir: &Path,
) -> Result<(), ArchiveError> {
    let scratch = tempfile::tempdir().map_err(|source| ArchiveError::Io {
        path: archive.to_path_buf(),
        source,
    })?;
    let file = File::open(archive).map_err(|source| ArchiveError::Io {
        path: archive.to_path_buf(),
        source,
    })?;
    tar::Archive::new(GzDecoder::new(file))
        .unpack(scratch.path())
        .map_err(|source| ArchiveError::Io {
            path: archive.to_path_buf(),
            source,
        })?;

    for target in [data_dir, sandbox_dir] {
        let source = scratch.path().join(archive_name(target));
        if !source.is_dir() {
            continue;
        }
        copy_tree(&source, target)?;
        info!(target = %target.display(), "Imported state directory");
    }
    Ok(())
}

fn archive_name(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string())
}

fn copy_tree(source: &Path, target: &Path) -> Result<(), ArchiveError> {
    fs::create_dir_all(target).map_err(|source| ArchiveError::Io {
        path: target.to_path_buf(),
        source,
    })?;
    let entries = fs::read_dir(source).map_err(|err| ArchiveError::Io {
        path: source.to_path_buf(),
        source: err,
    })?;
    for entry in entries {
        let entry = entry.map_err(|err| ArchiveError::Io {
            path: source.to_path_buf(),
            source: err,
        })?;
        let destination = target.join(entry.file_name());
        let path = entry.path();
        if path.is_dir() {
            copy_tree(&path, &destination)?;
        } else {
            fs::copy(&path, &destination).map_err(|err| ArchiveError::Io {
                path: path.clone(),
                source: err,
            })?;
        }
    }
    Ok(())
}
