use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};

/// Single JSON document on disk, read once and rewritten whole.
///
/// Writes go to a temporary file in the same directory which then replaces
/// the target, so a failed write never truncates a previously valid file.
#[derive(Debug, Clone)]
pub struct JsonStorage {
    path: PathBuf,
}

impl JsonStorage {
    pub fn new(path: impl Into<PathBuf>) -> MediaResult<Self> {
        let path = path.into();

        if path.as_os_str().is_empty() {
            return Err(MediaError::Config {
                path,
                reason: "path is empty".to_string(),
            });
        }
        if path.is_dir() {
            return Err(MediaError::Config {
                path,
                reason: "path is a directory".to_string(),
            });
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the document. `Ok(None)` means the file does not exist yet.
    pub fn read<T: DeserializeOwned>(&self) -> MediaResult<Option<T>> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("📁 {} does not exist yet", self.path.display());
                return Ok(None);
            }
            Err(source) => {
                return Err(MediaError::CacheIo {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|source| MediaError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    /// Serializes `value` as indented JSON and atomically replaces the file.
    pub fn write<T: Serialize>(&self, value: &T) -> MediaResult<()> {
        let io_err = |source: std::io::Error| MediaError::CacheIo {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(io_err)?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, value)
                .map_err(|e| io_err(std::io::Error::other(e)))?;
            writer.write_all(b"\n").map_err(io_err)?;
            writer.flush().map_err(io_err)?;
        }
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        debug!("💾 Wrote {}", self.path.display());
        Ok(())
    }

    /// Renames an undecodable file to `<path>.corrupt` so it is not
    /// overwritten by the next save.
    pub fn quarantine(&self) -> MediaResult<PathBuf> {
        let mut target = self.path.clone().into_os_string();
        target.push(".corrupt");
        let target = PathBuf::from(target);

        fs::rename(&self.path, &target).map_err(|source| MediaError::CacheIo {
            path: self.path.clone(),
            source,
        })?;
        warn!(
            "🗑️ Moved unreadable {} to {}",
            self.path.display(),
            target.display()
        );
        Ok(target)
    }
}
