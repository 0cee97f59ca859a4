//! Cassette persistence: JSON by default, optional binary container

#[cfg(feature = "binary")]
mod format;
#[cfg(feature = "binary")]
mod reader;
#[cfg(feature = "binary")]
mod writer;

#[cfg(feature = "binary")]
pub use format::{FileHeader, CONTAINER_VERSION_MAJOR, FILE_MAGIC, HEADER_SIZE};

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cassette::{self, Cassette};
use crate::config::StorageFormat;
use crate::{ReelError, Result};

#[cfg(feature = "binary")]
const KIND_HTTP: u8 = 1;
#[cfg(feature = "binary")]
const KIND_WEBSOCKET: u8 = 2;
#[cfg(feature = "binary")]
const PAYLOAD_TEXT: u8 = 1;
#[cfg(feature = "binary")]
const PAYLOAD_BINARY: u8 = 2;
#[cfg(feature = "binary")]
const PAYLOAD_PING: u8 = 3;
#[cfg(feature = "binary")]
const PAYLOAD_PONG: u8 = 4;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Leading part of a JSON cassette, read before committing to a schema
#[derive(Deserialize)]
struct VersionHeader {
    version: String,
}

/// Loads and saves cassettes under one directory
#[derive(Debug, Clone)]
pub struct CassetteStore {
    dir: PathBuf,
    format: StorageFormat,
}

impl CassetteStore {
    /// Store rooted at `dir`, writing `format` on save
    pub fn new(dir: impl Into<PathBuf>, format: StorageFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    /// Storage directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a cassette would have in `format`
    #[must_use]
    pub fn path_for(&self, name: &str, format: StorageFormat) -> PathBuf {
        self.dir.join(format!("{name}.{}", format.extension()))
    }

    /// Whether a cassette file exists for `name` in any format
    ///
    /// # Errors
    ///
    /// Returns error if the name is invalid
    pub fn exists(&self, name: &str) -> Result<bool> {
        validate_cassette_name(name)?;
        Ok(self.path_for(name, StorageFormat::Json).is_file()
            || self.path_for(name, StorageFormat::Binary).is_file())
    }

    /// Load a cassette by name, preferring JSON when both formats exist
    ///
    /// # Errors
    ///
    /// - `NotFound` if no file exists in any format
    /// - `UnsupportedFormat` if only a binary file exists and this build
    ///   lacks the `binary` feature, or the schema major version is unknown
    /// - `InvalidFormat`/`CorruptedData`/`Io` if the file cannot be read
    pub fn load(&self, name: &str) -> Result<Cassette> {
        validate_cassette_name(name)?;

        let json_path = self.path_for(name, StorageFormat::Json);
        let binary_path = self.path_for(name, StorageFormat::Binary);

        let cassette = if json_path.is_file() {
            debug!("Loading cassette: {}", json_path.display());
            let data = fs::read(&json_path)?;
            let header = serde_json::from_slice::<VersionHeader>(&data)?;
            cassette::check_version(name, &header.version)?;
            serde_json::from_slice::<Cassette>(&data)?
        } else if binary_path.is_file() {
            debug!("Loading cassette: {}", binary_path.display());
            read_binary(name, &binary_path)?
        } else {
            return Err(ReelError::NotFound(name.to_string()));
        };

        cassette.check_version()?;

        info!(
            "Loaded cassette '{}': {} interactions, {} cookies",
            name,
            cassette.interactions.len(),
            cassette.cookies.len()
        );

        Ok(cassette)
    }

    /// Persist a cassette, replacing any existing file of the same name.
    ///
    /// The file is written to a temporary sibling, synced, then renamed
    /// over the target, so readers see either the old or the new cassette.
    ///
    /// # Errors
    ///
    /// Returns error if the name is invalid, the format is not built in, or
    /// any write fails
    pub fn save(&self, cassette: &Cassette) -> Result<()> {
        validate_cassette_name(&cassette.name)?;

        let data = match self.format {
            StorageFormat::Json => {
                let mut data = serde_json::to_vec_pretty(cassette)?;
                data.push(b'\n');
                data
            }
            StorageFormat::Binary => encode_binary(cassette)?,
        };

        fs::create_dir_all(&self.dir)?;
        let target = self.path_for(&cassette.name, self.format);
        write_atomic(&target, &data)?;

        // A stale JSON sibling would shadow the binary file on the next load
        if self.format == StorageFormat::Binary {
            let shadow = self.path_for(&cassette.name, StorageFormat::Json);
            if shadow.is_file() {
                warn!("Removing stale cassette {}", shadow.display());
                fs::remove_file(&shadow)?;
            }
        }

        info!(
            "Saved cassette '{}': {} interactions, {} bytes",
            cassette.name,
            cassette.interactions.len(),
            data.len()
        );

        Ok(())
    }
}

fn write_atomic(target: &Path, data: &[u8]) -> Result<()> {
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ReelError::InvalidCassetteName(target.display().to_string()))?;
    let temp = target.with_file_name(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let result = (|| -> Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp, target)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

#[cfg(feature = "binary")]
fn read_binary(_name: &str, path: &Path) -> Result<Cassette> {
    let data = fs::read(path)?;
    reader::decode(&data)
}

#[cfg(not(feature = "binary"))]
fn read_binary(name: &str, path: &Path) -> Result<Cassette> {
    Err(ReelError::UnsupportedFormat {
        name: name.to_string(),
        reason: format!(
            "{} is a binary cassette and this build lacks the `binary` feature",
            path.display()
        ),
    })
}

#[cfg(feature = "binary")]
fn encode_binary(cassette: &Cassette) -> Result<Vec<u8>> {
    writer::encode(cassette)
}

#[cfg(not(feature = "binary"))]
fn encode_binary(cassette: &Cassette) -> Result<Vec<u8>> {
    Err(ReelError::UnsupportedFormat {
        name: cassette.name.clone(),
        reason: "this build lacks the `binary` feature".to_string(),
    })
}

/// Validate cassette name
///
/// # Errors
///
/// Returns error if name is empty, too long, or could escape the storage
/// directory
pub fn validate_cassette_name(name: &str) -> Result<()> {
    // Check length
    if name.is_empty() {
        return Err(ReelError::InvalidCassetteName(
            "Cassette name cannot be empty".to_string(),
        ));
    }

    if name.len() > 255 {
        return Err(ReelError::InvalidCassetteName(format!(
            "Cassette name too long: {} > 255",
            name.len()
        )));
    }

    // Check for path separators
    if name.contains('/') || name.contains('\\') {
        return Err(ReelError::InvalidCassetteName(
            "Cassette name cannot contain path separators".to_string(),
        ));
    }

    // Check for hidden files
    if name.starts_with('.') {
        return Err(ReelError::InvalidCassetteName(
            "Cassette name cannot start with dot".to_string(),
        ));
    }

    if name.chars().any(char::is_control) {
        return Err(ReelError::InvalidCassetteName(
            "Cassette name cannot contain control characters".to_string(),
        ));
    }

    Ok(())
}
