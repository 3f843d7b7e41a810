//! Durable snapshot of the token registry.
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    commons::{
        error::{Error, SignerIoError},
        util::file,
        SignerEmptyResult, SignerResult,
    },
    constants::{SNAPSHOT_FILE, SNAPSHOT_LOCK_FILE, SNAPSHOT_VERSION},
    tokens::{TokenInfo, TokenRegistry},
};

//------------ Snapshot ------------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
struct Snapshot {
    version: u32,
    tokens: Vec<TokenInfo>,
}

//------------ SnapshotStore -------------------------------------------------

/// Reads and writes the registry snapshot in a data directory.
///
/// Writes go to a temporary file which is then renamed over the previous
/// snapshot, so a crash leaves either the old or the new snapshot. An
/// advisory file lock is held while reading or writing so that two
/// processes sharing a data directory do not interleave.
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path) -> SignerResult<Self> {
        file::create_dir(data_dir)?;
        Ok(SnapshotStore {
            path: file::file_path(data_dir, SNAPSHOT_FILE),
            lock_path: file::file_path(data_dir, SNAPSHOT_LOCK_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the registry.
    ///
    /// A missing snapshot gives an empty registry. A snapshot that exists
    /// but cannot be read or understood is an error: starting empty would
    /// silently lose the configuration.
    pub fn load(&self) -> SignerResult<TokenRegistry> {
        let lock = self.file_lock()?;
        let _guard = lock
            .read()
            .map_err(|e| SignerIoError::new(format!("cannot lock: {}", self.lock_path.to_string_lossy()), e))?;

        let snapshot: Option<Snapshot> = file::load_json(&self.path).map_err(|e| {
            if e.cause().kind() == io::ErrorKind::InvalidData {
                Error::StoreCorrupt(e.to_string())
            } else {
                Error::StoreIo(e)
            }
        })?;

        match snapshot {
            None => {
                info!("No token snapshot found at {}, starting empty", self.path.to_string_lossy());
                Ok(TokenRegistry::empty())
            }
            Some(snapshot) if snapshot.version != SNAPSHOT_VERSION => Err(Error::StoreCorrupt(format!(
                "unsupported snapshot version {} in {}",
                snapshot.version,
                self.path.to_string_lossy()
            ))),
            Some(snapshot) => {
                let registry = TokenRegistry::from_tokens(snapshot.tokens)?;
                info!(
                    "Loaded {} token(s) from {}",
                    registry.tokens().len(),
                    self.path.to_string_lossy()
                );
                Ok(registry)
            }
        }
    }

    /// Writes the registry, returning only once the write is durable.
    pub fn save(&self, registry: &TokenRegistry) -> SignerEmptyResult {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            tokens: registry.tokens().iter().map(TokenInfo::persistable).collect(),
        };

        let mut lock = self.file_lock()?;
        let _guard = lock
            .write()
            .map_err(|e| SignerIoError::new(format!("cannot lock: {}", self.lock_path.to_string_lossy()), e))?;

        file::save_json(&snapshot, &self.path).map_err(|e| {
            error!("Could not save token snapshot: {}", e);
            Error::StoreIo(e)
        })?;

        trace!("Saved token snapshot with {} token(s)", snapshot.tokens.len());
        Ok(())
    }

    fn file_lock(&self) -> Result<fd_lock::RwLock<File>, SignerIoError> {
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| {
                SignerIoError::new(
                    format!("failed to open lock file '{}'", self.lock_path.to_string_lossy()),
                    e,
                )
            })?;
        Ok(fd_lock::RwLock::new(lock_file))
    }
}

//------------ Tests ---------------------------------------------------------
