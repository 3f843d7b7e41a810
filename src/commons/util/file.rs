use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};

use crate::commons::error::SignerIoError;

/// Creates a sub dir if needed, return full path to it
pub fn sub_dir(base: &Path, name: &str) -> Result<PathBuf, SignerIoError> {
    let mut full_path = base.to_path_buf();
    full_path.push(name);
    create_dir(&full_path)?;
    Ok(full_path)
}

pub fn create_dir(dir: &Path) -> Result<(), SignerIoError> {
    if !dir.is_dir() {
        fs::create_dir_all(dir)
            .map_err(|e| SignerIoError::new(format!("could not create dir: {}", dir.to_string_lossy()), e))?;
    }
    Ok(())
}

/// Derive the path for this file.
pub fn file_path(base_path: &Path, file_name: &str) -> PathBuf {
    let mut path = base_path.to_path_buf();
    path.push(file_name);
    path
}

/// Saves a file atomically.
///
/// The content is written to a temporary file in the same directory,
/// synced and then renamed over the target. Readers (and a crashed
/// process restarting) see either the old or the new content, never a
/// partial write.
pub fn save_atomic(content: &[u8], full_path: &Path) -> Result<(), SignerIoError> {
    let dir = full_path.parent().ok_or_else(|| {
        SignerIoError::new(
            format!("no parent directory for: {}", full_path.to_string_lossy()),
            io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"),
        )
    })?;
    create_dir(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| SignerIoError::new(format!("could not create temp file in: {}", dir.to_string_lossy()), e))?;

    tmp.write_all(content)
        .map_err(|e| SignerIoError::new(format!("could not write temp file for: {}", full_path.to_string_lossy()), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| SignerIoError::new(format!("could not sync temp file for: {}", full_path.to_string_lossy()), e))?;

    tmp.persist(full_path).map_err(|e| {
        SignerIoError::new(
            format!("could not rename temp file to: {}", full_path.to_string_lossy()),
            e.error,
        )
    })?;

    sync_dir(dir)?;

    trace!("Saved file: {}", full_path.to_string_lossy());
    Ok(())
}

/// Makes a completed rename durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), SignerIoError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| SignerIoError::new(format!("could not sync dir: {}", dir.to_string_lossy()), e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), SignerIoError> {
    Ok(())
}

/// Saves an object as pretty printed json, atomically.
pub fn save_json<O: Serialize>(object: &O, full_path: &Path) -> Result<(), SignerIoError> {
    let json = serde_json::to_vec_pretty(object).map_err(|e| {
        SignerIoError::new(
            format!("could not serialize json for: {}", full_path.to_string_lossy()),
            io::Error::new(io::ErrorKind::InvalidData, e),
        )
    })?;
    save_atomic(&json, full_path)
}

/// Loads a file and deserializes it as json for the expected type.
///
/// Returns `Ok(None)` if the file does not exist. Any other problem,
/// including content that cannot be parsed, is an error.
pub fn load_json<O: DeserializeOwned>(full_path: &Path) -> Result<Option<O>, SignerIoError> {
    let bytes = match fs::read(full_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SignerIoError::new(
                format!("could not read: {}", full_path.to_string_lossy()),
                e,
            ))
        }
    };

    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        SignerIoError::new(
            format!("could not load json for file: {}", full_path.to_string_lossy()),
            io::Error::new(io::ErrorKind::InvalidData, format!("could not deserialize json: {}", e)),
        )
    })
}

pub fn delete_file(full_path: &Path) -> Result<(), SignerIoError> {
    trace!("Removing file: {}", full_path.to_string_lossy());
    fs::remove_file(full_path)
        .map_err(|e| SignerIoError::new(format!("could not remove file: {}", full_path.to_string_lossy()), e))
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::commons::test;

    #[test]
    fn save_json_replaces_previous_content() {
        test::test_under_tmp(|d| {
            let path = file_path(&d, "thing.json");

            let mut first = BTreeMap::new();
            first.insert("a".to_string(), 1);
            save_json(&first, &path).unwrap();

            let mut second = BTreeMap::new();
            second.insert("b".to_string(), 2);
            save_json(&second, &path).unwrap();

            let loaded: BTreeMap<String, i32> = load_json(&path).unwrap().unwrap();
            assert_eq!(second, loaded);

            // no temp files are left behind
            let entries = fs::read_dir(&d).unwrap().count();
            assert_eq!(1, entries);
        })
    }

    #[test]
    fn load_missing_json_is_none() {
        test::test_under_tmp(|d| {
            let loaded: Option<BTreeMap<String, i32>> = load_json(&file_path(&d, "missing.json")).unwrap();
            assert!(loaded.is_none());
        })
    }

    #[test]
    fn load_corrupt_json_is_error() {
        test::test_under_tmp(|d| {
            let path = file_path(&d, "corrupt.json");
            fs::write(&path, b"{ not json").unwrap();
            let res: Result<Option<BTreeMap<String, i32>>, _> = load_json(&path);
            let err = res.unwrap_err();
            assert_eq!(io::ErrorKind::InvalidData, err.cause().kind());
        })
    }
}
