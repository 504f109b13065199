//! JSON file persistence shared by all stores.
//!
//! Files live under the state directory. Reads take a shared lock and
//! writes an exclusive lock, so concurrent gateway processes never
//! corrupt each other's writes. On Unix files are created `0o600` from
//! the start; credential blobs live in these files.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tb_domain::error::{Error, Result};

/// Load a JSON document, returning the default when the file is absent.
pub(crate) fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let file = std::fs::File::open(path)?;
    fs2::FileExt::lock_shared(&file)
        .map_err(|e| Error::Other(format!("state file lock failed: {e}")))?;
    let raw = std::io::read_to_string(&file)?;
    fs2::FileExt::unlock(&file)
        .map_err(|e| Error::Other(format!("state file unlock failed: {e}")))?;
    serde_json::from_str(&raw).map_err(|e| Error::Other(format!("corrupt state file: {e}")))
}

/// Write a JSON document, creating the parent directory if needed.
pub(crate) fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(value)?;

    #[cfg(unix)]
    let file = {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?
    };

    #[cfg(not(unix))]
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    fs2::FileExt::lock_exclusive(&file)
        .map_err(|e| Error::Other(format!("state file lock failed: {e}")))?;
    {
        use std::io::Write;
        let mut writer = std::io::BufWriter::new(&file);
        writer.write_all(json.as_bytes())?;
    }
    // Lock is released when `file` is dropped.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.json");

        let mut map = HashMap::new();
        map.insert("key".to_string(), 42u32);
        save_json(&path, &map).unwrap();

        let loaded: HashMap<String, u32> = load_json(&path).unwrap();
        assert_eq!(loaded.get("key"), Some(&42));
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: HashMap<String, u32> = load_json(&dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_empty());
    }
}
