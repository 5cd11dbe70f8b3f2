use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;

use super::{CacheError, CacheResult, ResultStore};

/// Atomic write: temp file in the target directory, then rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Pretty JSON plus a trailing newline, written atomically.
pub fn write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> CacheResult<()> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    write_atomic(path, text.as_bytes())?;
    Ok(())
}

/// Plain-text artifact, written atomically.
pub fn write_text(path: &Path, text: &str) -> std::io::Result<()> {
    write_atomic(path, text.as_bytes())
}

/// Filesystem-backed result store.
///
/// Layout: keys are paths relative to `root` (normally the artifacts dir),
/// so cached outputs sit next to the prompts and raw responses of the same
/// unit.
#[derive(Debug, Clone)]
pub struct FsResultStore {
    root: PathBuf,
}

impl FsResultStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ResultStore for FsResultStore {
    fn read(&self, key: &str) -> CacheResult<Option<Value>> {
        let path = self.path_for(key);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| CacheError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn write(&self, key: &str, value: &Value) -> CacheResult<()> {
        write_json_pretty(&self.path_for(key), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_store() -> (tempfile::TempDir, FsResultStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn value_roundtrip_creates_parent_dirs() {
        let (dir, store) = make_store();
        store.write("miners/miner_001/tickets.json", &json!([{"title": "t"}])).unwrap();
        assert!(dir.path().join("miners/miner_001/tickets.json").is_file());
        let got = store.read("miners/miner_001/tickets.json").unwrap();
        assert_eq!(got, Some(json!([{"title": "t"}])));
    }

    #[test]
    fn missing_key_is_none() {
        let (_dir, store) = make_store();
        assert!(store.read("nope.json").unwrap().is_none());
    }

    #[test]
    fn undecodable_file_is_corrupt() {
        let (dir, store) = make_store();
        fs::write(dir.path().join("bad.json"), "{truncated").unwrap();
        match store.read("bad.json") {
            Err(CacheError::Corrupt { key, .. }) => assert_eq!(key, "bad.json"),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn pretty_json_ends_with_newline() {
        let (dir, _store) = make_store();
        let path = dir.path().join("meta.json");
        write_json_pretty(&path, &json!({"a": 1})).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("}\n"));
        assert!(text.contains("\n  \"a\": 1"));
    }

    #[test]
    fn overwrite_replaces_content() {
        let (dir, _store) = make_store();
        let path = dir.path().join("x.txt");
        write_text(&path, "one").unwrap();
        write_text(&path, "two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
    }
}
