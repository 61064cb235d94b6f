//! On-disk artifact helpers shared by the CAV store and the activation cache.
//!
//! Artifacts are written to a `.tmp` sibling and renamed into place so an
//! interrupted run never leaves a half-written CAV or activation file behind.

use std::io;
use std::path::{Path, PathBuf};

/// Serialize `data` as pretty JSON and atomically write it to `path`.
///
/// Parent directories are created on demand.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to `path`.
///
/// The temporary name is unique per call, so concurrent writers of the same
/// artifact never rename each other's partial file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize a JSON artifact.
///
/// Returns `Ok(None)` when the file does not exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// List `*.json` files directly under `dir`, sorted by path.
///
/// A missing directory yields an empty list.
pub fn list_json_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// List `*.json` files anywhere below `dir`, sorted by path.
///
/// A missing directory yields an empty list.
pub fn walk_json_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

/// Encode a concept, layer or baseline name as a single path component.
///
/// Percent-encoding with `.` escaped too: distinct names always map to
/// distinct components, and no name can become `.`, `..` or contain a
/// separator. The empty name encodes as `%`.
pub fn file_component(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }
    urlencoding::encode(name).replace('.', "%2E")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Artifact {
        concept: String,
        vector: Vec<f64>,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("striped_cav.json");
        let data = Artifact {
            concept: "striped".into(),
            vector: vec![0.25, -1.5, 3.0],
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<Artifact> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cavs").join("mixed4c").join("a.json");
        atomic_write(&path, b"[]").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_json_missing_file() {
        let loaded: io::Result<Option<Artifact>> = load_json(Path::new("/nonexistent/cav.json"));
        assert!(loaded.unwrap().is_none());
    }

    #[test]
    fn test_load_json_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_json::<Artifact>(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_list_json_files_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.json"), "1").unwrap();
        std::fs::write(dir.path().join("a.json"), "1").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let files = list_json_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json"]);
        assert!(list_json_files(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_walk_json_files_recurses() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("striped").join("mixed4c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("random500_0.json"), "1").unwrap();
        std::fs::write(dir.path().join("top.json"), "1").unwrap();
        std::fs::write(nested.join("notes.txt"), "x").unwrap();

        let files = walk_json_files(dir.path());
        assert_eq!(files.len(), 2);
        assert!(files.contains(&nested.join("random500_0.json")));
        assert!(walk_json_files(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn test_file_component() {
        assert_eq!(file_component("striped"), "striped");
        assert_eq!(file_component("random500_0"), "random500_0");
        assert_eq!(file_component("mixed4c/concat:0"), "mixed4c%2Fconcat%3A0");
        assert_eq!(file_component(".."), "%2E%2E");
        assert_eq!(file_component(""), "%");
    }

    #[test]
    fn test_file_component_keeps_names_apart() {
        let names = [
            "mixed4c/concat",
            "mixed4c-concat",
            "mixed4c_concat",
            "mixed4c concat",
            "mixed4c%2Fconcat",
            "mixed4c.concat",
            "mixed4c%2Econcat",
            "a_b",
            "a",
            "",
            "%",
        ];
        let encoded: std::collections::HashSet<String> =
            names.iter().map(|n| file_component(n)).collect();
        assert_eq!(encoded.len(), names.len());
    }
}
