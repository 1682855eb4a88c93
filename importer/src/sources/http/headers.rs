//! Extra request headers from the environment and from a mounted secret.

use std::path::Path;

use importer_shared::constants::envs::EXTRA_HEADER_PREFIX;
use importer_shared::{ImportError, ImportResult};
use walkdir::WalkDir;

/// Values of every `IMPORTER_EXTRA_HEADER*` variable, ordered by name.
pub fn extra_headers_from_env() -> Vec<String> {
    let mut vars: Vec<(String, String)> = std::env::vars()
        .filter(|(name, _)| name.starts_with(EXTRA_HEADER_PREFIX))
        .collect();
    vars.sort();
    vars.into_iter().map(|(_, value)| value).collect()
}

/// Contents of every visible file under `dir`. A missing directory yields
/// nothing. Dot-directories, such as the `..data` links of a mounted
/// secret, are not descended into.
pub fn extra_headers_from_dir(dir: &Path) -> ImportResult<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut headers = Vec::new();
    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        let entry = entry.map_err(|e| {
            ImportError::Storage(format!(
                "Error listing directories under {}: {}",
                dir.display(),
                e
            ))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let header = std::fs::read_to_string(entry.path()).map_err(|e| {
            ImportError::Storage(format!(
                "Error reading headers from {}: {}",
                entry.path().display(),
                e
            ))
        })?;
        headers.push(header);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_headers_from_secret_dir() {
        let dir = TempDir::new().expect("Should create temp dir");
        std::fs::write(dir.path().join("token"), "Authorization: Bearer xyz").unwrap();
        std::fs::write(dir.path().join(".hidden"), "X-Hidden: 1").unwrap();
        std::fs::create_dir(dir.path().join("..2021_11_09")).unwrap();
        std::fs::write(dir.path().join("..2021_11_09/token"), "X-Old: 1").unwrap();

        let headers = extra_headers_from_dir(dir.path()).expect("Should read headers");
        assert_eq!(headers, vec!["Authorization: Bearer xyz".to_string()]);
    }

    #[test]
    fn test_missing_secret_dir() {
        let headers = extra_headers_from_dir(Path::new("/nonexistent/extraheaders"))
            .expect("Missing dir should be fine");
        assert!(headers.is_empty());
    }
}
