//! Writing the termination message the kubelet hands back to the controller.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use importer_shared::{ImportError, ImportResult, TerminationMessage};

/// Replace the contents of `path` with `message` as a single JSON line.
pub fn write_termination_message(path: &Path, message: &TerminationMessage) -> ImportResult<()> {
    let line = message.to_line()?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| {
            ImportError::Storage(format!(
                "Failed to open termination log {}: {}",
                path.display(),
                e
            ))
        })?;
    file.write_all(line.as_bytes()).map_err(|e| {
        ImportError::Storage(format!(
            "Failed to write termination log {}: {}",
            path.display(),
            e
        ))
    })?;
    tracing::debug!("Wrote termination message: {}", line);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_write_replaces_previous_message() {
        let dir = TempDir::new().expect("Should create temp dir");
        let path = dir.path().join("termination-log");
        std::fs::write(&path, "stale content that is longer than the new line").unwrap();

        let mut labels = BTreeMap::new();
        labels.insert("instancetype.kubevirt.io/default-preference".into(), "fedora".into());
        let message = TerminationMessage {
            message: Some("Import Complete".into()),
            labels: Some(labels),
            ..Default::default()
        };
        write_termination_message(&path, &message).expect("Should write message");

        let written = std::fs::read_to_string(&path).expect("Should read back");
        assert!(!written.contains('\n'));
        let parsed: TerminationMessage = serde_json::from_str(&written).expect("Should parse");
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_write_to_missing_dir_fails() {
        let err = write_termination_message(
            Path::new("/nonexistent/dir/termination-log"),
            &TerminationMessage::with_message("x"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), importer_shared::ErrorKind::Storage);
    }
}
