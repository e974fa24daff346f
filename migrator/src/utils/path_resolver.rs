use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const LOG_FOLDER_NAME: &str = "Attach_Log";

/// Folder the binary runs from, falling back to the working directory.
pub fn resolve_deployment_folder() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(dir) = exe_path.parent() {
            return dir.to_path_buf();
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Nearest existing `Attach_Log/` at or above `start`.
fn find_log_folder_upward(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .take(12)
        .map(|dir| dir.join(LOG_FOLDER_NAME))
        .find(|candidate| candidate.is_dir())
}

/// Resolve log folder (absolute path)
///
/// Nearest existing `Attach_Log/` walking up from the working directory, then
/// `<exe dir>/Attach_Log`, then the platform data directory.
pub fn resolve_log_folder() -> Result<PathBuf> {
    if let Some(found) = std::env::current_dir()
        .ok()
        .and_then(|cwd| find_log_folder_upward(&cwd))
    {
        return Ok(found);
    }

    let beside_exe = resolve_deployment_folder().join(LOG_FOLDER_NAME);
    if std::fs::create_dir_all(&beside_exe).is_ok() {
        return Ok(beside_exe);
    }

    // Installed under a read-only location (Program Files, /usr/bin).
    let data_dir = dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("attach-migrator")
        .join(LOG_FOLDER_NAME);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create log folder: {:?}", data_dir))?;
    Ok(data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_log_folder_wins() {
        let root = tempfile::tempdir().unwrap();
        let deep = root.path().join("a").join("b");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::create_dir_all(root.path().join(LOG_FOLDER_NAME)).unwrap();
        assert_eq!(
            find_log_folder_upward(&deep),
            Some(root.path().join(LOG_FOLDER_NAME))
        );

        std::fs::create_dir_all(root.path().join("a").join(LOG_FOLDER_NAME)).unwrap();
        assert_eq!(
            find_log_folder_upward(&deep),
            Some(root.path().join("a").join(LOG_FOLDER_NAME))
        );
    }

    #[test]
    fn missing_log_folder_is_none() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(find_log_folder_upward(root.path()), None);
    }
}
