//! Configuration file discovery for heron.toml.

use heron_engine::EngineConfig;
use std::path::{Path, PathBuf};

/// Config file names to search for, in order of preference.
const CONFIG_NAMES: &[&str] = &["heron.toml", ".heronrc.toml"];

/// Load configuration from a file or search for default config files.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let config_path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => std::env::current_dir().ok().and_then(|cwd| find_config_file(&cwd)),
    };

    match config_path {
        Some(path) if path.exists() => {
            let config = EngineConfig::load(&path)?;
            tracing::debug!(path = %path.display(), "loaded configuration");
            Ok(config)
        }
        Some(path) => Err(anyhow::anyhow!("config file not found: {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

/// Search for a configuration file in `start` and its parent directories.
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        for name in CONFIG_NAMES {
            let path = current.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        dir = current.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_config_in_ancestor() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.path().join(".heronrc.toml"), "").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, root.path().join(".heronrc.toml"));
    }

    #[test]
    fn test_heron_toml_preferred() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("heron.toml"), "").unwrap();
        std::fs::write(root.path().join(".heronrc.toml"), "").unwrap();

        assert_eq!(
            find_config_file(root.path()),
            Some(root.path().join("heron.toml"))
        );
    }

    #[test]
    fn test_load_explicit_config() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("custom.toml");
        std::fs::write(&path, "[wait]\nmax_sleep_slice_ms = 10\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.wait.max_sleep_slice_ms, 10);
    }

    #[test]
    fn test_missing_explicit_config_is_error() {
        let root = tempfile::tempdir().unwrap();
        let err = load_config(Some(&root.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn test_invalid_config_is_error() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("heron.toml");
        std::fs::write(&path, "[wait]\nmax_sleep_slice_ms = \"fast\"\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
