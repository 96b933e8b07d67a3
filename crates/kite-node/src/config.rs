//! Loading the node manifest from disk.

use kite_types::config::KiteConfig;
use kite_types::error::{KiteError, KiteResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Manifest looked up in the working directory when no path is given.
pub const DEFAULT_MANIFEST: &str = "manifest.toml";

/// Read and validate a manifest. Missing or malformed files are errors:
/// a kite cannot guess its own name.
pub fn load_config(path: Option<&Path>) -> KiteResult<KiteConfig> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST));

    let contents = std::fs::read_to_string(&path).map_err(|e| {
        KiteError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let config: KiteConfig = toml::from_str(&contents).map_err(|e| {
        KiteError::Config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate().map_err(KiteError::Config)?;

    debug!(path = %path.display(), aliases = config.methods.len(), "Parsed manifest");
    info!(kite = %config.full_name(), version = %config.version, "Loaded configuration");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_valid_manifest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
username = "devrim"
kitename = "fs"
version = "1.2.0"
kontrol_enabled = false
call_timeout_secs = 3

[methods]
ls = "ReadDirectory"
"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.full_name(), "devrim/fs");
        assert_eq!(config.version, "1.2.0");
        assert!(!config.kontrol_enabled);
        assert_eq!(config.call_timeout_secs, 3);
        assert_eq!(config.methods["ls"], "ReadDirectory");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, KiteError::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_manifest_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "username = \"devrim\"").unwrap();
        assert!(matches!(
            load_config(Some(file.path())),
            Err(KiteError::Config(_))
        ));

        let mut garbage = tempfile::NamedTempFile::new().unwrap();
        writeln!(garbage, "username = [").unwrap();
        assert!(matches!(
            load_config(Some(garbage.path())),
            Err(KiteError::Config(_))
        ));
    }
}
