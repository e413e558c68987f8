/// Supervisor configuration.
///
/// One JSON document, path given on the command line. Relative
/// `databaseDirectory` values resolve against the directory containing the
/// configuration file itself.

use crate::errors::ConfError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conf {
    /// Where snapshots and startup sources live.
    #[serde(default = "default_database_directory")]
    pub database_directory: PathBuf,
    /// Seconds between periodic snapshots; 0 disables them.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: f64,
    /// Size ceiling for the snapshot directory, in megabytes. Absent means
    /// unlimited and retention never runs.
    #[serde(default)]
    pub checkpoint_max_directory_size: Option<f64>,
    /// Retention never deletes below this many snapshots.
    #[serde(default)]
    pub checkpoint_min_files: usize,
    #[serde(default = "default_true")]
    pub checkpoint_at_shutdown: bool,
}

fn default_database_directory() -> PathBuf {
    PathBuf::from("./")
}

fn default_checkpoint_interval() -> f64 {
    600.0
}

fn default_true() -> bool {
    true
}

impl Conf {
    pub fn load(path: &Path) -> Result<Conf, ConfError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut conf: Conf = serde_json::from_str(&text).map_err(|source| ConfError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if conf.database_directory.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            conf.database_directory = base.join(&conf.database_directory);
        }
        if !conf.database_directory.is_dir() {
            return Err(ConfError::MissingDirectory {
                path: conf.database_directory.clone(),
            });
        }
        Ok(conf)
    }

    pub fn max_directory_bytes(&self) -> Option<u64> {
        self.checkpoint_max_directory_size
            .map(|mb| (mb * 1024.0 * 1024.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let conf: Conf = serde_json::from_str("{}").unwrap();
        assert_eq!(conf.checkpoint_interval, 600.0);
        assert_eq!(conf.checkpoint_min_files, 0);
        assert!(conf.checkpoint_at_shutdown);
        assert!(conf.checkpoint_max_directory_size.is_none());
    }

    #[test]
    fn camel_case_keys() {
        let conf: Conf = serde_json::from_str(
            r#"{"checkpointInterval": 60, "checkpointMaxDirectorySize": 2.5, "checkpointAtShutdown": false}"#,
        )
        .unwrap();
        assert_eq!(conf.checkpoint_interval, 60.0);
        assert_eq!(conf.max_directory_bytes(), Some(2_621_440));
        assert!(!conf.checkpoint_at_shutdown);
    }
}
