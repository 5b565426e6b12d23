//! Config Backup (C9). Writes timestamped snapshots of running/startup
//! config and the original config register to a backup directory, and
//! reads them back.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::{RecoveryError, Result};

pub struct ConfigBackup {
    backup_dir: PathBuf,
}

impl ConfigBackup {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Result<Self> {
        let backup_dir = backup_dir.into();
        fs::create_dir_all(&backup_dir).map_err(|e| RecoveryError::BackupFailed {
            path: backup_dir.clone(),
            source: e,
        })?;
        Ok(ConfigBackup { backup_dir })
    }

    /// Writes `config` to `<prefix>_config_<timestamp>.txt` under the
    /// backup directory.
    pub fn backup_running_config(&self, config: &str, prefix: &str) -> Result<PathBuf> {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let path = self.backup_dir.join(format!("{}_config_{}.txt", prefix, timestamp));
        self.write_new(&path, config.as_bytes())?;
        tracing::info!(path = %path.display(), prefix, "backed up configuration");
        Ok(path)
    }

    pub fn backup_startup_config(&self, config: &str) -> Result<PathBuf> {
        self.backup_running_config(config, "startup")
    }

    /// Writes the original config register value plus a capture timestamp
    /// to `config_register_<timestamp>.txt`.
    pub fn backup_config_register(&self, value: &str) -> Result<PathBuf> {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let path = self.backup_dir.join(format!("config_register_{}.txt", timestamp));
        let contents = format!(
            "Original config register: {}\nBackup time: {}\n",
            value,
            Local::now().to_rfc3339()
        );
        self.write_new(&path, contents.as_bytes())?;
        tracing::info!(path = %path.display(), value, "backed up config register");
        Ok(path)
    }

    pub fn restore_config(&self, backup_file: &Path) -> Result<String> {
        if !backup_file.exists() {
            return Err(RecoveryError::BackupFailed {
                path: backup_file.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "backup file not found"),
            });
        }
        fs::read_to_string(backup_file).map_err(|e| RecoveryError::BackupFailed {
            path: backup_file.to_path_buf(),
            source: e,
        })
    }

    fn write_new(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| RecoveryError::BackupFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
        file.write_all(contents).map_err(|e| RecoveryError::BackupFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_running_config_backup() {
        let dir = tempfile::tempdir().unwrap();
        let backup = ConfigBackup::new(dir.path()).unwrap();
        let path = backup.backup_running_config("hostname Router\n", "running").unwrap();
        assert!(path.exists());
        let restored = backup.restore_config(&path).unwrap();
        assert_eq!(restored, "hostname Router\n");
    }

    #[test]
    fn startup_prefix_is_distinct_from_running() {
        let dir = tempfile::tempdir().unwrap();
        let backup = ConfigBackup::new(dir.path()).unwrap();
        let path = backup.backup_startup_config("no service pad\n").unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("startup_config_"));
    }

    #[test]
    fn config_register_backup_records_value_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let backup = ConfigBackup::new(dir.path()).unwrap();
        let path = backup.backup_config_register("0x2102").unwrap();
        let contents = fs::read_to_string(path).unwrap();
        assert!(contents.contains("0x2102"));
        assert!(contents.contains("Backup time:"));
    }

    #[test]
    fn restore_of_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backup = ConfigBackup::new(dir.path()).unwrap();
        assert!(backup.restore_config(Path::new("no-such-file.txt")).is_err());
    }
}
