//! Configuration management for cryptmirror

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default filesystem name reported to the kernel
pub const DEFAULT_FSNAME: &str = "cryptmirror";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Encryption configuration
    pub encryption: EncryptionConfig,

    /// Mount configuration
    pub mount: MountConfig,
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,
}

/// What a write does to a file that carries no content marker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnmanagedWritePolicy {
    /// Positioned write of the raw bytes, no cipher, marker untouched
    #[default]
    Passthrough,
    /// Encrypt the whole file and mark it encrypted
    Adopt,
    /// Reject the write with a permission error
    Refuse,
}

impl std::str::FromStr for UnmanagedWritePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "passthrough" => Ok(Self::Passthrough),
            "adopt" => Ok(Self::Adopt),
            "refuse" => Ok(Self::Refuse),
            other => Err(Error::InvalidConfig(format!(
                "Unknown unmanaged write policy: {}",
                other
            ))),
        }
    }
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Filesystem name shown in the mount table
    pub fsname: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// Rewrite files through a temp file and rename instead of truncate-in-place
    pub atomic_writes: bool,

    /// Write behavior for files without a content marker
    pub unmanaged_writes: UnmanagedWritePolicy,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            argon2_memory_kib: 65536, // 64 MiB
            argon2_iterations: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            fsname: DEFAULT_FSNAME.to_string(),
            allow_other: false,
            auto_unmount: true,
            atomic_writes: false,
            unmanaged_writes: UnmanagedWritePolicy::default(),
        }
    }
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cryptmirror")
            .join("config.json")
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("CRYPTMIRROR_ATOMIC_WRITES") {
            self.mount.atomic_writes = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        if let Ok(value) = std::env::var("CRYPTMIRROR_UNMANAGED_WRITES") {
            self.mount.unmanaged_writes = value.parse()?;
        }

        if let Ok(value) = std::env::var("CRYPTMIRROR_ARGON2_MEMORY_KIB") {
            if let Ok(kib) = value.trim().parse::<u32>() {
                self.encryption.argon2_memory_kib = kib;
            }
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let enc = &self.encryption;

        if enc.argon2_parallelism == 0 {
            return Err(Error::InvalidConfig(
                "Argon2 parallelism must be greater than 0".to_string(),
            ));
        }

        // Argon2 requires at least 8 KiB per lane
        if enc.argon2_memory_kib < 8 * enc.argon2_parallelism {
            return Err(Error::InvalidConfig(format!(
                "Argon2 memory must be at least {} KiB for parallelism {}",
                8 * enc.argon2_parallelism,
                enc.argon2_parallelism
            )));
        }

        if enc.argon2_iterations == 0 {
            return Err(Error::InvalidConfig(
                "Argon2 iterations must be greater than 0".to_string(),
            ));
        }

        if self.mount.fsname.is_empty() {
            return Err(Error::InvalidConfig(
                "Filesystem name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mount.unmanaged_writes, UnmanagedWritePolicy::Passthrough);
        assert!(!config.mount.atomic_writes);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.mount.unmanaged_writes = UnmanagedWritePolicy::Refuse;
        config.encryption.argon2_memory_kib = 1024;
        config.save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"refuse\""));

        let loaded: Config = serde_json::from_str(&content).unwrap();
        assert_eq!(loaded.mount.unmanaged_writes, UnmanagedWritePolicy::Refuse);
        assert_eq!(loaded.encryption.argon2_memory_kib, 1024);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"mount": {"allow_other": true}}"#).unwrap();
        assert!(config.mount.allow_other);
        assert!(config.mount.auto_unmount);
        assert_eq!(config.encryption.argon2_iterations, 3);
    }

    #[test]
    fn test_validate_rejects_tiny_memory() {
        let mut config = Config::default();
        config.encryption.argon2_parallelism = 4;
        config.encryption.argon2_memory_kib = 16;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            "Adopt".parse::<UnmanagedWritePolicy>().unwrap(),
            UnmanagedWritePolicy::Adopt
        );
        assert!("encrypt-anyway".parse::<UnmanagedWritePolicy>().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.json")).unwrap();
        assert_eq!(config.mount.fsname, DEFAULT_FSNAME);
    }
}
