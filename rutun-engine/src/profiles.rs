//! Durable connection profiles (GUI storage schema)
//!
//! A versioned JSON document under the user's home directory holding app
//! settings and saved SSH profiles. Loading and re-saving a document is
//! a fixed point apart from field ordering.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current schema version
pub const SCHEMA_VERSION: u32 = 1;

/// One saved SSH connection profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jump_hosts: Option<Vec<String>>,
    pub http_addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socks_addr: Option<String>,
    pub system_proxy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_file: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
}

/// Application-level settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    pub theme: String,
    pub auto_connect: bool,
    pub default_profile: String,
    pub verbose: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            theme: "system".to_string(),
            auto_connect: false,
            default_profile: String::new(),
            verbose: false,
            log_file: None,
        }
    }
}

/// Top-level profile document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigData {
    pub version: u32,
    pub settings: AppSettings,
    pub profiles: Vec<Profile>,
}

/// Profile store bound to a file path
pub struct ProfileStore {
    path: PathBuf,
    pub data: ConfigData,
}

impl ProfileStore {
    /// Default location: `~/.rutun/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(|home| PathBuf::from(home).join(".rutun").join("config.json"))
    }

    /// Load the store, or start empty when the file does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigData {
                version: SCHEMA_VERSION,
                ..ConfigData::default()
            },
            Err(e) => return Err(Error::Io(e)),
        };
        Ok(Self { path, data })
    }

    /// Persist the store with 0644 permissions.
    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_vec_pretty(&self.data)?;
        fs::write(&self.path, json)?;
        set_config_permissions(&self.path)?;
        Ok(())
    }

    /// Look up a profile by id.
    pub fn profile(&self, id: &str) -> Option<&Profile> {
        self.data.profiles.iter().find(|p| p.id == id)
    }
}

#[cfg(unix)]
fn set_config_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(0o644);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_config_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConfigData {
        ConfigData {
            version: SCHEMA_VERSION,
            settings: AppSettings {
                theme: "dark".into(),
                auto_connect: true,
                default_profile: "p1".into(),
                verbose: false,
                log_file: None,
            },
            profiles: vec![Profile {
                id: "p1".into(),
                name: "work".into(),
                host: "gw.example.com".into(),
                port: "22".into(),
                user: "alice".into(),
                password: None,
                key_file: Some("~/.ssh/id_ed25519".into()),
                jump_hosts: Some(vec!["bastion.corp:2222".into()]),
                http_addr: ":8080".into(),
                socks_addr: Some(":1080".into()),
                system_proxy: true,
                rule_file: None,
                created_at: "2024-06-01T10:00:00Z".into(),
                updated_at: "2024-06-02T10:00:00Z".into(),
                last_used_at: None,
            }],
        }
    }

    #[test]
    fn save_then_load_is_a_fixed_point() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let store = ProfileStore {
            path: path.clone(),
            data: sample(),
        };
        store.save().unwrap();

        let loaded = ProfileStore::load(&path).unwrap();
        assert_eq!(loaded.data, sample());

        // Round-tripping again produces identical bytes.
        loaded.save().unwrap();
        let second = ProfileStore::load(&path).unwrap();
        assert_eq!(second.data, loaded.data);
    }

    #[test]
    fn missing_file_loads_empty_with_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::load(dir.path().join("nope.json")).unwrap();
        assert_eq!(store.data.version, SCHEMA_VERSION);
        assert!(store.data.profiles.is_empty());
    }

    #[test]
    fn field_names_match_the_wire_schema() {
        let json = serde_json::to_string(&sample()).unwrap();
        for field in [
            "\"version\"",
            "\"settings\"",
            "\"profiles\"",
            "\"httpAddr\"",
            "\"socksAddr\"",
            "\"systemProxy\"",
            "\"keyFile\"",
            "\"jumpHosts\"",
            "\"createdAt\"",
            "\"updatedAt\"",
        ] {
            assert!(json.contains(field), "missing {}", field);
        }
        // Absent optionals stay off the wire.
        assert!(!json.contains("\"password\""));
        assert!(!json.contains("\"lastUsedAt\""));
    }

    #[test]
    fn profile_lookup_by_id() {
        let store = ProfileStore {
            path: PathBuf::from("/dev/null"),
            data: sample(),
        };
        assert!(store.profile("p1").is_some());
        assert!(store.profile("p2").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ProfileStore {
            path: path.clone(),
            data: sample(),
        };
        store.save().unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
