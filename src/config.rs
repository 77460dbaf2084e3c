//! Service configuration.
//!
//! The gateway consumes an ordered list of [`ServiceConfig`] records from an
//! external configuration collaborator. A config is immutable once an adapter
//! is built from it; changing a service means tearing the adapter down and
//! recreating it, which [`diff_configs`] makes explicit for reloads.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;

// ─── Transport selection ────────────────────────────────────────────────────

/// The four supported transport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Embedded,
    Sse,
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stdio => "stdio",
            Self::Embedded => "embedded",
            Self::Sse => "sse",
            Self::Http => "http",
        };
        f.write_str(s)
    }
}

/// Transport kind plus its connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Spawn a child process and speak newline-delimited JSON over its
    /// standard streams.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    /// Wrap an in-process service object registered under this service's id.
    Embedded,
    /// Long-lived event stream with a POST side channel.
    Sse {
        url: String,
    },
    /// One request/response exchange per protocol operation.
    Http {
        url: String,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Embedded => TransportKind::Embedded,
            Self::Sse { .. } => TransportKind::Sse,
            Self::Http { .. } => TransportKind::Http,
        }
    }
}

// ─── ServiceConfig ──────────────────────────────────────────────────────────

fn default_auto_start() -> bool {
    true
}

/// One backend service entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Stable unique id the service is addressed by.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Whether `start_all` and reload handling bring this service up.
    #[serde(default = "default_auto_start", alias = "autoStart")]
    pub auto_start: bool,
}

// ─── ServicesConfig ─────────────────────────────────────────────────────────

/// The ordered service list as delivered by the configuration collaborator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl ServicesConfig {
    /// Parse from a JSON document, rejecting duplicate service ids.
    pub fn from_json_str(json: &str) -> Result<Self, GatewayError> {
        let config: Self = serde_json::from_str(json).map_err(|e| GatewayError::Config {
            reason: format!("failed to parse services config: {e}"),
        })?;
        config.check_unique_ids()?;
        Ok(config)
    }

    /// Load from a JSON file on disk.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| GatewayError::Config {
            reason: format!("failed to read '{}': {e}", path.display()),
        })?;
        Self::from_json_str(&raw)
    }

    fn check_unique_ids(&self) -> Result<(), GatewayError> {
        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if !seen.insert(service.id.as_str()) {
                return Err(GatewayError::Config {
                    reason: format!("duplicate service id: '{}'", service.id),
                });
            }
        }
        Ok(())
    }
}

// ─── Reload diffing ─────────────────────────────────────────────────────────

/// Outcome of diffing a reloaded service list against the current one, by id.
#[derive(Debug, Default, PartialEq)]
pub struct ConfigDiff {
    /// Present in the new list only: construct, then start per `auto_start`.
    pub added: Vec<ServiceConfig>,
    /// Present in the old list only: stop and discard.
    pub removed: Vec<String>,
    /// Present in both but not equal: tear down and recreate.
    pub changed: Vec<ServiceConfig>,
}

/// Diff two ordered service lists by id.
pub fn diff_configs(old: &[ServiceConfig], new: &[ServiceConfig]) -> ConfigDiff {
    let old_by_id: HashMap<&str, &ServiceConfig> =
        old.iter().map(|c| (c.id.as_str(), c)).collect();
    let new_ids: std::collections::HashSet<&str> =
        new.iter().map(|c| c.id.as_str()).collect();

    let mut diff = ConfigDiff::default();

    for config in new {
        match old_by_id.get(config.id.as_str()) {
            None => diff.added.push(config.clone()),
            Some(existing) if *existing != config => diff.changed.push(config.clone()),
            Some(_) => {}
        }
    }

    for config in old {
        if !new_ids.contains(config.id.as_str()) {
            diff.removed.push(config.id.clone());
        }
    }

    diff
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_config(id: &str) -> ServiceConfig {
        ServiceConfig {
            id: id.to_string(),
            name: id.to_uppercase(),
            description: None,
            transport: TransportConfig::Stdio {
                command: "mcp-server".into(),
                args: vec!["--stdio".into()],
                env: HashMap::new(),
                cwd: None,
            },
            auto_start: true,
        }
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "services": [
                {
                    "id": "files",
                    "name": "Filesystem",
                    "transport": "stdio",
                    "command": "mcp-files",
                    "args": ["--root", "/srv"]
                },
                {
                    "id": "search",
                    "name": "Search",
                    "transport": "sse",
                    "url": "http://localhost:9200/events",
                    "autoStart": false
                },
                {
                    "id": "remote",
                    "name": "Remote",
                    "transport": "http",
                    "url": "http://localhost:8080/rpc"
                }
            ]
        }"#;

        let config = ServicesConfig::from_json_str(json).unwrap();
        assert_eq!(config.services.len(), 3);

        assert_eq!(config.services[0].transport.kind(), TransportKind::Stdio);
        assert!(config.services[0].auto_start);

        assert_eq!(config.services[1].transport.kind(), TransportKind::Sse);
        assert!(!config.services[1].auto_start);

        assert_eq!(config.services[2].transport.kind(), TransportKind::Http);
    }

    #[test]
    fn test_parse_embedded_entry() {
        let json = r#"{
            "services": [{"id": "local", "name": "Local", "transport": "embedded"}]
        }"#;
        let config = ServicesConfig::from_json_str(json).unwrap();
        assert_eq!(config.services[0].transport, TransportConfig::Embedded);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let json = r#"{
            "services": [
                {"id": "x", "name": "A", "transport": "embedded"},
                {"id": "x", "name": "B", "transport": "embedded"}
            ]
        }"#;
        let err = ServicesConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, GatewayError::Config { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");
        std::fs::write(
            &path,
            r#"{"services": [{"id": "a", "name": "A", "transport": "embedded"}]}"#,
        )
        .unwrap();

        let config = ServicesConfig::load(&path).unwrap();
        assert_eq!(config.services.len(), 1);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ServicesConfig::load(Path::new("/nonexistent/services.json")).unwrap_err();
        assert!(matches!(err, GatewayError::Config { .. }));
    }

    #[test]
    fn test_diff_added_removed_changed() {
        let old = vec![stdio_config("a"), stdio_config("b"), stdio_config("c")];

        let mut b_changed = stdio_config("b");
        b_changed.transport = TransportConfig::Http {
            url: "http://localhost:1234".into(),
        };
        let new = vec![b_changed.clone(), stdio_config("c"), stdio_config("d")];

        let diff = diff_configs(&old, &new);
        assert_eq!(diff.added, vec![stdio_config("d")]);
        assert_eq!(diff.removed, vec!["a".to_string()]);
        assert_eq!(diff.changed, vec![b_changed]);
    }

    #[test]
    fn test_diff_identical_lists_is_empty() {
        let list = vec![stdio_config("a"), stdio_config("b")];
        let diff = diff_configs(&list, &list);
        assert_eq!(diff, ConfigDiff::default());
    }
}
