//! Monitored-directory records and the inputs used to create or patch them.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Attribution recorded when the caller does not supply one.
pub const DEFAULT_ACTOR: &str = "api";

pub const MAX_DISPLAY_NAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// A monitored directory as returned by the API.
///
/// `id` is assigned by the server and never changes. Records created
/// optimistically carry a negative provisional id until the next refetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub id: i64,
    pub directory_path: String,
    pub enabled: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Path as typed by the user.
    #[serde(default)]
    pub display_path: Option<String>,
    /// Path after symlink resolution on the server.
    #[serde(default)]
    pub resolved_path: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_actor")]
    pub created_by: String,
    #[serde(default = "default_actor")]
    pub updated_by: String,
}

impl Directory {
    /// Builds the tentative record shown while a create is in flight.
    pub fn provisional(id: i64, input: &DirectoryCreate, now: DateTime<Utc>) -> Self {
        Self {
            id,
            directory_path: input.directory_path.clone(),
            enabled: input.enabled.unwrap_or(true),
            display_name: input.display_name.clone(),
            description: input.description.clone(),
            display_path: None,
            resolved_path: None,
            created_at: now,
            updated_at: now,
            created_by: input
                .created_by
                .clone()
                .unwrap_or_else(default_actor),
            updated_by: DEFAULT_ACTOR.to_string(),
        }
    }

    /// Returns `true` for records created locally and not yet confirmed.
    pub fn is_provisional(&self) -> bool {
        self.id < 0
    }

    /// Name to show in lists: display name if set, otherwise the path.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.directory_path)
    }
}

/// Input for creating a directory (`POST /api/v1/directories/`).
///
/// Omitted fields are left to server defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryCreate {
    pub directory_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl DirectoryCreate {
    pub fn new(directory_path: impl Into<String>) -> Self {
        Self {
            directory_path: directory_path.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_path(&self.directory_path)?;
        validate_optional_text(&self.display_name, "display_name", MAX_DISPLAY_NAME_LEN)?;
        validate_optional_text(&self.description, "description", MAX_DESCRIPTION_LEN)
    }
}

/// Partial update (`PUT /api/v1/directories/{id}`). `None` fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

impl DirectoryUpdate {
    /// Patch that flips the enabled flag of `current` and nothing else.
    pub fn toggle_of(current: &Directory) -> Self {
        Self {
            enabled: Some(!current.enabled),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if let Some(path) = &self.directory_path {
            validate_path(path)?;
        }
        validate_optional_text(&self.display_name, "display_name", MAX_DISPLAY_NAME_LEN)?;
        validate_optional_text(&self.description, "description", MAX_DESCRIPTION_LEN)
    }

    /// Shallow-merges this patch over `current`, refreshing `updated_at`.
    pub fn apply_to(&self, current: &Directory, now: DateTime<Utc>) -> Directory {
        let mut merged = current.clone();
        if let Some(path) = &self.directory_path {
            merged.directory_path = path.clone();
        }
        if let Some(enabled) = self.enabled {
            merged.enabled = enabled;
        }
        if let Some(name) = &self.display_name {
            merged.display_name = Some(name.clone());
        }
        if let Some(description) = &self.description {
            merged.description = Some(description.clone());
        }
        if let Some(display_path) = &self.display_path {
            merged.display_path = Some(display_path.clone());
        }
        if let Some(resolved_path) = &self.resolved_path {
            merged.resolved_path = Some(resolved_path.clone());
        }
        if let Some(actor) = &self.updated_by {
            merged.updated_by = actor.clone();
        }
        merged.updated_at = now;
        merged
    }
}

fn default_actor() -> String {
    DEFAULT_ACTOR.to_string()
}

fn validate_path(path: &str) -> Result<(), Error> {
    if path.trim().is_empty() {
        return Err(Error::Validation("directory_path is required".to_string()));
    }
    if !Path::new(path).is_absolute() {
        return Err(Error::Validation(format!(
            "directory_path must be absolute: {}",
            path
        )));
    }
    Ok(())
}

fn validate_optional_text(value: &Option<String>, field: &str, max: usize) -> Result<(), Error> {
    match value {
        Some(text) if text.chars().count() > max => Err(Error::Validation(format!(
            "{} exceeds {} characters",
            field, max
        ))),
        _ => Ok(()),
    }
}

/// ISO-8601 timestamps. Offset-less values from the server are read as UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Directory {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        Directory {
            id: 3,
            directory_path: "/data/photos".to_string(),
            enabled: true,
            display_name: Some("Photos".to_string()),
            description: Some("camera uploads".to_string()),
            display_path: None,
            resolved_path: None,
            created_at: at,
            updated_at: at,
            created_by: "alice".to_string(),
            updated_by: "alice".to_string(),
        }
    }

    #[test]
    fn test_provisional_applies_defaults() {
        let now = Utc::now();
        let record = Directory::provisional(-1, &DirectoryCreate::new("/data/x"), now);
        assert!(record.enabled);
        assert_eq!(record.created_by, "api");
        assert_eq!(record.updated_by, "api");
        assert_eq!(record.created_at, now);
        assert!(record.is_provisional());
    }

    #[test]
    fn test_toggle_patch_only_flips_enabled() {
        let current = sample();
        let later = current.updated_at + chrono::Duration::seconds(10);
        let toggled = DirectoryUpdate::toggle_of(&current).apply_to(&current, later);
        assert!(!toggled.enabled);
        assert_eq!(toggled.directory_path, current.directory_path);
        assert_eq!(toggled.display_name, current.display_name);
        assert_eq!(toggled.description, current.description);
        assert_eq!(toggled.updated_by, current.updated_by);
        assert_eq!(toggled.updated_at, later);
    }

    #[test]
    fn test_apply_keeps_unset_fields() {
        let current = sample();
        let patch = DirectoryUpdate {
            description: Some("raw files".to_string()),
            ..Default::default()
        };
        let merged = patch.apply_to(&current, Utc::now());
        assert_eq!(merged.description.as_deref(), Some("raw files"));
        assert_eq!(merged.display_name.as_deref(), Some("Photos"));
        assert!(merged.enabled);
    }

    #[test]
    fn test_validate_rejects_bad_paths() {
        assert!(DirectoryCreate::new("").validate().is_err());
        assert!(DirectoryCreate::new("relative/dir").validate().is_err());
        assert!(DirectoryCreate::new("/abs/dir").validate().is_ok());

        let patch = DirectoryUpdate {
            directory_path: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(matches!(patch.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_text_limits() {
        let mut input = DirectoryCreate::new("/abs");
        input.display_name = Some("n".repeat(MAX_DISPLAY_NAME_LEN));
        assert!(input.validate().is_ok());
        input.display_name = Some("n".repeat(MAX_DISPLAY_NAME_LEN + 1));
        assert!(input.validate().is_err());
    }

    #[test]
    fn test_deserialize_naive_timestamp() {
        let json = r#"{
            "id": 7,
            "directory_path": "/data/x",
            "enabled": true,
            "display_name": null,
            "description": null,
            "created_at": "2025-03-01T10:00:00.123456",
            "updated_at": "2025-03-01T10:00:00+00:00",
            "created_by": "api",
            "updated_by": "api"
        }"#;
        let record: Directory = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.created_at.timestamp(), record.updated_at.timestamp());
        assert!(record.display_path.is_none());
    }

    #[test]
    fn test_create_skips_unset_fields() {
        let json = serde_json::to_value(DirectoryCreate::new("/data/x")).unwrap();
        assert_eq!(json, serde_json::json!({"directory_path": "/data/x"}));
    }

    #[test]
    fn test_label_falls_back_to_path() {
        let mut record = sample();
        assert_eq!(record.label(), "Photos");
        record.display_name = None;
        assert_eq!(record.label(), "/data/photos");
    }
}
