//! Text output for the console.

use std::fmt::Write as _;
use std::io::{self, Write};

use serde::Serialize;

use dirmon_core::{Directory, ErrorSource, LoggingPolicy};

/// Output that could not be produced or written.
#[derive(Debug)]
pub struct RenderError(pub String);

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot render output: {}", self.0)
    }
}

impl std::error::Error for RenderError {}

pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<String, RenderError> {
    serde_json::to_string_pretty(value).map_err(|e| RenderError(e.to_string()))
}

/// Writes `text` to stdout. Fails on a closed pipe instead of panicking.
pub fn emit(text: &str) -> Result<(), RenderError> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", text)
        .and_then(|()| out.flush())
        .map_err(|e| RenderError(e.to_string()))
}

fn state(record: &Directory) -> &'static str {
    match (record.is_provisional(), record.enabled) {
        (true, _) => "pending",
        (false, true) => "enabled",
        (false, false) => "disabled",
    }
}

/// One row per record, widths fitted to the content.
pub fn table(records: &[Directory]) -> String {
    if records.is_empty() {
        return "no monitored directories".to_string();
    }

    let id_width = records
        .iter()
        .map(|r| r.id.to_string().len())
        .max()
        .unwrap_or(2)
        .max(2);
    let name_width = records
        .iter()
        .map(|r| r.label().chars().count())
        .max()
        .unwrap_or(4)
        .clamp(4, 40);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>id_width$}  {:<8}  {:<name_width$}  PATH",
        "ID", "STATE", "NAME"
    );
    for record in records {
        let label: String = record.label().chars().take(name_width).collect();
        let _ = writeln!(
            out,
            "{:>id_width$}  {:<8}  {:<name_width$}  {}",
            record.id,
            state(record),
            label,
            record.directory_path
        );
    }
    out.truncate(out.trim_end().len());
    out
}

/// All fields of one record, one per line.
pub fn detail(record: &Directory) -> String {
    let optional = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
    let rows = [
        ("id", record.id.to_string()),
        ("path", record.directory_path.clone()),
        ("state", state(record).to_string()),
        ("name", optional(&record.display_name)),
        ("description", optional(&record.description)),
        ("display path", optional(&record.display_path)),
        ("resolved path", optional(&record.resolved_path)),
        ("created", format!("{} by {}", record.created_at.to_rfc3339(), record.created_by)),
        ("updated", format!("{} by {}", record.updated_at.to_rfc3339(), record.updated_by)),
    ];
    rows.iter()
        .map(|(key, value)| format!("{:<14} {}", format!("{}:", key), value))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn policy(policy: &LoggingPolicy) -> String {
    let mut out = format!(
        "error logging: {}",
        if policy.enabled { "on" } else { "off" }
    );
    for source in ErrorSource::ALL {
        let _ = write!(
            out,
            "\n  {:<20} {}",
            source.as_str(),
            if policy.is_enabled(source) { "reported" } else { "ignored" }
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirmon_core::{DirectoryCreate, SourcePolicy};

    fn record(id: i64, path: &str, name: Option<&str>) -> Directory {
        let input = DirectoryCreate {
            display_name: name.map(str::to_string),
            ..DirectoryCreate::new(path)
        };
        Directory::provisional(id, &input, chrono::Utc::now())
    }

    #[test]
    fn test_table_layout() {
        let mut disabled = record(12, "/srv/b", None);
        disabled.enabled = false;
        let text = table(&[record(3, "/srv/a", Some("Archive")), disabled]);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID  STATE"));
        assert!(lines[1].contains("enabled") && lines[1].contains("Archive"));
        assert!(lines[2].starts_with("12  disabled  /srv/b"));
    }

    #[test]
    fn test_table_empty() {
        assert_eq!(table(&[]), "no monitored directories");
    }

    #[test]
    fn test_provisional_shown_as_pending() {
        assert!(table(&[record(-1, "/srv/new", None)]).contains("pending"));
    }

    #[test]
    fn test_detail_fills_missing_fields() {
        let text = detail(&record(4, "/srv/c", None));
        assert!(text.contains("path:          /srv/c"));
        assert!(text.contains("description:   -"));
    }

    #[test]
    fn test_policy_lists_every_source() {
        let mut sources = SourcePolicy::default();
        sources.set(ErrorSource::Transport, false);
        let text = policy(&LoggingPolicy {
            enabled: true,
            sources,
        });
        assert!(text.starts_with("error logging: on"));
        assert!(text.contains("transport            ignored"));
        assert!(text.contains("rendering            reported"));
        assert_eq!(text.lines().count(), 1 + ErrorSource::ALL.len());
    }
}
