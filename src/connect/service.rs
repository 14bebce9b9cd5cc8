//! `pg_service.conf` lookup (C6): an INI-style file of named parameter
//! groups, selected via `service=<name>` in the connection string or the
//! `PGSERVICE` environment variable.
//!
//! Format per <https://www.postgresql.org/docs/current/libpq-pgservice.html>.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::ParseConfigError;

pub fn default_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("PGSERVICEFILE") {
        return Some(PathBuf::from(path));
    }
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".pg_service.conf"))
}

/// Returns the `key = value` pairs for `[service]` in the file at `path`.
pub fn lookup(path: &std::path::Path, service: &str) -> Result<BTreeMap<String, String>, ParseConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ParseConfigError::ServiceFileUnreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut current_section: Option<String> = None;
    let mut found = BTreeMap::new();
    let mut seen_section = false;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            current_section = Some(name.to_string());
            if name == service {
                seen_section = true;
            }
            continue;
        }
        if current_section.as_deref() != Some(service) {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            found.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    if !seen_section {
        return Err(ParseConfigError::UnknownService(service.to_string()));
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_matching_section() {
        let path = std::env::temp_dir().join(format!("pgwc-service-test-{}", std::process::id()));
        std::fs::write(
            &path,
            "[mydb]\nhost=localhost\nport=5433\ndbname=mydb\n\n[other]\nhost=otherhost\n",
        )
        .unwrap();

        let section = lookup(&path, "mydb").unwrap();
        assert_eq!(section.get("host").map(String::as_str), Some("localhost"));
        assert_eq!(section.get("port").map(String::as_str), Some("5433"));
        assert!(!section.contains_key("dbname is missing"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn unknown_service_is_an_error() {
        let path = std::env::temp_dir().join(format!("pgwc-service-test-unknown-{}", std::process::id()));
        std::fs::write(&path, "[mydb]\nhost=localhost\n").unwrap();

        let result = lookup(&path, "doesnotexist");
        assert!(result.is_err());

        std::fs::remove_file(&path).ok();
    }
}
