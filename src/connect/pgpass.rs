//! `.pgpass` lookup (C6): finds the first matching line for
//! `host:port:database:user` and fills in the password if the config
//! doesn't already have one.
//!
//! Format per <https://www.postgresql.org/docs/current/libpq-pgpass.html>:
//! one `hostname:port:database:username:password` entry per line, with `*`
//! as a wildcard for any field except the password, and `:`/`\` escaped
//! with a leading `\` within a field.

use std::path::PathBuf;

fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn split_unescaped(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push('\\');
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ':' => {
                fields.push(current.clone());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn field_matches(pattern: &str, value: &str) -> bool {
    pattern == "*" || unescape(pattern) == value
}

/// Search `path` (defaults to `~/.pgpass`, or `%APPDATA%\postgresql\pgpass.conf`
/// on Windows) for a line matching `host:port:database:user` and return its
/// password field, if found.
pub fn lookup_password(path: &std::path::Path, host: &str, port: u16, database: &str, user: &str) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields = split_unescaped(line);
        if fields.len() != 5 {
            continue;
        }
        let matches = field_matches(&fields[0], host)
            && field_matches(&fields[1], &port.to_string())
            && field_matches(&fields[2], database)
            && field_matches(&fields[3], user);
        if matches {
            return Some(unescape(&fields[4]));
        }
    }
    None
}

pub fn default_path() -> Option<PathBuf> {
    if cfg!(windows) {
        let appdata = std::env::var_os("APPDATA")?;
        Some(PathBuf::from(appdata).join("postgresql").join("pgpass.conf"))
    } else {
        let home = std::env::var_os("HOME")?;
        Some(PathBuf::from(home).join(".pgpass"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_exact_line() {
        let dir = std::env::temp_dir().join(format!("pgwc-pgpass-test-{}", std::process::id()));
        std::fs::write(&dir, "localhost:5432:mydb:alice:s3cret\n").unwrap();

        let pw = lookup_password(&dir, "localhost", 5432, "mydb", "alice");
        assert_eq!(pw.as_deref(), Some("s3cret"));

        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn wildcard_matches_any_value() {
        let dir = std::env::temp_dir().join(format!("pgwc-pgpass-test-wc-{}", std::process::id()));
        std::fs::write(&dir, "*:*:*:alice:s3cret\n").unwrap();

        let pw = lookup_password(&dir, "anyhost", 1234, "anydb", "alice");
        assert_eq!(pw.as_deref(), Some("s3cret"));

        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn no_match_returns_none() {
        let dir = std::env::temp_dir().join(format!("pgwc-pgpass-test-nomatch-{}", std::process::id()));
        std::fs::write(&dir, "otherhost:5432:mydb:alice:s3cret\n").unwrap();

        let pw = lookup_password(&dir, "localhost", 5432, "mydb", "alice");
        assert_eq!(pw, None);

        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn unescapes_colon_and_backslash() {
        assert_eq!(unescape(r"pass\:word"), "pass:word");
        assert_eq!(unescape(r"back\\slash"), r"back\slash");
    }
}
