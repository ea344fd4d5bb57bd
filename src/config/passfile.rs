//! `.pgpass` password file.
//!
//! One entry per line: `host:port:database:user:password`. Any of the first
//! four fields may be `*`. Literal `:` and `\` inside a field are escaped
//! with a backslash. Lines starting with `#` and blank lines are skipped.

use std::fs;
use std::path::Path;

use tracing::debug;

/// Look up a password for the given connection parameters. Unreadable or
/// missing files simply yield no password; malformed lines are skipped the
/// way libpq skips them.
pub(crate) fn lookup_password(
    path: &Path,
    host: &str,
    port: u16,
    database: &str,
    user: &str,
) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    let port_text = port.to_string();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields = split_fields(line);
        if fields.len() != 5 {
            continue;
        }
        if field_matches(&fields[0], host)
            && field_matches(&fields[1], &port_text)
            && field_matches(&fields[2], database)
            && field_matches(&fields[3], user)
        {
            debug!(%host, port, "password found in passfile");
            return Some(fields[4].clone());
        }
    }
    None
}

fn field_matches(field: &str, value: &str) -> bool {
    field == "*" || field == value
}

/// Split on unescaped `:`, resolving `\:` and `\\`.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}
