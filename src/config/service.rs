//! `.pg_service.conf` service file.
//!
//! INI-style sections, each mapping a service name to a bundle of
//! connection keywords:
//!
//! ```text
//! [production]
//! host=db1.example.com
//! port=5433
//! dbname=app
//! ```

use std::fs;
use std::path::Path;

use crate::errors::{Error, Result};

/// Read the keyword/value pairs of one service. A missing service or an
/// unreadable file is a configuration error; libpq behaves the same way
/// once a service name has been requested.
pub(super) fn load(path: &Path, name: &str) -> Result<Vec<(String, String)>> {
    let contents = fs::read_to_string(path).map_err(|e| {
        Error::config(format!(
            "cannot read service file {}: {e}",
            path.display()
        ))
    })?;

    let mut pairs = Vec::new();
    let mut in_section = false;
    let mut found = false;

    for (lineno, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[') {
            let section = section.strip_suffix(']').ok_or_else(|| {
                Error::config(format!(
                    "unterminated section header at line {} of {}",
                    lineno + 1,
                    path.display()
                ))
            })?;
            in_section = section == name;
            found |= in_section;
            continue;
        }
        if !in_section {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            Error::config(format!(
                "missing \"=\" at line {} of {}",
                lineno + 1,
                path.display()
            ))
        })?;
        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }

    if !found {
        return Err(Error::config(format!(
            "service {name:?} not found in {}",
            path.display()
        )));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct TempFile(PathBuf);

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.0);
        }
    }

    fn service_file(contents: &str) -> TempFile {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let path = std::env::temp_dir().join(format!(
            "pglink-service-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&path, contents).unwrap();
        TempFile(path)
    }

    #[test]
    fn loads_named_section() {
        let file = service_file(
            "# comment\n[staging]\nhost=old\n\n[production]\nhost=db1\nport = 5433\n; done\n",
        );
        let pairs = load(&file.0, "production").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("host".to_string(), "db1".to_string()),
                ("port".to_string(), "5433".to_string()),
            ]
        );
    }

    #[test]
    fn missing_service_is_an_error() {
        let file = service_file("[staging]\nhost=old\n");
        match load(&file.0, "production") {
            Err(Error::ConfigParse(msg)) => assert!(msg.contains("production")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn malformed_line_is_an_error() {
        let file = service_file("[production]\nhost\n");
        assert!(load(&file.0, "production").is_err());
    }

    #[test]
    fn unterminated_section_is_an_error() {
        let file = service_file("[production\nhost=db1\n");
        assert!(load(&file.0, "production").is_err());
    }
}
