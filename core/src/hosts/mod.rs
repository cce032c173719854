//! Hosts file block management.
//!
//! Owns a single contiguous, marker-delimited block of generated entries
//! inside a shared line-oriented file (normally `/etc/hosts`), such that the
//! block can always be identified and removed even if the rest of the file
//! was edited externally. Writes validate first and refuse to touch a file
//! whose marker state cannot be cleaned unambiguously.

mod validate;

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use validate::{CorruptionReport, HostsCorruptedError, HostsFileStatus};

/// First line of the managed block.
pub const MARKER_START: &str = "# localmesh: managed by localmesh";

/// Last line of the managed block.
pub const MARKER_END: &str = "# localmesh: end";

/// Errors from hosts file operations.
#[derive(Debug, Error)]
pub enum HostsError {
    /// The file holds marker state that cannot be cleaned safely.
    #[error(transparent)]
    Corrupted(#[from] HostsCorruptedError),

    /// Underlying file I/O failed.
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Manager for the localmesh block in a hosts file.
///
/// The path is injected at construction so tests can operate on temp files
/// in isolation.
pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    /// Creates a manager for the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates a manager for the system hosts file.
    pub fn system() -> Self {
        Self::new("/etc/hosts")
    }

    /// Returns the managed file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the file can be opened for writing.
    pub fn check_writable(&self) -> bool {
        OpenOptions::new().append(true).open(&self.path).is_ok()
    }

    /// Classifies the file's marker state. A missing file is clean.
    ///
    /// The state is recomputed on every call and never cached.
    pub fn validate(&self) -> Result<HostsFileStatus, HostsError> {
        let content = self.read_content()?;
        Ok(validate::validate_content(&content))
    }

    /// Appends a managed block with one `127.0.0.1 <host>` line per host
    /// name, in input order.
    ///
    /// Any previous managed block is removed first. If marker anomalies
    /// remain after that cleanup the file is left untouched and a
    /// [`HostsCorruptedError`] carrying the full problem list is returned.
    pub fn add_entries<S: AsRef<str>>(&self, hostnames: &[S]) -> Result<(), HostsError> {
        self.remove_entries()?;

        if let HostsFileStatus::Corrupted(report) = self.validate()? {
            return Err(HostsCorruptedError {
                path: self.path.clone(),
                report,
            }
            .into());
        }

        let content = self.read_content()?;
        let mut out = String::with_capacity(content.len() + 64);
        out.push_str(&content);
        if !content.is_empty() {
            if !content.ends_with('\n') {
                out.push('\n');
            }
            // One separating blank line between existing content and the block
            out.push('\n');
        }
        out.push_str(MARKER_START);
        out.push('\n');
        for host in hostnames {
            out.push_str("127.0.0.1 ");
            out.push_str(host.as_ref());
            out.push('\n');
        }
        out.push_str(MARKER_END);
        out.push('\n');

        self.write_atomic(&out)
    }

    /// Removes every well-formed managed block and normalizes trailing
    /// blank lines.
    ///
    /// A block is only removed when its start marker has a matching end
    /// marker with no further start marker in between; unmatched starts and
    /// orphan end markers are left in place for [`Self::validate`] to
    /// report. The single blank line directly above a removed block is
    /// dropped with it, so repeated add/remove cycles converge back to the
    /// original content. A missing file is a no-op.
    pub fn remove_entries(&self) -> Result<(), HostsError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(HostsError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let lines: Vec<&str> = content.lines().collect();
        let mut kept = strip_managed_blocks(&lines);
        trim_trailing_blank_lines(&mut kept);

        let new_content = if kept.is_empty() {
            String::new()
        } else {
            kept.join("\n") + "\n"
        };

        if new_content != content {
            self.write_atomic(&new_content)?;
        }
        Ok(())
    }

    fn read_content(&self) -> Result<String, HostsError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(HostsError::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    /// Writes via temp file + rename so a crash never leaves a half-written
    /// hosts file.
    fn write_atomic(&self, content: &str) -> Result<(), HostsError> {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".localmesh.tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, content).map_err(|e| HostsError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            HostsError::Io {
                path: self.path.clone(),
                source: e,
            }
        })
    }
}

/// Drops each start-marker..matching-end-marker span (inclusive) plus the
/// single blank line directly above it. Spans without an unambiguous
/// matching end are kept verbatim.
fn strip_managed_blocks(lines: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        if lines[i].trim() == MARKER_START {
            if let Some(end) = find_matching_end(lines, i) {
                if out.last().is_some_and(|l| l.is_empty()) {
                    out.pop();
                }
                i = end + 1;
                continue;
            }
        }
        out.push(lines[i].to_string());
        i += 1;
    }
    out
}

/// Finds the end marker closing the block started at `start`, or `None`
/// when another start marker intervenes or EOF is reached first.
fn find_matching_end(lines: &[&str], start: usize) -> Option<usize> {
    for (j, line) in lines.iter().enumerate().skip(start + 1) {
        let trimmed = line.trim();
        if trimmed == MARKER_START {
            return None;
        }
        if trimmed == MARKER_END {
            return Some(j);
        }
    }
    None
}

fn trim_trailing_blank_lines(lines: &mut Vec<String>) {
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hosts_in(dir: &TempDir) -> HostsFile {
        HostsFile::new(dir.path().join("hosts"))
    }

    fn write(hosts: &HostsFile, content: &str) {
        fs::write(hosts.path(), content).unwrap();
    }

    fn read(hosts: &HostsFile) -> String {
        fs::read_to_string(hosts.path()).unwrap()
    }

    #[test]
    fn test_add_entries_empty_file() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        write(&hosts, "");

        hosts
            .add_entries(&["test.localhost", "api.localhost"])
            .unwrap();

        let expected = format!(
            "{}\n127.0.0.1 test.localhost\n127.0.0.1 api.localhost\n{}\n",
            MARKER_START, MARKER_END
        );
        assert_eq!(read(&hosts), expected);
    }

    #[test]
    fn test_add_entries_existing_content() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        write(&hosts, "127.0.0.1 localhost\n::1 localhost\n");

        hosts.add_entries(&["test.localhost"]).unwrap();

        let expected = format!(
            "127.0.0.1 localhost\n::1 localhost\n\n{}\n127.0.0.1 test.localhost\n{}\n",
            MARKER_START, MARKER_END
        );
        assert_eq!(read(&hosts), expected);
    }

    #[test]
    fn test_add_entries_missing_file() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);

        hosts.add_entries(&["test.localhost"]).unwrap();

        let expected = format!("{}\n127.0.0.1 test.localhost\n{}\n", MARKER_START, MARKER_END);
        assert_eq!(read(&hosts), expected);
    }

    #[test]
    fn test_remove_entries_clean_removal() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        write(
            &hosts,
            &format!(
                "127.0.0.1 localhost\n::1 localhost\n\n{}\n127.0.0.1 test.localhost\n{}\n",
                MARKER_START, MARKER_END
            ),
        );

        hosts.remove_entries().unwrap();

        assert_eq!(read(&hosts), "127.0.0.1 localhost\n::1 localhost\n");
    }

    #[test]
    fn test_remove_entries_missing_file_is_noop() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);

        hosts.remove_entries().unwrap();

        assert!(!hosts.path().exists());
    }

    #[test]
    fn test_remove_entries_normalizes_trailing_blank_lines() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        write(&hosts, "127.0.0.1 localhost\n\n\n\n");

        hosts.remove_entries().unwrap();

        assert_eq!(read(&hosts), "127.0.0.1 localhost\n");
    }

    #[test]
    fn test_add_remove_round_trip_multiple_times() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        let initial = "127.0.0.1 localhost\n::1 localhost\n";
        write(&hosts, initial);

        for i in 0..3 {
            hosts
                .add_entries(&["test.localhost", "api.localhost"])
                .unwrap();
            hosts.remove_entries().unwrap();

            let content = read(&hosts);
            assert_eq!(content, initial, "iteration {}: content changed", i);

            let blank_count = content.lines().filter(|l| l.is_empty()).count();
            assert_eq!(blank_count, 0, "iteration {}: blank lines accumulated", i);
        }
    }

    #[test]
    fn test_add_remove_round_trip_empty_file() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        write(&hosts, "");

        hosts.add_entries(&["test.localhost"]).unwrap();
        hosts.remove_entries().unwrap();

        assert_eq!(read(&hosts), "");
    }

    #[test]
    fn test_remove_entries_removes_multiple_well_formed_blocks() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        write(
            &hosts,
            &format!(
                "127.0.0.1 localhost\n\n{s}\n127.0.0.1 a\n{e}\n\n{s}\n127.0.0.1 b\n{e}\n",
                s = MARKER_START,
                e = MARKER_END
            ),
        );

        hosts.remove_entries().unwrap();

        assert_eq!(read(&hosts), "127.0.0.1 localhost\n");
    }

    #[test]
    fn test_remove_entries_keeps_unclosed_block() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        let content = format!("127.0.0.1 localhost\n{}\n127.0.0.1 a\n", MARKER_START);
        write(&hosts, &content);

        hosts.remove_entries().unwrap();

        // An unmatched start marker has no unambiguous extent, so nothing
        // of it is removed.
        assert_eq!(read(&hosts), content);
    }

    #[test]
    fn test_remove_entries_keeps_orphan_end_marker() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        let content = format!("127.0.0.1 localhost\n{}\n", MARKER_END);
        write(&hosts, &content);

        hosts.remove_entries().unwrap();

        assert_eq!(read(&hosts), content);
    }

    #[test]
    fn test_add_entries_refuses_unclosed_block() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        let content = format!("127.0.0.1 localhost\n{}\n127.0.0.1 a\n", MARKER_START);
        write(&hosts, &content);

        let err = hosts.add_entries(&["test.localhost"]).unwrap_err();

        match err {
            HostsError::Corrupted(corrupted) => {
                assert!(corrupted.report.unclosed_block);
                assert!(!corrupted.report.problems.is_empty());
            }
            other => panic!("expected corruption error, got {:?}", other),
        }
        // No write happened
        assert_eq!(read(&hosts), content);
    }

    #[test]
    fn test_add_entries_refuses_orphan_end() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        let content = format!("{}\n127.0.0.1 localhost\n", MARKER_END);
        write(&hosts, &content);

        let err = hosts.add_entries(&["test.localhost"]).unwrap_err();

        assert!(matches!(err, HostsError::Corrupted(_)));
        assert_eq!(read(&hosts), content);
    }

    #[test]
    fn test_add_entries_replaces_stale_block() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        write(
            &hosts,
            &format!(
                "127.0.0.1 localhost\n\n{}\n127.0.0.1 stale.localhost\n{}\n",
                MARKER_START, MARKER_END
            ),
        );

        hosts.add_entries(&["fresh.localhost"]).unwrap();

        let expected = format!(
            "127.0.0.1 localhost\n\n{}\n127.0.0.1 fresh.localhost\n{}\n",
            MARKER_START, MARKER_END
        );
        assert_eq!(read(&hosts), expected);
    }

    #[test]
    fn test_validate_missing_file_is_clean() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);

        assert!(hosts.validate().unwrap().is_clean());
    }

    #[test]
    fn test_validate_after_add_reports_existing_block() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        write(&hosts, "127.0.0.1 localhost\n");

        hosts.add_entries(&["test.localhost"]).unwrap();

        match hosts.validate().unwrap() {
            HostsFileStatus::Corrupted(report) => {
                assert_eq!(report.block_count, 1);
                assert!(report.problems[0].contains("Existing localmesh entries found"));
            }
            HostsFileStatus::Clean => panic!("expected corrupted status"),
        }
    }

    #[test]
    fn test_entries_preserve_input_order() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir);
        write(&hosts, "");

        hosts.add_entries(&["b.localhost", "a.localhost", "b.localhost"]).unwrap();

        let content = read(&hosts);
        let entries: Vec<&str> = content
            .lines()
            .filter(|l| l.starts_with("127.0.0.1"))
            .collect();
        assert_eq!(
            entries,
            vec![
                "127.0.0.1 b.localhost",
                "127.0.0.1 a.localhost",
                "127.0.0.1 b.localhost"
            ]
        );
    }
}
