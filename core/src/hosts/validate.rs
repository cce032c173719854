//! Hosts file validation state machine.
//!
//! Scans the file line by line tracking marker occurrences. Any managed
//! block present at validation time means a previous run did not shut down
//! cleanly, so even a single well-formed block is reported as corrupted:
//! the manager only ever owns a block it created itself during the current
//! run, never a stale one pointing at dead tunnels.

use std::fmt;

use super::{MARKER_END, MARKER_START};

/// Classification of the hosts file's marker state.
#[derive(Debug, Clone)]
pub enum HostsFileStatus {
    /// No managed block and no marker anomalies.
    Clean,
    /// At least one block or marker anomaly was found.
    Corrupted(CorruptionReport),
}

impl HostsFileStatus {
    /// Convenience predicate for callers that only need the boolean.
    pub fn is_clean(&self) -> bool {
        matches!(self, HostsFileStatus::Clean)
    }
}

/// Details of a corrupted hosts file, computed fresh per validation.
#[derive(Debug, Clone, Default)]
pub struct CorruptionReport {
    /// Number of start markers seen.
    pub block_count: usize,
    /// A start marker had no matching end marker by EOF.
    pub unclosed_block: bool,
    /// An end marker appeared while not inside a block.
    pub orphan_end: bool,
    /// A start marker appeared while already inside a block.
    pub nested_start: bool,
    /// Human-readable problem list, summary first.
    pub problems: Vec<String>,
    /// Full file content, for diagnostics.
    pub content: String,
}

/// Runs the marker state machine over the given content.
pub(super) fn validate_content(content: &str) -> HostsFileStatus {
    let mut block_count = 0usize;
    let mut in_block = false;
    let mut start_line = 0usize;
    let mut unclosed_block = false;
    let mut orphan_end = false;
    let mut nested_start = false;
    let mut problems = Vec::new();

    for (i, line) in content.lines().enumerate() {
        let line_no = i + 1;
        let trimmed = line.trim();

        if trimmed == MARKER_START {
            if in_block {
                nested_start = true;
                problems.push(format!(
                    "Nested start marker found at line {} (block started at line {})",
                    line_no, start_line
                ));
            }
            in_block = true;
            start_line = line_no;
            block_count += 1;
        } else if trimmed == MARKER_END {
            if !in_block {
                orphan_end = true;
                problems.push(format!(
                    "End marker without start marker found at line {}",
                    line_no
                ));
            }
            in_block = false;
        }
    }

    if in_block {
        unclosed_block = true;
        problems.push(format!(
            "Unclosed block: start marker at line {} has no matching end marker",
            start_line
        ));
    }

    // Summary line goes first
    if block_count == 1 && !unclosed_block && !orphan_end && !nested_start {
        problems.insert(
            0,
            format!(
                "Existing localmesh entries found ({} block). Clean shutdown may have failed.",
                block_count
            ),
        );
    } else if block_count > 1 {
        problems.insert(
            0,
            format!(
                "Multiple marker blocks found ({} blocks). Only one is expected.",
                block_count
            ),
        );
    }

    if block_count == 0 && !unclosed_block && !orphan_end && !nested_start {
        HostsFileStatus::Clean
    } else {
        HostsFileStatus::Corrupted(CorruptionReport {
            block_count,
            unclosed_block,
            orphan_end,
            nested_start,
            problems,
            content: content.to_string(),
        })
    }
}

/// Error raised when a write is refused because the hosts file holds marker
/// state the manager cannot safely clean up.
#[derive(Debug)]
pub struct HostsCorruptedError {
    /// Path of the offending file.
    pub path: std::path::PathBuf,
    /// The validation report that caused the refusal.
    pub report: CorruptionReport,
}

impl fmt::Display for HostsCorruptedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} is in an invalid state and cannot be automatically fixed.",
            self.path.display()
        )?;
        writeln!(f, "Please manually fix the following problems:")?;
        writeln!(f)?;
        for (i, problem) in self.report.problems.iter().enumerate() {
            writeln!(f, "{}. {}", i + 1, problem)?;
        }
        writeln!(f)?;
        writeln!(f, "Current {} content:", self.path.display())?;
        writeln!(f, "---")?;
        write!(f, "{}", self.report.content)?;
        if !self.report.content.ends_with('\n') && !self.report.content.is_empty() {
            writeln!(f)?;
        }
        writeln!(f, "---")?;
        writeln!(f)?;
        writeln!(f, "To fix:")?;
        writeln!(
            f,
            "1. Edit the file manually with elevated privileges, e.g. `sudo vim -u NONE {}`",
            self.path.display()
        )?;
        writeln!(f, "2. Remove all lines between and including:")?;
        writeln!(f, "     {}", MARKER_START)?;
        writeln!(f, "     {}", MARKER_END)?;
        write!(f, "3. Run localmesh again")
    }
}

impl std::error::Error for HostsCorruptedError {}
