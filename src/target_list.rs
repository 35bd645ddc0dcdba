use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// Parse a targets file into a deduplicated list of connection strings.
///
/// Supported format per line:
/// - one connection string, surrounding whitespace trimmed
/// - lines starting with `#` are comments
/// - blank lines are ignored
///
/// Inline `#` is kept since secrets may contain it. Lines are not validated
/// here; invalid ones are reported per target by the runners.
pub fn parse_targets_str(s: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for raw_line in s.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if seen.insert(line.to_string()) {
            out.push(line.to_string());
        }
    }
    out
}

/// Load a targets list from a file path. Errors if the file cannot be read or
/// holds no targets.
pub fn load_targets_from_path(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read targets file: {}", path.display()))?;
    let targets = parse_targets_str(&content);
    if targets.is_empty() {
        bail!("no targets in {}", path.display());
    }
    Ok(targets)
}
