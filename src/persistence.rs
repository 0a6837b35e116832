//! Plain-text and CSV artifacts on disk.
//!
//! Loaders treat a missing file as empty content so callers can run with
//! optional instruction or data files.

use std::path::Path;

use anyhow::{Context, Result};

pub fn load_text(path: &Path) -> Result<String> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "optional file missing; using empty content");
        return Ok(String::new());
    }
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))
}

/// Trimmed, non-empty lines.
pub fn load_lines(path: &Path) -> Result<Vec<String>> {
    Ok(load_text(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Every data cell of a CSV file, row by row, joined by `", "`. The header row
/// is skipped.
pub fn load_csv_flat(path: &Path) -> Result<String> {
    let content = load_text(path)?;
    Ok(flatten_csv(&content))
}

pub fn flatten_csv(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .skip(1)
        .flat_map(|line| line.split(',').map(str::trim))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Writes an artifact, creating parent directories as needed.
pub fn save_artifact(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create artifact directory '{}'", parent.display())
        })?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("failed to write artifact '{}'", path.display()))?;
    tracing::info!(path = %path.display(), bytes = content.len(), "artifact saved");
    Ok(())
}
