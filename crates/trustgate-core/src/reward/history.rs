//! JSON Lines reward history store.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::ScoreError;
use super::score::RewardDelta;

/// Append-only file of [`RewardDelta`]s, one per line.
#[derive(Debug, Clone)]
pub struct RewardHistory {
    path: PathBuf,
}

impl RewardHistory {
    /// Uses the store at `path`; the file is created on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one delta and syncs it.
    ///
    /// # Errors
    ///
    /// Returns [`ScoreError::History`] on I/O failure.
    pub fn append(&self, delta: &RewardDelta) -> Result<(), ScoreError> {
        let mut line = serde_json::to_vec(delta).map_err(ScoreError::Serialization)?;
        line.push(b'\n');
        self.ensure_parent()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.write_all(&line).map_err(|e| self.io_error(e))?;
        file.sync_data().map_err(|e| self.io_error(e))?;
        Ok(())
    }

    /// Loads every complete line. A missing file is an empty history.
    ///
    /// # Errors
    ///
    /// Returns [`ScoreError::CorruptHistory`] for unparseable lines.
    pub fn load(&self) -> Result<Vec<RewardDelta>, ScoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.io_error(err)),
        };
        // An unterminated final line is a write in progress.
        let complete = text.rfind('\n').map_or("", |end| &text[..=end]);
        complete
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| ScoreError::CorruptHistory {
                    line: i + 1,
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Atomically replaces the store with `deltas`.
    ///
    /// # Errors
    ///
    /// Returns [`ScoreError::History`] on I/O failure.
    pub fn replace(&self, deltas: &[RewardDelta]) -> Result<(), ScoreError> {
        let mut buf = Vec::new();
        for delta in deltas {
            serde_json::to_writer(&mut buf, delta).map_err(ScoreError::Serialization)?;
            buf.push(b'\n');
        }
        let parent = self.ensure_parent()?;
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| self.io_error(e))?;
        temp.write_all(&buf).map_err(|e| self.io_error(e))?;
        temp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        temp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        Ok(())
    }

    fn ensure_parent(&self) -> Result<&Path, ScoreError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        Ok(parent)
    }

    fn io_error(&self, source: std::io::Error) -> ScoreError {
        ScoreError::History {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::reward::score::RewardComponents;

    fn delta(total: f64) -> RewardDelta {
        RewardDelta {
            workflow_id: "wf".to_string(),
            agent_id: None,
            timestamp: 1,
            components: RewardComponents::default(),
            total,
        }
    }

    #[test]
    fn test_append_then_load() {
        let dir = TempDir::new().unwrap();
        let history = RewardHistory::new(dir.path().join("rewards").join("history.jsonl"));
        assert!(history.load().unwrap().is_empty());

        history.append(&delta(1.0)).unwrap();
        history.append(&delta(-2.0)).unwrap();
        let loaded = history.load().unwrap();
        assert_eq!(loaded, vec![delta(1.0), delta(-2.0)]);
    }

    #[test]
    fn test_unterminated_tail_ignored() {
        let dir = TempDir::new().unwrap();
        let history = RewardHistory::new(dir.path().join("history.jsonl"));
        history.append(&delta(1.0)).unwrap();

        let mut bytes = fs::read(history.path()).unwrap();
        bytes.extend_from_slice(br#"{"workflow_id":"#);
        fs::write(history.path(), bytes).unwrap();

        assert_eq!(history.load().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_line_reported() {
        let dir = TempDir::new().unwrap();
        let history = RewardHistory::new(dir.path().join("history.jsonl"));
        fs::write(history.path(), "garbage\n").unwrap();
        assert!(matches!(
            history.load(),
            Err(ScoreError::CorruptHistory { line: 1, .. })
        ));
    }

    #[test]
    fn test_replace_overwrites() {
        let dir = TempDir::new().unwrap();
        let history = RewardHistory::new(dir.path().join("history.jsonl"));
        history.append(&delta(1.0)).unwrap();
        history.replace(&[delta(3.0)]).unwrap();
        assert_eq!(history.load().unwrap(), vec![delta(3.0)]);
    }
}
