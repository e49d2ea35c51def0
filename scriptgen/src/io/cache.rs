//! Content-addressed store of verified script pairs.
//!
//! Records live at `{dir}/{sha256(trimmed description)}.json`. A record that
//! cannot be read or parsed is treated as absent; it is only replaced once a
//! fresh pair passes its test.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::types::{CacheKey, ScriptPair};

const RECORD_EXTENSION: &str = "json";

/// Directory of cached script pairs.
#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
}

impl ResultCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$XDG_CACHE_HOME/scriptgen` or the platform equivalent.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("scriptgen"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the record for `description` lives, whether or not it exists.
    pub fn path_for(&self, description: &str) -> PathBuf {
        self.record_path(&CacheKey::from_description(description))
    }

    fn record_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.{RECORD_EXTENSION}"))
    }

    /// Load the pair cached for `description`. Any failure is a miss.
    pub fn get(&self, description: &str) -> Option<ScriptPair> {
        let path = self.path_for(description);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "cache miss");
                return None;
            }
            Err(err) => {
                warn!(path = %path.display(), err = %err, "unreadable cache record");
                return None;
            }
        };
        let pair: ScriptPair = match serde_json::from_str(&contents) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(path = %path.display(), err = %err, "corrupt cache record");
                return None;
            }
        };
        if pair.main_script.trim().is_empty() {
            warn!(path = %path.display(), "cache record has an empty main script");
            return None;
        }
        debug!(path = %path.display(), "cache hit");
        Some(pair)
    }

    /// Store `pair` for `description`, replacing any previous record
    /// atomically (temp file + rename in the same directory).
    pub fn set(&self, description: &str, pair: &ScriptPair) -> Result<()> {
        let path = self.path_for(description);
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create cache dir {}", self.dir.display()))?;

        let mut buf = serde_json::to_string_pretty(pair).context("serialize cache record")?;
        buf.push('\n');

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("create temp cache record in {}", self.dir.display()))?;
        tmp.write_all(buf.as_bytes())
            .context("write temp cache record")?;
        tmp.persist(&path)
            .with_context(|| format!("replace cache record {}", path.display()))?;
        debug!(path = %path.display(), "cached script pair");
        Ok(())
    }

    /// Remove every record. Returns how many were deleted.
    pub fn clear(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err).with_context(|| format!("read cache dir {}", self.dir.display()));
            }
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry
                .with_context(|| format!("read cache dir {}", self.dir.display()))?
                .path();
            if path.extension().is_some_and(|ext| ext == RECORD_EXTENSION) && path.is_file() {
                fs::remove_file(&path)
                    .with_context(|| format!("remove cache record {}", path.display()))?;
                removed += 1;
            }
        }
        debug!(removed, dir = %self.dir.display(), "cleared cache");
        Ok(removed)
    }
}
