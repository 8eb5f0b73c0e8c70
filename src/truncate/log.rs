//! Persisted truncation log.
//!
//! One JSON document under the node's storage directory, rewritten whole
//! through a temporary file and a rename. Each entry packs its threshold
//! and cenotaph bit into a single u64 ([`TruncateHval`]).

use crate::core::error::{KeystoneError, KeystoneResult};
use crate::core::time::MAX_LUT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const LOG_VERSION: u32 = 1;

/// Packed log value: bit 0 is the cenotaph flag, bits 1..24 are unused and
/// bits 24..64 hold the 40-bit LUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TruncateHval(u64);

impl TruncateHval {
    const LUT_SHIFT: u32 = 24;
    const CENOTAPH_BIT: u64 = 1;

    pub fn new(lut: u64, cenotaph: bool) -> KeystoneResult<Self> {
        if lut > MAX_LUT {
            return Err(KeystoneError::storage(format!(
                "truncate lut {} exceeds 40 bits",
                lut
            )));
        }
        let flag = if cenotaph { Self::CENOTAPH_BIT } else { 0 };
        Ok(Self((lut << Self::LUT_SHIFT) | flag))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn lut(self) -> u64 {
        self.0 >> Self::LUT_SHIFT
    }

    pub fn is_cenotaph(self) -> bool {
        self.0 & Self::CENOTAPH_BIT != 0
    }
}

/// One persisted threshold or cenotaph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncateLogEntry {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<String>,
    pub hval: TruncateHval,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogFile {
    version: u32,
    entries: Vec<TruncateLogEntry>,
}

/// Handle on the log file.
#[derive(Debug, Clone)]
pub struct TruncateLog {
    path: PathBuf,
}

impl TruncateLog {
    pub const FILE_NAME: &'static str = "truncate.json";

    /// Log stored in `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(Self::FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries. A missing file is an empty log.
    pub fn load(&self) -> KeystoneResult<Vec<TruncateLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        Self::read_file(&self.path)
    }

    /// Parse the log at `path`.
    pub fn read_file(path: &Path) -> KeystoneResult<Vec<TruncateLogEntry>> {
        let content = fs::read_to_string(path).map_err(|e| {
            KeystoneError::storage(format!("read {}: {}", path.display(), e))
        })?;
        let file: LogFile = serde_json::from_str(&content).map_err(|e| {
            KeystoneError::storage(format!("parse {}: {}", path.display(), e))
        })?;
        if file.version != LOG_VERSION {
            return Err(KeystoneError::storage(format!(
                "unsupported truncate log version {}",
                file.version
            )));
        }
        Ok(file.entries)
    }

    /// Replace the log with `entries`.
    pub fn store(&self, entries: &[TruncateLogEntry]) -> KeystoneResult<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                KeystoneError::storage(format!("create {}: {}", dir.display(), e))
            })?;
        }
        let file = LogFile {
            version: LOG_VERSION,
            entries: entries.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| KeystoneError::storage(format!("encode truncate log: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        let mut out = fs::File::create(&tmp)
            .map_err(|e| KeystoneError::storage(format!("create {}: {}", tmp.display(), e)))?;
        out.write_all(&json)
            .and_then(|_| out.sync_all())
            .map_err(|e| KeystoneError::storage(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            KeystoneError::storage(format!("rename {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }
}
