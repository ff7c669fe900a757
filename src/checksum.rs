//! Stage checksum accumulation
//!
//! A running SHA256 hash that typed values are folded into in a fixed,
//! caller-controlled order. The hex digest is the cache key of a stage.
//!
//! # Encoding
//!
//! | Value | Bytes folded |
//! |-------|--------------|
//! | string | UTF-8 bytes followed by `0x00` |
//! | NULL string | `0xFF` |
//! | boolean | `0x01` or `0x00` |
//! | u32 / u64 | big-endian, fixed width |
//! | list | each element as a string, then `0xFD` |
//! | NULL list | `0xFE` |
//!
//! The sentinel bytes never occur in valid UTF-8, so none of them can be
//! produced by a string.
//!
//! # Compat fold-ins
//!
//! Fields added after a manifest format shipped use the `update_compat_*`
//! variants. These fold nothing when the value is at its default, so older
//! manifests that never set the field keep their cache keys. A non-default
//! value is folded after its field name, so two adjacent compat fields can
//! never trade values without changing the digest:
//!
//! | Type | Default (no-op) |
//! |------|-----------------|
//! | string | NULL or `""` |
//! | list | NULL or `[]` |
//! | boolean | `false` |
//! | u32 / u64 | `0` |

use crate::error::{BuildError, BuildResult};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Bumping this forces a cache miss for every stage of every build.
pub const CHECKSUM_VERSION: &str = "stagebuild-cache-v2";

const NULL_STR: u8 = 0xFF;
const NULL_LIST: u8 = 0xFE;
const LIST_END: u8 = 0xFD;

/// Running hash of everything that can affect a stage's output
#[derive(Debug, Clone, Default)]
pub struct Checksum {
    hasher: Sha256,
}

impl Checksum {
    /// Create an accumulator in the initial state
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all folded state
    pub fn reset(&mut self) {
        self.hasher = Sha256::new();
    }

    /// Fold in raw bytes. Every other `update_*` is defined in terms of this.
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Fold in an optional string; `None` is distinct from `Some("")`
    pub fn update_str(&mut self, value: Option<&str>) {
        match value {
            Some(s) => {
                self.update_bytes(s.as_bytes());
                self.update_bytes(&[0]);
            }
            None => self.update_bytes(&[NULL_STR]),
        }
    }

    pub fn update_bool(&mut self, value: bool) {
        self.update_bytes(&[u8::from(value)]);
    }

    pub fn update_u32(&mut self, value: u32) {
        self.update_bytes(&value.to_be_bytes());
    }

    pub fn update_u64(&mut self, value: u64) {
        self.update_bytes(&value.to_be_bytes());
    }

    /// Fold in an optional ordered list; `None` is distinct from an empty list
    pub fn update_strv<S: AsRef<str>>(&mut self, values: Option<&[S]>) {
        match values {
            Some(list) => {
                for s in list {
                    self.update_str(Some(s.as_ref()));
                }
                self.update_bytes(&[LIST_END]);
            }
            None => self.update_bytes(&[NULL_LIST]),
        }
    }

    /// Compat string: no-op for NULL or empty
    pub fn update_compat_str(&mut self, field: &str, value: Option<&str>) {
        if let Some(s) = value.filter(|s| !s.is_empty()) {
            self.update_str(Some(field));
            self.update_str(Some(s));
        }
    }

    /// Compat list: no-op for NULL or empty
    pub fn update_compat_strv<S: AsRef<str>>(&mut self, field: &str, values: Option<&[S]>) {
        if let Some(list) = values.filter(|l| !l.is_empty()) {
            self.update_str(Some(field));
            self.update_strv(Some(list));
        }
    }

    /// Compat boolean: no-op for `false`
    pub fn update_compat_bool(&mut self, field: &str, value: bool) {
        if value {
            self.update_str(Some(field));
            self.update_bool(true);
        }
    }

    /// Compat u32: no-op for `0`
    pub fn update_compat_u32(&mut self, field: &str, value: u32) {
        if value != 0 {
            self.update_str(Some(field));
            self.update_u32(value);
        }
    }

    /// Compat u64: no-op for `0`
    pub fn update_compat_u64(&mut self, field: &str, value: u64) {
        if value != 0 {
            self.update_str(Some(field));
            self.update_u64(value);
        }
    }

    /// Fold in a file's contents, length-prefixed
    pub fn update_file(&mut self, path: &Path) -> BuildResult<()> {
        let contents = std::fs::read(path)
            .map_err(|e| BuildError::io(format!("checksumming {}", path.display()), e))?;
        self.update_u64(contents.len() as u64);
        self.update_bytes(&contents);
        Ok(())
    }

    /// Lowercase hex digest of the current state. Does not consume the state.
    pub fn digest(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}
