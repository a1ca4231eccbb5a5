//! Persistent client identity: a random 10-character real ID and a
//! monotonically increasing history count, stored on disk so repeated
//! invocations of the client accumulate history under one identity.
//! Grounded on the upstream `PermaData` class.

use std::{io, path::{Path, PathBuf}};

use rand::Rng;
use serde::{Deserialize, Serialize};

const ID_LEN: usize = 10;
const ALPHANUMERIC: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Deserialize, Serialize)]
struct Stored {
    id: String,
    history_count: u64,
}

/// Loads or creates the persistent identity file at `path`.
pub struct PermaData {
    path: PathBuf,
    stored: Stored,
}

impl PermaData {
    /// Loads `path` if it exists and parses as TOML; otherwise generates a
    /// fresh random ID with `history_count = 0` and writes it out.
    ///
    /// # Errors
    ///
    /// Errors if `path` exists but cannot be read, or if writing a freshly
    /// generated identity fails.
    pub fn load_or_create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let stored = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)
                .unwrap_or_else(|_| Self::fresh()),
            Err(_) => Self::fresh(),
        };
        let this = Self { path, stored };
        this.persist()?;
        Ok(this)
    }

    fn fresh() -> Stored {
        let mut rng = rand::thread_rng();
        let id = (0..ID_LEN)
            .map(|_| ALPHANUMERIC[rng.gen_range(0..ALPHANUMERIC.len())] as char)
            .collect();
        Stored { id, history_count: 0 }
    }

    fn persist(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = toml::to_string(&self.stored).unwrap_or_default();
        std::fs::write(&self.path, body)
    }

    /// This client's persistent real ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.stored.id
    }

    /// Increments and persists the history count, returning the new value.
    ///
    /// # Errors
    ///
    /// Errors if the updated file cannot be written.
    pub fn next_history_count(&mut self) -> io::Result<u64> {
        self.stored.history_count += 1;
        self.persist()?;
        Ok(self.stored.history_count)
    }

    /// Path this identity is persisted at.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_reuses_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uniqID.toml");

        let mut first = PermaData::load_or_create(&path).unwrap();
        let id = first.id().to_owned();
        assert_eq!(id.len(), ID_LEN);
        assert_eq!(first.next_history_count().unwrap(), 1);

        let second = PermaData::load_or_create(&path).unwrap();
        assert_eq!(second.id(), id);
    }
}
