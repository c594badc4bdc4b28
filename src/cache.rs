//! File-backed JSON cache with a fixed time-to-live.
//!
//! Each key is one `<key>.json` file holding the value and the time it was
//! stored. Entries older than the TTL read as misses. Unreadable or
//! malformed entries also read as misses so a damaged cache never blocks a
//! command.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const ENTRY_SUFFIX: &str = ".json";

/// Errors raised by [`Cache`].
#[derive(Debug, Error)]
pub enum CacheError {
    /// The key contains characters outside `[A-Za-z0-9_-]`.
    #[error("invalid cache key `{0}`")]
    InvalidKey(String),
    /// No cache location could be derived from the environment.
    #[error("no cache directory: set XDG_CACHE_HOME or HOME")]
    NoLocation,
    /// A file system operation failed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// The value could not be serialised.
    #[error("failed to serialise cache entry `{key}`: {message}")]
    Serialise {
        /// Cache key.
        key: String,
        /// Serialiser message.
        message: String,
    },
}

#[derive(Serialize)]
struct EntryRef<'a, T> {
    stored_at: DateTime<Utc>,
    value: &'a T,
}

#[derive(Deserialize)]
struct Entry<T> {
    stored_at: DateTime<Utc>,
    value: T,
}

/// A directory of TTL-bounded JSON entries.
#[derive(Clone, Debug)]
pub struct Cache {
    root: Utf8PathBuf,
    ttl: TimeDelta,
}

impl Cache {
    /// Opens a cache rooted at `root`. The directory is created lazily on
    /// the first write.
    #[must_use]
    pub const fn new(root: Utf8PathBuf, ttl: TimeDelta) -> Self {
        Self { root, ttl }
    }

    /// Opens the per-project cache under the user cache directory
    /// (`$XDG_CACHE_HOME/armada/<project>`, falling back to
    /// `$HOME/.cache/armada/<project>`).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidKey`] when the project id is not a
    /// plain identifier, or [`CacheError::NoLocation`] when neither
    /// variable is set.
    pub fn for_project(project_id: &str, ttl: TimeDelta) -> Result<Self, CacheError> {
        validate_key(project_id)?;
        let base = std::env::var("XDG_CACHE_HOME")
            .ok()
            .filter(|dir| !dir.trim().is_empty())
            .map(Utf8PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|home| Utf8PathBuf::from(home).join(".cache"))
            })
            .ok_or(CacheError::NoLocation)?;
        Ok(Self::new(base.join("armada").join(project_id), ttl))
    }

    /// Reads a fresh entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidKey`] for malformed keys.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        self.get_at(key, Utc::now())
    }

    /// Reads an entry as of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidKey`] for malformed keys.
    pub fn get_at<T: DeserializeOwned>(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<T>, CacheError> {
        validate_key(key)?;
        let Ok(dir) = Dir::open_ambient_dir(&self.root, ambient_authority()) else {
            return Ok(None);
        };
        let Ok(raw) = dir.read_to_string(entry_name(key)) else {
            return Ok(None);
        };
        let entry: Entry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(key, error = %err, "ignoring malformed cache entry");
                return Ok(None);
            }
        };
        if now - entry.stored_at >= self.ttl {
            debug!(key, stored_at = %entry.stored_at, "cache entry expired");
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    /// Stores `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the key is malformed, the value cannot be
    /// serialised, or the file cannot be written.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        self.put_at(key, value, Utc::now())
    }

    /// Stores `value` under `key` as if written at `now`.
    ///
    /// # Errors
    ///
    /// See [`Cache::put`].
    pub fn put_at<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        now: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        validate_key(key)?;
        let contents = serde_json::to_vec(&EntryRef {
            stored_at: now,
            value,
        })
        .map_err(|err| CacheError::Serialise {
            key: key.to_owned(),
            message: err.to_string(),
        })?;

        let dir = Dir::create_ambient_dir_all(&self.root, ambient_authority())
            .and_then(|()| Dir::open_ambient_dir(&self.root, ambient_authority()))
            .map_err(|err| self.io_error(&self.root, &err))?;
        dir.write(entry_name(key), contents)
            .map_err(|err| self.io_error(&self.root.join(entry_name(key)), &err))
    }

    /// Removes every entry. A missing cache directory is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] when listing or removing entries fails.
    pub fn clear(&self) -> Result<(), CacheError> {
        let dir = match Dir::open_ambient_dir(&self.root, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(self.io_error(&self.root, &err)),
        };
        let entries = dir
            .entries()
            .map_err(|err| self.io_error(&self.root, &err))?;
        for entry in entries {
            let name = entry
                .and_then(|found| found.file_name())
                .map_err(|err| self.io_error(&self.root, &err))?;
            if name.ends_with(ENTRY_SUFFIX) {
                dir.remove_file(&name)
                    .map_err(|err| self.io_error(&self.root.join(&name), &err))?;
            }
        }
        debug!(root = %self.root, "cleared cache");
        Ok(())
    }

    fn io_error(&self, path: &Utf8Path, err: &io::Error) -> CacheError {
        debug!(root = %self.root, %path, error = %err, "cache I/O failed");
        CacheError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

fn entry_name(key: &str) -> String {
    format!("{key}{ENTRY_SUFFIX}")
}

fn validate_key(key: &str) -> Result<(), CacheError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(key.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::directory::Capabilities;

    struct CacheFixture {
        _tmp: TempDir,
        cache: Cache,
    }

    #[fixture]
    fn fixture() -> CacheFixture {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("project"))
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        CacheFixture {
            _tmp: tmp,
            cache: Cache::new(root, TimeDelta::hours(24)),
        }
    }

    fn at(hours: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::hours(hours)
    }

    #[rstest]
    fn returns_fresh_entries(fixture: CacheFixture) {
        let capabilities = Capabilities {
            zones: vec![String::from("fr-par-1")],
            ..Capabilities::default()
        };
        fixture
            .cache
            .put_at("capabilities", &capabilities, at(0))
            .expect("write entry");

        let cached: Option<Capabilities> = fixture
            .cache
            .get_at("capabilities", at(23))
            .expect("read entry");

        assert_eq!(cached, Some(capabilities));
    }

    #[rstest]
    #[case(24)]
    #[case(100)]
    fn expires_entries_after_the_ttl(fixture: CacheFixture, #[case] hours_later: i64) {
        fixture
            .cache
            .put_at("names", &vec!["web"], at(0))
            .expect("write entry");

        let cached: Option<Vec<String>> = fixture
            .cache
            .get_at("names", at(hours_later))
            .expect("read entry");

        assert!(cached.is_none());
    }

    #[rstest]
    fn missing_directory_is_a_miss(fixture: CacheFixture) {
        let cached: Option<Vec<String>> = fixture.cache.get("names").expect("read entry");
        assert!(cached.is_none());
        fixture.cache.clear().expect("clearing nothing succeeds");
    }

    #[rstest]
    fn malformed_entries_are_misses(fixture: CacheFixture) {
        fixture.cache.put("names", &vec!["web"]).expect("write entry");

        let cached: Option<u64> = fixture.cache.get("names").expect("read entry");

        assert!(cached.is_none());
    }

    #[rstest]
    fn clear_removes_every_entry(fixture: CacheFixture) {
        fixture.cache.put("names", &vec!["web"]).expect("write entry");
        fixture
            .cache
            .put("capabilities", &Capabilities::default())
            .expect("write entry");

        fixture.cache.clear().expect("clear succeeds");

        let names: Option<Vec<String>> = fixture.cache.get("names").expect("read entry");
        let capabilities: Option<Capabilities> =
            fixture.cache.get("capabilities").expect("read entry");
        assert!(names.is_none());
        assert!(capabilities.is_none());
    }

    #[rstest]
    #[case("")]
    #[case("../escape")]
    #[case("with space")]
    fn rejects_keys_that_are_not_plain_identifiers(fixture: CacheFixture, #[case] key: &str) {
        assert!(matches!(
            fixture.cache.put(key, &1_u8),
            Err(CacheError::InvalidKey(_))
        ));
    }
}
