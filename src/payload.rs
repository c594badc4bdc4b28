//! Boot payload and script loading.
//!
//! Payloads can be given inline or via a file path. The provider transports
//! boot payloads base64 encoded; this module owns both conversions.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Errors raised while loading or decoding payloads.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PayloadError {
    /// Raised when both inline and file sources are provided.
    #[error("payload cannot be provided both inline and via file")]
    BothProvided,
    /// Raised when an inline payload is empty or only whitespace.
    #[error("payload must not be empty")]
    InlineEmpty,
    /// Raised when a file path is empty or only whitespace.
    #[error("payload file path must not be empty")]
    FilePathEmpty,
    /// Raised when a file resolves to empty or only whitespace.
    #[error("payload file `{path}` is empty")]
    FileEmpty {
        /// Expanded path.
        path: String,
    },
    /// Raised when reading the file source fails.
    #[error("failed to read payload file `{path}`: {message}")]
    FileRead {
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a stored payload is not valid base64.
    #[error("stored payload is not valid base64: {0}")]
    Decode(String),
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is not set the input is returned unchanged.
///
/// ```
/// # use armada::payload::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Encodes a payload for transport.
#[must_use]
pub fn encode(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

/// Decodes a transported payload. Surrounding whitespace is ignored.
///
/// # Errors
///
/// Returns [`PayloadError::Decode`] for malformed input.
pub fn decode(encoded: &str) -> Result<Vec<u8>, PayloadError> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|err| PayloadError::Decode(err.to_string()))
}

/// Resolves a payload from either an inline value or a file.
///
/// Inline and file sources are mutually exclusive. Emptiness checks ignore
/// whitespace, but the returned bytes are the original content.
///
/// # Errors
///
/// Returns [`PayloadError`] when the inputs are invalid or the file cannot
/// be read.
pub fn resolve_payload(
    inline: Option<&str>,
    file: Option<&str>,
) -> Result<Option<Vec<u8>>, PayloadError> {
    if inline.is_some() && file.is_some() {
        return Err(PayloadError::BothProvided);
    }

    if let Some(payload) = inline {
        if payload.trim().is_empty() {
            return Err(PayloadError::InlineEmpty);
        }
        return Ok(Some(payload.as_bytes().to_vec()));
    }

    let Some(path) = file else {
        return Ok(None);
    };
    read_payload_file(path).map(Some)
}

/// Reads a payload file, expanding `~/`.
///
/// # Errors
///
/// Returns [`PayloadError`] when the path is blank, unreadable, or the
/// file is blank.
pub fn read_payload_file(path: &str) -> Result<Vec<u8>, PayloadError> {
    if path.trim().is_empty() {
        return Err(PayloadError::FilePathEmpty);
    }

    let expanded = expand_tilde(path);
    let content = read_ambient(&expanded).map_err(|message| PayloadError::FileRead {
        path: expanded.clone(),
        message,
    })?;

    if content.iter().all(u8::is_ascii_whitespace) {
        return Err(PayloadError::FileEmpty { path: expanded });
    }
    Ok(content)
}

fn read_ambient(path: &str) -> Result<Vec<u8>, String> {
    let path_buf = Utf8Path::new(path);

    let (dir_path, file_path) = if path_buf.is_absolute() {
        let parent = path_buf
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path_buf}"))?;
        let file_name = path_buf
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path_buf}"))?;
        (parent, Utf8Path::new(file_name))
    } else {
        (Utf8Path::new("."), path_buf)
    };

    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read(file_path).map_err(|err| err.to_string())
}
