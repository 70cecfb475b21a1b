//! Secret resolution for API tokens, keys and the tunnel token.
//!
//! A secret is taken from its command-line flag, then from a file named by
//! the matching `-file` flag, then from an environment variable. File
//! contents are trimmed so editors' trailing newlines do not leak into
//! credentials.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Errors raised while resolving a secret.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SecretError {
    /// Raised when a required secret is absent from every source.
    #[error("missing {label}: pass --{label} or --{label}-file, or set {env_var}")]
    Missing {
        /// Flag stem naming the secret, for example `access-token`.
        label: String,
        /// Environment variable consulted last.
        env_var: String,
    },
    /// Raised when the secret file is empty after trimming.
    #[error("{label} file `{path}` is empty")]
    EmptyFile {
        /// Flag stem naming the secret.
        label: String,
        /// Expanded path of the file.
        path: String,
    },
    /// Raised when the secret file cannot be read.
    #[error("failed to read {label} file `{path}`: {message}")]
    FileRead {
        /// Flag stem naming the secret.
        label: String,
        /// Expanded path of the file.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Where one secret may come from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SecretSource {
    /// Flag stem used in messages, for example `access-token`.
    pub label: String,
    /// Value passed directly on the command line.
    pub flag: Option<String>,
    /// Path passed through the `-file` flag.
    pub file: Option<String>,
    /// Environment variable checked when neither flag is set.
    pub env_var: String,
}

impl SecretSource {
    /// Creates a source for `label` falling back to `env_var`.
    #[must_use]
    pub fn new(label: impl Into<String>, env_var: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            env_var: env_var.into(),
            ..Self::default()
        }
    }

    /// Sets the inline flag value.
    #[must_use]
    pub fn flag(mut self, value: Option<String>) -> Self {
        self.flag = value;
        self
    }

    /// Sets the secret file path.
    #[must_use]
    pub fn file(mut self, path: Option<String>) -> Self {
        self.file = path;
        self
    }

    /// Resolves the secret, returning `None` when no source provides one.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError`] when the named file cannot be read or is empty.
    pub fn resolve(&self) -> Result<Option<String>, SecretError> {
        if let Some(value) = non_blank(self.flag.as_deref()) {
            return Ok(Some(value.to_owned()));
        }
        if let Some(path) = non_blank(self.file.as_deref()) {
            return self.read_file(path).map(Some);
        }
        Ok(std::env::var(&self.env_var)
            .ok()
            .filter(|value| !value.trim().is_empty()))
    }

    /// Resolves a secret that must be present.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Missing`] naming every source when none
    /// provides a value, and the file errors of [`Self::resolve`].
    pub fn require(&self) -> Result<String, SecretError> {
        self.resolve()?.ok_or_else(|| SecretError::Missing {
            label: self.label.clone(),
            env_var: self.env_var.clone(),
        })
    }

    fn read_file(&self, path: &str) -> Result<String, SecretError> {
        let expanded = expand_tilde(path);
        let contents = read_to_string_ambient(&expanded).map_err(|message| {
            SecretError::FileRead {
                label: self.label.clone(),
                path: expanded.clone(),
                message,
            }
        })?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Err(SecretError::EmptyFile {
                label: self.label.clone(),
                path: expanded,
            });
        }
        Ok(trimmed.to_owned())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|inner| !inner.trim().is_empty())
}

/// Expands a leading `~/` using `HOME`.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

fn read_to_string_ambient(path: &str) -> Result<String, String> {
    let full = Utf8Path::new(path);
    let (dir_path, file_path) = match (full.parent(), full.file_name()) {
        (Some(parent), Some(name)) if !parent.as_str().is_empty() => (parent, Utf8Path::new(name)),
        _ => (Utf8Path::new("."), full),
    };
    let dir = Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}
