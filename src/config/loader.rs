use crate::config::schema::{Settings, ValidationError};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming a settings file.
pub const CONFIG_ENV: &str = "PATCH_KING_CONFIG";

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Toml {
        path: Option<PathBuf>,
        source: toml_edit::de::Error,
    },
    Validation {
        path: Option<PathBuf>,
        source: ValidationError,
    },
}

impl ConfigError {
    fn with_path(self, path: &Path) -> Self {
        let path = path.to_path_buf();
        match self {
            ConfigError::Io { .. } => self,
            ConfigError::Toml { path: None, source } => ConfigError::Toml {
                path: Some(path),
                source,
            },
            ConfigError::Validation { path: None, source } => ConfigError::Validation {
                path: Some(path),
                source,
            },
            other => other,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read settings from {}: {}", path.display(), source)
            }
            ConfigError::Toml { path, source } => match path {
                Some(path) => write!(
                    f,
                    "failed to parse settings TOML ({}): {}",
                    path.display(),
                    source
                ),
                None => write!(f, "failed to parse settings TOML: {}", source),
            },
            ConfigError::Validation { path, source } => match path {
                Some(path) => write!(f, "invalid settings ({}): {}", path.display(), source),
                None => write!(f, "invalid settings: {}", source),
            },
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Toml { source, .. } => Some(source),
            ConfigError::Validation { source, .. } => Some(source),
        }
    }
}

pub fn load_from_str(input: &str) -> Result<Settings, ConfigError> {
    let settings: Settings = toml_edit::de::from_str(input)
        .map_err(|source| ConfigError::Toml { path: None, source })?;
    settings
        .validate()
        .map_err(|source| ConfigError::Validation { path: None, source })?;
    Ok(settings)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_from_str(&contents).map_err(|error| error.with_path(path))
}

/// Locate the settings file to use.
///
/// Priority order:
/// 1. Explicit path (from the command line)
/// 2. `PATCH_KING_CONFIG` environment variable
/// 3. `~/.config/patch-king.toml`
///
/// An explicit path is returned even if it does not exist so that the
/// caller reports the I/O error; the other sources are skipped when absent.
pub fn discover(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(env_path) = env::var(CONFIG_ENV) {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            return Some(path);
        }
        log::warn!("{CONFIG_ENV} is set but path doesn't exist: {env_path}");
    }

    let user = home::home_dir()?.join(".config").join("patch-king.toml");
    user.exists().then_some(user)
}

/// Load settings from the discovered file, or defaults when there is none.
pub fn load_or_default(explicit: Option<&Path>) -> Result<Settings, ConfigError> {
    match discover(explicit) {
        Some(path) => {
            log::debug!("loading settings from {}", path.display());
            load_from_path(path)
        }
        None => Ok(Settings::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_is_default() {
        assert_eq!(load_from_str("").unwrap(), Settings::default());
    }

    #[test]
    fn test_with_path_only_fills_missing_path() {
        let err = load_from_str("[export]\naddress_width = 99\n").unwrap_err();
        let err = err.with_path(Path::new("a.toml"));
        assert!(err.to_string().contains("a.toml"));

        let err = err.with_path(Path::new("b.toml"));
        assert!(!err.to_string().contains("b.toml"));
    }

    #[test]
    fn test_explicit_path_wins() {
        let explicit = Path::new("/nonexistent/patch-king.toml");
        assert_eq!(discover(Some(explicit)), Some(explicit.to_path_buf()));
    }
}
