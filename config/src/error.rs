use std::path::PathBuf;

/// Errors raised while discovering, parsing, or resolving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("action '{action}' has unknown source '{source_name}'")]
    UnknownActionSource { action: String, source_name: String },

    #[error("preset '{source_name}' could not be resolved: {message}")]
    PresetResolution {
        source_name: String,
        message: String,
    },

    #[error("preset package '{source_name}' has no preset.toml at {}", .path.display())]
    PresetFileMissing { source_name: String, path: PathBuf },

    #[error("no project definition found in {}", .dir.display())]
    NoProjectDefinition { dir: PathBuf },

    #[error("failed to write config dump to {}: {source}", .path.display())]
    DumpWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_source() {
        let err = ConfigError::UnknownActionSource {
            action: "format".to_string(),
            source_name: "acme.bogus".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "action 'format' has unknown source 'acme.bogus'"
        );

        let err = ConfigError::PresetFileMissing {
            source_name: "acme_preset".to_string(),
            path: PathBuf::from("/pkg/acme_preset/preset.toml"),
        };
        assert!(err.to_string().contains("acme_preset"));
        assert!(err.to_string().contains("/pkg/acme_preset/preset.toml"));
    }

    #[test]
    fn io_error_keeps_its_cause() {
        let err = ConfigError::Io {
            path: PathBuf::from("/ws/pyproject.toml"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert!(std::error::Error::source(&err).is_some());
    }
}
