//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_pipeline(config)?;
    validate_execution(config)?;
    validate_cache(config)?;
    debug!("configuration validation passed");
    Ok(())
}

/// Shape checks only; dependency resolution happens when the pipeline is parsed
fn validate_pipeline(config: &Config) -> Result<()> {
    for (task, deps) in &config.pipeline {
        if task.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "pipeline".to_string(),
                message: "task names cannot be empty".to_string(),
            }
            .into());
        }

        for dep in deps {
            let name = dep.strip_prefix('^').unwrap_or(dep);
            if name.trim().is_empty() {
                return Err(ConfigError::InvalidPipeline {
                    task: task.clone(),
                    message: format!("dependency '{}' names no task", dep),
                }
                .into());
            }
        }
    }

    Ok(())
}

fn validate_execution(config: &Config) -> Result<()> {
    if config.concurrency == Some(0) {
        return Err(ConfigError::InvalidValue {
            field: "concurrency".to_string(),
            message: "must be at least 1".to_string(),
        }
        .into());
    }

    if config.npm_client.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "npm_client".to_string(),
            message: "npm client cannot be empty".to_string(),
        }
        .into());
    }

    Ok(())
}

fn validate_cache(config: &Config) -> Result<()> {
    for (field, patterns) in [
        ("cache.outputs", &config.cache.outputs),
        ("cache.exclude", &config.cache.exclude),
    ] {
        for pattern in patterns {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: format!("'{}': {}", pattern, e),
                }
                .into());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let config = Config {
            concurrency: Some(0),
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_bare_caret() {
        let mut config = Config::default();
        config
            .pipeline
            .insert("deploy".to_string(), vec!["^".to_string()]);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_bad_output_glob() {
        let mut config = Config::default();
        config.cache.outputs = vec!["lib/[".to_string()];
        assert!(validate_config(&config).is_err());
    }
}
