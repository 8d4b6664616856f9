//! Default configuration values

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "conveyor.yaml";

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "conveyor.toml";

/// Alternative configuration file name
pub const ALT_CONFIG_FILE: &str = ".conveyor.yaml";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_YAML,
        DEFAULT_CONFIG_TOML,
        ALT_CONFIG_FILE,
        ".conveyor.toml",
    ]
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Conveyor Configuration

pipeline:
  build: ["^build"]
  test: ["build"]
  lint: []

npm_client: npm
failure_policy: continue-independent
cancel_policy: wait

cache:
  enabled: true
  dir: .conveyor/cache
  outputs:
    - "lib/**"
    - "dist/**"
  exclude: []
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Config;

    #[test]
    fn test_template_parses() {
        let config: Config = serde_yaml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.pipeline.len(), 3);
        assert_eq!(config.cache.outputs, vec!["lib/**", "dist/**"]);
    }
}
