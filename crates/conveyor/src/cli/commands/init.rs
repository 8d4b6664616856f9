//! Init command

use std::path::PathBuf;

use clap::Args;
use console::style;
use dialoguer::{Confirm, Select};
use tracing::info;

use conveyor_core::config::{validate_config, Config, DEFAULT_CONFIG_TEMPLATE, DEFAULT_CONFIG_YAML};

use crate::cli::output;
use crate::cli::Cli;

/// Create a configuration file
#[derive(Debug, Args)]
pub struct InitCommand {
    /// Force overwrite existing configuration
    #[arg(short, long)]
    pub force: bool,

    /// Use defaults without prompting
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Output file path
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl InitCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(force = self.force, yes = self.yes, "executing init command");
        let cwd = std::env::current_dir()?;
        let config_path = self
            .output
            .clone()
            .unwrap_or_else(|| cwd.join(DEFAULT_CONFIG_YAML));

        if config_path.exists() && !self.force {
            if self.yes {
                anyhow::bail!(
                    "Configuration file already exists at {}. Use --force to overwrite.",
                    config_path.display()
                );
            }

            let overwrite = Confirm::new()
                .with_prompt(format!(
                    "Configuration file already exists at {}. Overwrite?",
                    config_path.display()
                ))
                .default(false)
                .interact()?;

            if !overwrite {
                println!("{}", style("Aborted.").yellow());
                return Ok(());
            }
        }

        let format = if self.yes {
            "yaml"
        } else {
            let formats = ["yaml", "toml"];
            let selection = Select::new()
                .with_prompt("Configuration format")
                .items(&formats)
                .default(0)
                .interact()?;
            formats[selection]
        };

        let config_path =
            if format == "toml" && config_path.extension().is_some_and(|e| e == "yaml") {
                config_path.with_extension("toml")
            } else {
                config_path
            };

        let content = render_config(format)?;
        std::fs::write(&config_path, &content)?;

        if !cli.quiet {
            output::success(&format!(
                "Created configuration at {}",
                output::path_style().apply_to(config_path.display())
            ));
            println!();
            println!("Next steps:");
            println!("  1. Edit the pipeline in {}", config_path.display());
            println!("  2. Run {} to preview the task graph", style("conveyor graph").cyan());
            println!("  3. Run {} to build everything", style("conveyor run build").cyan());
        }

        Ok(())
    }
}

/// Default configuration in the requested format
fn render_config(format: &str) -> anyhow::Result<String> {
    let config: Config = serde_yaml::from_str(DEFAULT_CONFIG_TEMPLATE)?;
    validate_config(&config)?;

    if format == "toml" {
        Ok(toml::to_string_pretty(&config)?)
    } else {
        Ok(DEFAULT_CONFIG_TEMPLATE.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_toml_parses_back() {
        let content = render_config("toml").unwrap();
        let config: Config = toml::from_str(&content).unwrap();
        assert_eq!(config.pipeline["build"], vec!["^build"]);
    }

    #[test]
    fn test_render_yaml_is_template() {
        assert_eq!(render_config("yaml").unwrap(), DEFAULT_CONFIG_TEMPLATE);
    }
}
