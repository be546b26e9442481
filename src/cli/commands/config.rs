//! Config command implementation.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = "config/keel.toml")]
        config: PathBuf,
    },
    /// Print configuration with defaults.
    Show {
        /// Config file path.
        #[arg(short, long, default_value = "config/keel.toml")]
        config: PathBuf,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Generate a configuration template.
    Generate {
        /// Output file path.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config, format } => show_config(&config, &format),
        ConfigCommand::Generate { output } => generate_config(output.as_deref()),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }
    let config = Config::from_file(path)?;

    println!("✓ Config file is valid");
    if config.store.backend == "memory" {
        println!("  ⚠ Warning: store.backend is 'memory', state is lost on exit");
    }
    if config.environment.admin_password.is_some() {
        println!("  ⚠ Warning: environment.admin_password is set in the file");
    }
    for (name, file) in [
        ("server.tls_cert_path", &config.server.tls_cert_path),
        ("server.tls_key_path", &config.server.tls_key_path),
    ] {
        if !Path::new(file).exists() {
            println!("  ⚠ Warning: {} does not exist: {}", name, file);
        }
    }
    println!("✓ Configuration validation complete");
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = Config::from_file(path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        _ => println!("{}", toml::to_string_pretty(&config)?),
    }
    Ok(())
}

fn generate_config(output: Option<&Path>) -> Result<()> {
    let template = config_template();
    match output {
        Some(path) => {
            std::fs::write(path, &template)?;
            println!("Generated config template: {:?}", path);
        }
        None => println!("{}", template),
    }
    Ok(())
}

fn config_template() -> String {
    format!(
        r#"# Keel Configuration

[server]
bind = "127.0.0.1:17070"
tls_cert_path = "certs/server.pem"
tls_key_path = "certs/server-key.pem"
login_rate_limit = 10
ping_interval_ms = 10000
max_frame_bytes = 4194304

[store]
backend = "journal"
data_dir = "data"

[txn]
max_attempts = 3

[environment]
uuid = "{}"
name = "default"
admin_user = "admin"
# Only needed on first start, when the environment is created.
# admin_password = ""

[telemetry]
log_level = "info"
"#,
        uuid::Uuid::new_v4()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses() {
        let config = Config::from_toml(&config_template()).unwrap();
        assert_eq!(config.store.backend, "journal");
        assert_eq!(config.server.login_rate_limit, 10);
        assert!(config.environment.admin_password.is_none());
    }

    #[test]
    fn test_validate_written_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.toml");
        generate_config(Some(&path)).unwrap();
        validate_config(&path).unwrap();
        assert!(validate_config(&dir.path().join("missing.toml")).is_err());
    }
}
