use std::{env, path::PathBuf};

use clap::Parser;
use greentic_cloudant::{
    config::{ConfigManager, EnvConfigManager},
    secret::{EnvSecretsManager, SecretsManager},
};

mod cli;

use cli::{Cli, CliContext};

/// Resolve the root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("CLOUDANT_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./cloudant")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();

    let config_manager = ConfigManager(EnvConfigManager::new(root.join("config").join(".env")));
    let secrets_manager = SecretsManager(EnvSecretsManager::new(Some(root.join("secrets"))));
    let context = CliContext::new(root, config_manager, secrets_manager);

    let command = cli.command.unwrap_or_else(cli::default_command);
    cli::execute(&context, command).await
}
