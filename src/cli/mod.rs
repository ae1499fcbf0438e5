use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod config;
pub mod flow;
pub mod run;
pub mod schema;
pub mod secrets;
pub mod services;

use config::ConfigArgs;
use flow::ValidateArgs;
use run::RunArgs;
use schema::SchemaArgs;
use secrets::SecretArgs;
use services::ServicesArgs;

use greentic_cloudant::{config::ConfigManager, secret::SecretsManager};

#[derive(Parser, Debug)]
#[command(
    name = "greentic-cloudant",
    about = "Cloudant and CouchDB document nodes for greentic flows",
    version = "0.2.0"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Deploy a flow and feed it messages from stdin
    Run(RunArgs),

    /// Check a flow file without connecting to anything
    Validate(ValidateArgs),

    /// Emit JSON-Schema for flows and node types
    Schema(SchemaArgs),

    /// List the Cloudant services bound to this process
    Services(ServicesArgs),

    /// Handle secrets and config credentials
    Secrets(SecretArgs),

    /// Handle configuration
    Config(ConfigArgs),
}

#[derive(Clone)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
    pub secrets_manager: SecretsManager,
}

impl CliContext {
    pub fn new(root: PathBuf, config_manager: ConfigManager, secrets_manager: SecretsManager) -> Self {
        Self {
            root,
            config_manager,
            secrets_manager,
        }
    }

    /// The default flow file under the root directory.
    pub fn default_flow(&self) -> PathBuf {
        self.root.join("flows").join("flow.yaml")
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Validate(args) => flow::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
        Commands::Services(args) => services::execute(args, context).await,
        Commands::Secrets(args) => secrets::execute(args, context).await,
        Commands::Config(args) => config::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}
