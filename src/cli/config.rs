use clap::{Args, Subcommand};

use super::CliContext;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    Add { key: String, value: String },
    Update { key: String, value: String },
    Delete { key: String },
    /// Print every configured key and value
    List,
}

pub async fn execute(args: ConfigArgs, context: &CliContext) -> anyhow::Result<()> {
    let config = &context.config_manager.0;
    match args.command {
        ConfigCommands::Add { key, value } => match config.set(&key, &value).await {
            Ok(_) => println!("✅ Config added."),
            Err(e) => eprintln!("❌ Config could not be added: {e}"),
        },
        ConfigCommands::Update { key, value } => match config.set(&key, &value).await {
            Ok(_) => println!("✅ Config updated."),
            Err(e) => eprintln!("❌ Config could not be updated: {e}"),
        },
        ConfigCommands::Delete { key } => {
            config.del(&key).await;
            println!("✅ Config deleted.");
        }
        ConfigCommands::List => {
            let mut entries = config.as_vec().await;
            entries.sort();
            for (key, value) in entries {
                println!("{key}={value}");
            }
        }
    }
    Ok(())
}
