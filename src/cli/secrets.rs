use clap::{Args, Subcommand};

use super::CliContext;
use greentic_cloudant::credentials::{CredentialStore, CredentialUpdate};

#[derive(Args, Debug)]
pub struct SecretArgs {
    #[command(subcommand)]
    pub command: SecretCommands,
}

#[derive(Subcommand, Debug)]
pub enum SecretCommands {
    Add { key: String, secret: String },
    Update { key: String, secret: String },
    Delete { key: String },
    /// Store the credentials of a `cloudant` config entity
    Credentials {
        config: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Remove the credentials of a `cloudant` config entity
    Forget { config: String },
}

pub async fn execute(args: SecretArgs, context: &CliContext) -> anyhow::Result<()> {
    let secrets = &context.secrets_manager;
    match args.command {
        SecretCommands::Add { key, secret } => match secrets.add_secret(&key, &secret).await {
            Ok(_) => println!("✅ Secret added."),
            Err(e) => eprintln!("❌ Secret could not be added: {e}"),
        },
        SecretCommands::Update { key, secret } => match secrets.update_secret(&key, &secret).await {
            Ok(_) => println!("✅ Secret updated."),
            Err(e) => eprintln!("❌ Secret could not be updated: {e}"),
        },
        SecretCommands::Delete { key } => match secrets.delete_secret(&key).await {
            Ok(_) => println!("✅ Secret deleted."),
            Err(e) => eprintln!("❌ Secret could not be deleted: {e}"),
        },
        SecretCommands::Credentials {
            config,
            username,
            password,
        } => {
            let store = CredentialStore::new(secrets.clone());
            match store.update(&config, CredentialUpdate { username, password }).await {
                Ok(_) => println!("✅ Credentials for `{config}` stored."),
                Err(e) => eprintln!("❌ Credentials could not be stored: {e}"),
            }
        }
        SecretCommands::Forget { config } => {
            let store = CredentialStore::new(secrets.clone());
            match store.delete(&config).await {
                Ok(_) => println!("✅ Credentials for `{config}` removed."),
                Err(e) => eprintln!("❌ Credentials could not be removed: {e}"),
            }
        }
    }
    Ok(())
}
