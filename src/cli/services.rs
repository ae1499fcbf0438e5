use std::path::PathBuf;

use clap::Args;

use super::CliContext;
use greentic_cloudant::{config::SERVICES_FILE_KEY, services::ServiceSource};

#[derive(Args, Debug)]
pub struct ServicesArgs {
    /// Read bindings from this file instead of VCAP_SERVICES
    #[arg(long)]
    pub file: Option<PathBuf>,
}

/// `--file`, then the configured services file, then `VCAP_SERVICES`.
pub async fn service_source(file: Option<PathBuf>, context: &CliContext) -> ServiceSource {
    if let Some(file) = file {
        return ServiceSource::File(file);
    }
    match context.config_manager.0.get(SERVICES_FILE_KEY).await {
        Some(path) if !path.trim().is_empty() => ServiceSource::File(PathBuf::from(path)),
        _ => ServiceSource::Environment,
    }
}

pub async fn execute(args: ServicesArgs, context: &CliContext) -> anyhow::Result<()> {
    let bindings = service_source(args.file, context).await.load()?;
    let services = bindings.cloudant_services();
    if services.is_empty() {
        println!("No Cloudant services bound.");
    }
    for service in services {
        println!("{}\t{}", service.name, service.label);
    }
    Ok(())
}
