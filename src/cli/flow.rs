use std::path::PathBuf;

use anyhow::bail;
use clap::Args;

use super::CliContext;
use greentic_cloudant::flow::Flow;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Flow file (.yaml, .yml or .json). Defaults to `<root>/flows/flow.yaml`
    pub file: Option<PathBuf>,
}

pub async fn execute(args: ValidateArgs, context: &CliContext) -> anyhow::Result<()> {
    let file = args.file.unwrap_or_else(|| context.default_flow());
    if !file.exists() {
        bail!("File does not exist: {}", file.display());
    }

    let flow = Flow::from_path(&file)?;
    match flow.validate() {
        Ok(()) => {
            println!(
                "✅ Flow `{}` is valid ({} config entities, {} nodes).",
                flow.id,
                flow.config.len(),
                flow.nodes.len()
            );
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("❌ {error}");
            }
            bail!("Validation failed with {} error(s)", errors.len())
        }
    }
}
