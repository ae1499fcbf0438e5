use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, bail};
use clap::Args;
use futures::future::join_all;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal,
    task::JoinHandle,
};
use tracing::{error, info, warn};

use super::{CliContext, services::service_source};
use greentic_cloudant::{
    admin::{self, AdminState},
    credentials::CredentialStore,
    flow::Flow,
    logger::{LogLevel, init_tracing},
    message::Message,
    node::NodeContext,
    runtime::FlowRuntime,
    services::ServiceBindings,
    store::HttpConnector,
};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Flow file to deploy. Defaults to `<root>/flows/flow.yaml`
    #[arg(long)]
    pub flow: Option<PathBuf>,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// OpenTelemetry endpoint (e.g. http://localhost:4317)
    #[arg(long)]
    pub otel_endpoint: Option<String>,

    /// Read service bindings from this file instead of VCAP_SERVICES
    #[arg(long)]
    pub services: Option<PathBuf>,

    /// Do not serve the credential admin endpoints
    #[arg(long, default_value_t = false)]
    pub no_admin: bool,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            flow: None,
            log_level: "info".to_string(),
            otel_endpoint: None,
            services: None,
            no_admin: false,
        }
    }
}

/// One line on stdin: `{"node": "<node id>", "msg": {...}}`.
#[derive(Debug, Deserialize)]
struct Inbound {
    node: String,
    msg: Message,
}

/// Message tasks started from stdin. Finished ones are dropped as new ones arrive.
#[derive(Default)]
struct InFlight(Vec<JoinHandle<()>>);

impl InFlight {
    fn track(&mut self, handle: JoinHandle<()>) {
        self.0.retain(|h| !h.is_finished());
        self.0.push(handle);
    }

    async fn finish(self) {
        for result in join_all(self.0).await {
            if let Err(e) = result {
                error!("message task failed: {e}");
            }
        }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let telemetry = init_tracing(
        &context.root,
        "logs/cloudant.log",
        "logs/cloudant-events.json",
        LogLevel::parse(&args.log_level),
        args.otel_endpoint.clone(),
    )
    .context("could not create logger")?;

    let flow_file = args.flow.unwrap_or_else(|| context.default_flow());
    let flow = Flow::from_path(&flow_file)
        .with_context(|| format!("could not load flow {}", flow_file.display()))?;
    if let Err(errors) = flow.validate() {
        for e in &errors {
            error!("{e}");
        }
        bail!("flow {} is invalid", flow_file.display());
    }

    let source = service_source(args.services, context).await;
    let bindings = source.load().unwrap_or_else(|e| {
        warn!("no service bindings: {e}");
        ServiceBindings::empty()
    });

    let credentials = CredentialStore::new(context.secrets_manager.clone());
    let base = NodeContext::new(Arc::new(bindings), Arc::new(HttpConnector));
    let (runtime, mut emissions) = FlowRuntime::new(base);

    let report = runtime.deploy(&flow, &credentials).await;
    for (node, e) in &report.failed {
        eprintln!("❌ {node}: {e}");
    }
    println!(
        "Flow `{}` deployed: {} node(s) running, {} failed.",
        flow.id,
        report.started.len(),
        report.failed.len()
    );

    if !args.no_admin {
        let addr = context.config_manager.admin_addr().await;
        let state = AdminState {
            credentials: credentials.clone(),
            services: source,
        };
        tokio::spawn(async move {
            if let Err(e) = admin::serve(&addr, state).await {
                error!("admin endpoints stopped: {e:#}");
            }
        });
    }

    let printer = tokio::spawn(async move {
        while let Some(emission) = emissions.recv().await {
            match serde_json::to_string(&emission) {
                Ok(line) => println!("{line}"),
                Err(e) => error!("could not print emission: {e}"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = InFlight::default();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let inbound: Inbound = match serde_json::from_str(&line) {
                    Ok(inbound) => inbound,
                    Err(e) => {
                        eprintln!("❌ could not parse input line: {e}");
                        continue;
                    }
                };
                match runtime.dispatch(&inbound.node, inbound.msg) {
                    Ok(handle) => in_flight.track(handle),
                    Err(e) => eprintln!("❌ {e}"),
                }
            }
            _ = signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    in_flight.finish().await;
    drop(runtime);
    let _ = printer.await;

    info!("runtime shutting down");
    telemetry.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finished_tasks_are_dropped() {
        let mut in_flight = InFlight::default();
        in_flight.track(tokio::spawn(async {}));
        while !in_flight.0[0].is_finished() {
            tokio::task::yield_now().await;
        }

        let pending = tokio::spawn(std::future::pending::<()>());
        let abort = pending.abort_handle();
        in_flight.track(pending);
        assert_eq!(in_flight.0.len(), 1);

        abort.abort();
        in_flight.finish().await;
    }
}
