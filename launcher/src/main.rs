// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use launcher::docker::DockerRuntime;
use launcher::identity::{GcePrincipalFetcher, MetadataTokenSource};
use launcher::runner::{ContainerRunner, RunnerOptions};
use launcher::spec::{LaunchSpec, RestartPolicy};
use launcher::verifier::RestVerifierClient;
use tokio_util::sync::CancellationToken;
use tpm_quote::{AkAlgo, TpmDevice};
use tracing::{error, info, warn};

/// Launch a measured workload container bound to this machine's attestation
/// identity.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to the launch spec attribute map (JSON)
    #[arg(long)]
    spec: PathBuf,

    /// Project the verifier challenges are created in
    #[arg(long)]
    project_id: String,

    /// Region of the verifier
    #[arg(long)]
    region: String,

    /// TPM TCTI string (auto-detect when omitted)
    #[arg(long)]
    tcti: Option<String>,

    /// Directory the attestation tokens are written to
    #[arg(long, default_value = launcher::refresher::HOST_TOKEN_DIR)]
    token_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let attributes =
        fs_err::read_to_string(&cli.spec).context("failed to read launch spec file")?;
    let mut launch_spec = LaunchSpec::from_json(&attributes)?;
    launch_spec.project_id = cli.project_id;
    launch_spec.region = cli.region;

    let runtime = Arc::new(DockerRuntime::connect()?);
    let quoter = Box::new(TpmDevice::open(cli.tcti.as_deref(), AkAlgo::Ecc)?);
    let token_source = Arc::new(MetadataTokenSource::new());
    let verifier = Box::new(RestVerifierClient::new(
        &launch_spec.attestation_service_addr,
        &launch_spec.project_id,
        &launch_spec.region,
        token_source.clone(),
    ));
    let principals = Box::new(GcePrincipalFetcher::new(
        launch_spec.impersonate_service_accounts.clone(),
        token_source,
    ));

    let runner = ContainerRunner::new(
        runtime,
        quoter,
        verifier,
        principals,
        launch_spec.clone(),
        RunnerOptions {
            token_dir: cli.token_dir,
            ..Default::default()
        },
    )
    .await?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        }
    });

    let result = loop {
        let result = runner.run(cancel.clone()).await;
        if cancel.is_cancelled() {
            break result;
        }
        match (&result, launch_spec.restart_policy) {
            (_, RestartPolicy::Always) => {
                warn!("workload finished, restarting (policy: always)");
            }
            (Err(err), RestartPolicy::OnFailure) => {
                warn!("workload failed, restarting (policy: on-failure): {err}");
            }
            _ => break result,
        }
    };

    runner.close().await;

    if let Err(err) = &result {
        error!("launch failed: {err:#}");
    }
    result.map_err(Into::into)
}
