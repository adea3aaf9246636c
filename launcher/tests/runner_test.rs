// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! End-to-end launcher tests against in-memory runtime, TPM, and verifier
//! fakes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cos_eventlog::{CosEventType, EventLog};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tpm_quote::{PcrSelection, PcrValue, Quoter, TpmQuote};

use launcher::agent::AttestationAgent;
use launcher::error::LauncherError;
use launcher::identity::PrincipalFetcher;
use launcher::image::ImageError;
use launcher::policy::{ALLOW_CMD_OVERRIDE_LABEL, ALLOW_ENV_OVERRIDE_LABEL};
use launcher::refresher::{RetryPolicy, TokenRefresher, TOKEN_FILE};
use launcher::runner::{ContainerRunner, RunnerOptions};
use launcher::runtime::{
    ContainerRuntime, CreateContainerRequest, ExitStatus, ImageConfig, ImageHandle, ProcessSpec,
    RegistryAuth, Task, TaskStdio, CONTAINER_ID,
};
use launcher::spec::{EnvVar, LaunchSpec, RestartPolicy};
use launcher::verifier::{AttestationRequest, Challenge, VerifierClient, VerifierError};

const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

// ---------------------------------------------------------------------------
// Fakes

#[derive(Debug)]
struct FakeRuntimeState {
    labels: HashMap<String, String>,
    media_type: String,
    entrypoint: Vec<String>,
    image_cmd: Vec<String>,
    image_env: Vec<String>,
    image_id: Option<String>,
    preexisting_container: bool,
    exit_code: i64,
    containers: HashMap<String, CreateContainerRequest>,
    deleted_containers: Vec<String>,
    tasks_created: usize,
    tasks_deleted: usize,
}

impl Default for FakeRuntimeState {
    fn default() -> Self {
        Self {
            labels: HashMap::new(),
            media_type: DOCKER_CONFIG_MEDIA_TYPE.to_string(),
            entrypoint: vec!["/entrypoint".to_string()],
            image_cmd: Vec::new(),
            image_env: vec!["PATH=/usr/bin".to_string()],
            image_id: Some("sha256:imagecfg".to_string()),
            preexisting_container: false,
            exit_code: 0,
            containers: HashMap::new(),
            deleted_containers: Vec::new(),
            tasks_created: 0,
            tasks_deleted: 0,
        }
    }
}

#[derive(Clone, Default)]
struct FakeRuntime {
    state: Arc<Mutex<FakeRuntimeState>>,
}

impl FakeRuntime {
    fn lock(&self) -> std::sync::MutexGuard<'_, FakeRuntimeState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_image(
        &self,
        image_ref: &str,
        _credential: Option<RegistryAuth>,
    ) -> Result<ImageHandle> {
        let state = self.lock();
        Ok(ImageHandle {
            reference: image_ref.to_string(),
            digest: "sha256:abc123".to_string(),
            id: state.image_id.clone(),
        })
    }

    async fn image_config(&self, _image: &ImageHandle) -> Result<ImageConfig> {
        let state = self.lock();
        let content = serde_json::to_vec(&serde_json::json!({
            "config": {
                "Labels": state.labels,
                "Entrypoint": state.entrypoint,
                "Cmd": state.image_cmd,
                "Env": state.image_env,
            }
        }))?;
        Ok(ImageConfig {
            media_type: state.media_type.clone(),
            content,
        })
    }

    async fn container_exists(&self, container_id: &str) -> Result<bool> {
        let state = self.lock();
        Ok(state.preexisting_container || state.containers.contains_key(container_id))
    }

    async fn delete_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.preexisting_container = false;
        state.containers.remove(container_id);
        state.deleted_containers.push(container_id.to_string());
        Ok(())
    }

    async fn create_container(&self, request: CreateContainerRequest) -> Result<()> {
        let mut state = self.lock();
        state.containers.insert(request.container_id.clone(), request);
        Ok(())
    }

    async fn container_spec(&self, container_id: &str) -> Result<ProcessSpec> {
        let state = self.lock();
        let request = state
            .containers
            .get(container_id)
            .ok_or_else(|| anyhow::anyhow!("no such container {container_id}"))?;
        let mut args = state.entrypoint.clone();
        if request.cmd_override.is_empty() {
            args.extend(state.image_cmd.clone());
        } else {
            args.extend(request.cmd_override.clone());
        }
        let mut env = state.image_env.clone();
        env.extend(request.envs.clone());
        Ok(ProcessSpec { args, env })
    }

    async fn create_task(&self, _container_id: &str, _stdio: TaskStdio) -> Result<Box<dyn Task>> {
        let mut state = self.lock();
        state.tasks_created += 1;
        Ok(Box::new(FakeTask {
            exit_code: state.exit_code,
            runtime: self.clone(),
            sender: None,
        }))
    }
}

struct FakeTask {
    exit_code: i64,
    runtime: FakeRuntime,
    sender: Option<oneshot::Sender<ExitStatus>>,
}

#[async_trait]
impl Task for FakeTask {
    async fn wait(&mut self) -> Result<oneshot::Receiver<ExitStatus>> {
        let (tx, rx) = oneshot::channel();
        self.sender = Some(tx);
        Ok(rx)
    }

    async fn start(&mut self) -> Result<()> {
        let sender = self
            .sender
            .take()
            .ok_or_else(|| anyhow::anyhow!("wait must be registered before start"))?;
        let _ = sender.send(ExitStatus {
            code: self.exit_code,
        });
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        self.runtime.lock().tasks_deleted += 1;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct FakeQuoter {
    extends: Arc<Mutex<Vec<(u32, [u8; 32])>>>,
}

impl Quoter for FakeQuoter {
    fn quote(&mut self, selection: &PcrSelection, extra_data: &[u8]) -> Result<TpmQuote> {
        Ok(TpmQuote {
            message: b"tpms-attest".to_vec(),
            signature: b"tpmt-signature".to_vec(),
            pcr_values: self.read_pcrs(selection)?,
            qualifying_data: extra_data.to_vec(),
        })
    }

    fn extend_pcr(&mut self, pcr: u32, digest: &[u8; 32]) -> Result<()> {
        self.extends.lock().unwrap().push((pcr, *digest));
        Ok(())
    }

    fn read_pcrs(&mut self, selection: &PcrSelection) -> Result<Vec<PcrValue>> {
        Ok(selection
            .pcrs
            .iter()
            .map(|&index| PcrValue {
                index,
                algorithm: selection.bank.clone(),
                value: vec![0u8; 32],
            })
            .collect())
    }
}

/// What the fake verifier does on one verify call.
#[derive(Debug, Clone, Copy)]
enum VerifyStep {
    /// Mint a token expiring this many seconds from now (may be negative).
    Token(i64),
    /// Fail with a transport error.
    TransportError,
}

#[derive(Default)]
struct FakeVerifierState {
    steps: VecDeque<VerifyStep>,
    last_request: Option<AttestationRequest>,
    last_token: Vec<u8>,
}

#[derive(Clone, Default)]
struct FakeVerifier {
    state: Arc<Mutex<FakeVerifierState>>,
    verify_calls: Arc<AtomicUsize>,
}

impl FakeVerifier {
    fn with_steps(steps: &[VerifyStep]) -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().steps = steps.iter().copied().collect();
        fake
    }

    fn last_request(&self) -> AttestationRequest {
        self.state
            .lock()
            .unwrap()
            .last_request
            .clone()
            .expect("no attestation request recorded")
    }

    fn last_token(&self) -> Vec<u8> {
        self.state.lock().unwrap().last_token.clone()
    }
}

fn make_jwt(exp: i64, serial: usize) -> Vec<u8> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        serde_json::json!({
            "aud": "projects/test/locations/us-central1/challenges/42",
            "iss": "https://confidentialcomputing.googleapis.com",
            "exp": exp,
            "jti": format!("token-{serial}"),
        })
        .to_string(),
    );
    format!("{header}.{claims}.c2lnbmF0dXJl").into_bytes()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[async_trait]
impl VerifierClient for FakeVerifier {
    async fn create_challenge(&self) -> Result<Challenge, VerifierError> {
        Ok(Challenge {
            name: "projects/test/locations/us-central1/challenges/42".to_string(),
            nonce: b"challenge-nonce".to_vec(),
        })
    }

    async fn verify_attestation(
        &self,
        request: AttestationRequest,
    ) -> Result<Vec<u8>, VerifierError> {
        let serial = self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let step = state.steps.pop_front().unwrap_or(VerifyStep::Token(3600));
        match step {
            VerifyStep::TransportError => Err(VerifierError::Transport(anyhow::anyhow!(
                "connection reset"
            ))),
            VerifyStep::Token(offset) => {
                let token = make_jwt(unix_now() + offset, serial);
                state.last_request = Some(request);
                state.last_token = token.clone();
                Ok(token)
            }
        }
    }
}

#[derive(Clone, Default)]
struct FakePrincipals {
    audiences: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PrincipalFetcher for FakePrincipals {
    async fn fetch(&self, audience: &str) -> Result<Vec<Vec<u8>>> {
        self.audiences.lock().unwrap().push(audience.to_string());
        Ok(vec![
            b"instance-identity-token".to_vec(),
            b"impersonated-token".to_vec(),
        ])
    }
}

// ---------------------------------------------------------------------------
// Harness

struct Harness {
    runtime: FakeRuntime,
    quoter: FakeQuoter,
    verifier: FakeVerifier,
    principals: FakePrincipals,
    token_dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            runtime: FakeRuntime::default(),
            quoter: FakeQuoter::default(),
            verifier: FakeVerifier::default(),
            principals: FakePrincipals::default(),
            token_dir: tempfile::TempDir::new().unwrap(),
        }
    }

    fn permissive_labels(&self) {
        let mut state = self.runtime.lock();
        state
            .labels
            .insert(ALLOW_CMD_OVERRIDE_LABEL.to_string(), "true".to_string());
        state
            .labels
            .insert(ALLOW_ENV_OVERRIDE_LABEL.to_string(), "FOO".to_string());
    }

    fn options(&self) -> RunnerOptions {
        RunnerOptions {
            token_dir: self.token_dir.path().to_path_buf(),
            retry_policy: RetryPolicy {
                initial_interval: Duration::from_millis(10),
                max_interval: Duration::from_millis(100),
                ..Default::default()
            },
        }
    }

    async fn runner(&self, spec: LaunchSpec) -> Result<ContainerRunner, LauncherError> {
        ContainerRunner::new(
            Arc::new(self.runtime.clone()),
            Box::new(self.quoter.clone()),
            Box::new(self.verifier.clone()),
            Box::new(self.principals.clone()),
            spec,
            self.options(),
        )
        .await
    }

    fn token_file(&self) -> std::path::PathBuf {
        self.token_dir.path().join(TOKEN_FILE)
    }
}

fn base_spec() -> LaunchSpec {
    LaunchSpec {
        image_ref: "gcr.io/x/app@sha256:abc".to_string(),
        cmd: vec!["./run".to_string(), "--flag".to_string()],
        envs: vec![EnvVar {
            name: "FOO".to_string(),
            value: "bar".to_string(),
        }],
        restart_policy: RestartPolicy::Never,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Scenarios

#[tokio::test]
async fn happy_path_runs_and_measures_in_order() {
    let harness = Harness::new();
    harness.permissive_labels();

    let runner = harness.runner(base_spec()).await.unwrap();
    runner.run(CancellationToken::new()).await.unwrap();

    // The first refresh happened before the task started, and the token is
    // on disk, byte-identical to what the verifier minted.
    let on_disk = std::fs::read(harness.token_file()).unwrap();
    assert_eq!(on_disk, harness.verifier.last_token());

    // Principal tokens were bound to the challenge name.
    assert_eq!(
        harness.principals.audiences.lock().unwrap().as_slice(),
        ["projects/test/locations/us-central1/challenges/42"]
    );

    // The event log shipped to the verifier replays the measured sequence.
    let request = harness.verifier.last_request();
    let log = EventLog::decode(&request.canonical_event_log).unwrap();
    let types: Vec<CosEventType> = log.records().iter().map(|r| r.event.event_type).collect();
    assert_eq!(
        types,
        vec![
            CosEventType::ImageRef,
            CosEventType::ImageDigest,
            CosEventType::RestartPolicy,
            CosEventType::ImageId,
            // entrypoint + cmd override
            CosEventType::Arg,
            CosEventType::Arg,
            CosEventType::Arg,
            // image env + operator env + HOSTNAME injection
            CosEventType::EnvVar,
            CosEventType::EnvVar,
            CosEventType::EnvVar,
            CosEventType::OverrideEnv,
            CosEventType::OverrideArg,
            CosEventType::OverrideArg,
            CosEventType::LaunchSeparator,
        ]
    );

    // The PCR extensions mirror the log: same digests, same order, and the
    // replayed log equals the PCR value folded from those extensions.
    let extends = harness.quoter.extends.lock().unwrap().clone();
    let log_digests: Vec<&[u8]> = log.records().iter().map(|r| r.digest.as_slice()).collect();
    assert_eq!(
        extends.iter().map(|(_, d)| d.as_slice()).collect::<Vec<_>>(),
        log_digests
    );
    let mut pcr = [0u8; 32];
    for (index, digest) in &extends {
        assert_eq!(*index, cos_eventlog::COS_EVENT_PCR);
        let mut hasher = Sha256::new();
        hasher.update(pcr);
        hasher.update(digest);
        pcr = hasher.finalize().into();
    }
    assert_eq!(log.replay(), pcr);

    // The quote covered the challenge nonce.
    assert_eq!(request.quote.qualifying_data, b"challenge-nonce");
}

#[tokio::test]
async fn policy_violation_fails_before_container_creation() {
    let harness = Harness::new();
    // No labels: default-deny for both overrides.
    let err = harness.runner(base_spec()).await.unwrap_err();
    assert!(matches!(err, LauncherError::PolicyViolation(_)));
    assert!(harness.runtime.lock().containers.is_empty());
}

#[tokio::test]
async fn missing_entrypoint_fails_and_deletes_container() {
    let harness = Harness::new();
    harness.permissive_labels();
    {
        let mut state = harness.runtime.lock();
        state.entrypoint = Vec::new();
        state.image_cmd = Vec::new();
    }

    let mut spec = base_spec();
    spec.envs = Vec::new();
    let err = harness.runner(spec).await.unwrap_err();
    assert!(matches!(err, LauncherError::EntrypointMissing { .. }));

    let state = harness.runtime.lock();
    assert!(state.containers.is_empty());
    assert!(state
        .deleted_containers
        .contains(&CONTAINER_ID.to_string()));
}

#[tokio::test]
async fn unknown_media_type_is_an_image_error() {
    let harness = Harness::new();
    harness.runtime.lock().media_type = "application/x-unknown".to_string();
    let err = harness.runner(base_spec()).await.unwrap_err();
    assert!(matches!(
        err,
        LauncherError::Image(ImageError::UnknownMediaType(_))
    ));
}

#[tokio::test]
async fn stale_container_is_cleaned_up_at_construction() {
    let harness = Harness::new();
    harness.permissive_labels();
    harness.runtime.lock().preexisting_container = true;

    harness.runner(base_spec()).await.unwrap();
    assert!(harness
        .runtime
        .lock()
        .deleted_containers
        .contains(&CONTAINER_ID.to_string()));
}

#[tokio::test]
async fn expired_verifier_token_fails_run_before_task_start() {
    let harness = Harness::new();
    harness.permissive_labels();
    harness
        .verifier
        .state
        .lock()
        .unwrap()
        .steps
        .push_back(VerifyStep::Token(-1));

    let runner = harness.runner(base_spec()).await.unwrap();
    let err = runner.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, LauncherError::TokenExpired));
    assert_eq!(harness.runtime.lock().tasks_created, 0);
}

#[tokio::test]
async fn nonzero_workload_exit_surfaces_the_code() {
    let harness = Harness::new();
    harness.permissive_labels();
    harness.runtime.lock().exit_code = 42;

    let runner = harness.runner(base_spec()).await.unwrap();
    let err = runner.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.workload_exit_code(), Some(42));

    let state = harness.runtime.lock();
    assert_eq!(state.tasks_created, 1);
    assert_eq!(state.tasks_deleted, 1);
}

#[tokio::test]
async fn close_is_idempotent() {
    let harness = Harness::new();
    harness.permissive_labels();
    let runner = harness.runner(base_spec()).await.unwrap();
    runner.close().await;
    runner.close().await;
    let deletes = harness
        .runtime
        .lock()
        .deleted_containers
        .iter()
        .filter(|id| id.as_str() == CONTAINER_ID)
        .count();
    assert_eq!(deletes, 2);
}

#[tokio::test]
async fn background_refresh_recovers_from_transient_failures() {
    let harness = Harness::new();
    // First refresh succeeds with a short-lived token, then the verifier is
    // unreachable three times, then recovers.
    let verifier = FakeVerifier::with_steps(&[
        VerifyStep::Token(2),
        VerifyStep::TransportError,
        VerifyStep::TransportError,
        VerifyStep::TransportError,
        VerifyStep::Token(3600),
    ]);

    let agent = Arc::new(AttestationAgent::new(
        Box::new(harness.quoter.clone()),
        Box::new(verifier.clone()),
        Box::new(harness.principals.clone()),
    ));
    let refresher = TokenRefresher::new(agent, harness.token_dir.path().to_path_buf())
        .with_retry_policy(RetryPolicy {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
            ..Default::default()
        });

    let cancel = CancellationToken::new();
    refresher.fetch_and_write(cancel.clone()).await.unwrap();
    let first_token = std::fs::read(harness.token_file()).unwrap();

    // Wait for the refresh (0.7-0.9 of the short lifetime) plus the three
    // fast retries to play out.
    tokio::time::sleep(Duration::from_secs(3)).await;
    cancel.cancel();

    assert_eq!(verifier.verify_calls.load(Ordering::SeqCst), 5);
    let refreshed = std::fs::read(harness.token_file()).unwrap();
    assert_ne!(refreshed, first_token);
    assert_eq!(refreshed, verifier.last_token());
}

#[tokio::test]
async fn first_refresh_failure_aborts_the_run() {
    let harness = Harness::new();
    harness.permissive_labels();
    harness
        .verifier
        .state
        .lock()
        .unwrap()
        .steps
        .push_back(VerifyStep::TransportError);

    let runner = harness.runner(base_spec()).await.unwrap();
    let err = runner.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, LauncherError::Attestation(_)));
    assert_eq!(harness.runtime.lock().tasks_created, 0);
}
