use anyhow::Result;
use ceremony_coordinator::rest::{
    self, BearerIdentityAccessControl, SharedAccess, SharedBlob, SharedCoordinator,
    SharedLifecycle, SharedUploads, SharedVerifier,
};
use ceremony_coordinator::s3::S3Store;
use ceremony_coordinator::storage::InMemoryRepository;
use ceremony_coordinator::verification::{ContributionVerifier, SnarkjsCliVerifier};
use ceremony_coordinator::workers::{HttpWorkerClient, UnconfiguredWorker, VerificationWorker};
use ceremony_coordinator::{CeremonyLifecycle, Coordinator, Environment};
use std::sync::Arc;
use structopt::StructOpt;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "ceremony-coordinator",
    about = "Coordination server for zero-knowledge trusted-setup ceremonies"
)]
struct Opt {
    /// The snarkjs binary used for local contribution verification.
    #[structopt(long, default_value = "snarkjs")]
    snarkjs_binary: String,
}

#[rocket::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = Opt::from_args();
    let environment = Environment::from_env();

    let repository = Arc::new(InMemoryRepository::new());
    let blob: SharedBlob = Arc::new(S3Store::from_env().await);
    let worker: Arc<dyn VerificationWorker> = match &environment.worker_control_url {
        Some(url) => Arc::new(HttpWorkerClient::new(url.clone())),
        None => Arc::new(UnconfiguredWorker),
    };
    let local = Arc::new(SnarkjsCliVerifier {
        snarkjs_binary: opt.snarkjs_binary,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator: SharedCoordinator = Arc::new(Coordinator::new(
        repository.clone(),
        environment.clone(),
    ));
    let lifecycle: SharedLifecycle = Arc::new(CeremonyLifecycle::new(
        repository.clone(),
        blob.clone(),
        worker.clone(),
        environment.clone(),
    ));
    let verifier: SharedVerifier = Arc::new(
        ContributionVerifier::new(
            repository.clone(),
            blob.clone(),
            worker.clone(),
            local,
            coordinator.clone(),
            environment.clone(),
        )
        .with_cancellation(shutdown_rx.clone()),
    );
    let uploads: SharedUploads = Arc::new(ceremony_coordinator::UploadSessionManager::new(
        repository,
        blob.clone(),
        environment.clone(),
    ));
    let access: SharedAccess = Arc::new(BearerIdentityAccessControl);

    tokio::spawn(coordinator.clone().run(shutdown_rx.clone()));
    tokio::spawn(lifecycle.clone().run(shutdown_rx));

    let rocket = rocket::build()
        .mount("/", rest::routes())
        .manage(coordinator)
        .manage(lifecycle)
        .manage(verifier)
        .manage(uploads)
        .manage(blob)
        .manage(access)
        .manage(environment);

    let result = rocket.launch().await;

    // Background tickers finish their in-flight pass before exiting.
    let _ = shutdown_tx.send(true);
    info!("server shut down");
    result?;
    Ok(())
}
