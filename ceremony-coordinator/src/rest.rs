//! REST API endpoints exposed by the coordination server.
//!
//! Authentication itself is an external concern: the [`AccessControl`]
//! collaborator turns a bearer token into a user id and answers the
//! ceremony's provider-eligibility predicate. Every handler below works on
//! an already-authenticated `(userId, ceremonyId)` pair.

use crate::coordinator::CoordinatorError;
use crate::lifecycle::{NewCeremony, NewCircuit};
use crate::objects::{
    ArtifactSizes, Ceremony, CeremonyState, CeremonyType, ChunkTag, ContributionStep,
    TimeoutMechanism, VerificationMechanism,
};
use crate::s3::{self, BlobStore};
use crate::storage::{InMemoryRepository, Repository, StorageError};
use rocket::http::{ContentType, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::{Responder, Response};
use rocket::serde::json::Json;
use rocket::{get, post, FromForm, State};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

/// The repository backend the server runs on.
pub type Repo = InMemoryRepository;

pub type SharedCoordinator = Arc<crate::coordinator::Coordinator<Repo>>;
pub type SharedVerifier = Arc<crate::verification::ContributionVerifier<Repo>>;
pub type SharedLifecycle = Arc<crate::lifecycle::CeremonyLifecycle<Repo>>;
pub type SharedUploads = Arc<crate::upload::UploadSessionManager<Repo>>;
pub type SharedBlob = Arc<dyn BlobStore>;
pub type SharedAccess = Arc<dyn AccessControl>;

/// Server errors, including everything bubbling up from the coordinator
/// core.
#[derive(Error, Debug)]
pub enum ResponseError {
    #[error("Missing or malformed bearer token")]
    Unauthenticated,
    #[error("Participant is not eligible for this ceremony")]
    NotEligible,
    #[error("Coordinator failed: {0}")]
    Coordinator(#[from] CoordinatorError),
}

impl<'r> Responder<'r, 'static> for ResponseError {
    fn respond_to(self, _request: &'r Request<'_>) -> rocket::response::Result<'static> {
        let status = match &self {
            ResponseError::Unauthenticated => Status::Unauthorized,
            ResponseError::NotEligible => Status::Forbidden,
            ResponseError::Coordinator(error) => match error {
                CoordinatorError::Storage(StorageError::NotFound(_)) => Status::NotFound,
                CoordinatorError::Storage(StorageError::Conflict) => Status::Conflict,
                CoordinatorError::IllegalTransition(_) => Status::UnprocessableEntity,
                CoordinatorError::NotCoordinator => Status::Forbidden,
                CoordinatorError::Validation(_)
                | CoordinatorError::NotClosed
                | CoordinatorError::CeremonyNotOpen
                | CoordinatorError::MissingFinalContribution(_)
                | CoordinatorError::FinalContributionInvalid => Status::BadRequest,
                CoordinatorError::WrongObjectKey(_)
                | CoordinatorError::NoUploadSession
                | CoordinatorError::NoInProgressContribution(_)
                | CoordinatorError::NotCurrentContributor(_, _) => Status::BadRequest,
                CoordinatorError::WorkerUnavailable(_) => Status::ServiceUnavailable,
                _ => Status::InternalServerError,
            },
        };
        let body = format!("{}", self);
        Response::build()
            .status(status)
            .header(ContentType::Text)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

type Result<T> = std::result::Result<T, ResponseError>;

//
// -- AUTHENTICATION COLLABORATOR --
//

/// An authenticated caller, as established by the external identity
/// provider.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    /// Which provider vouched for this identity (`github`, `siwe`, ...).
    pub provider: String,
}

/// External authentication and reputation checks.
pub trait AccessControl: Send + Sync {
    /// Resolves a bearer token to an identity.
    fn authenticate(&self, bearer_token: &str) -> Option<Identity>;

    /// Whether the identity satisfies the ceremony's provider policy.
    fn is_eligible(&self, identity: &Identity, ceremony: &Ceremony) -> bool {
        ceremony.auth_providers.is_empty() || ceremony.auth_providers.contains(&identity.provider)
    }
}

/// Development access control: the bearer token is an already-verified
/// `userId:provider` assertion. Production deployments implement
/// [`AccessControl`] against their JWT verifier instead.
pub struct BearerIdentityAccessControl;

impl AccessControl for BearerIdentityAccessControl {
    fn authenticate(&self, bearer_token: &str) -> Option<Identity> {
        let (user_id, provider) = bearer_token.split_once(':')?;
        if user_id.is_empty() || provider.is_empty() {
            return None;
        }
        Some(Identity {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
        })
    }
}

/// Request guard extracting the authenticated caller from the
/// `Authorization: Bearer` header.
pub struct Authenticated(pub Identity);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Authenticated {
    type Error = ResponseError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let access = request
            .guard::<&State<SharedAccess>>()
            .await
            .succeeded()
            .expect("access control must be managed state");

        let token = request
            .headers()
            .get_one("Authorization")
            .and_then(|header| header.strip_prefix("Bearer "));
        match token.and_then(|token| access.authenticate(token)) {
            Some(identity) => Outcome::Success(Self(identity)),
            None => Outcome::Error((Status::Unauthorized, ResponseError::Unauthenticated)),
        }
    }
}

/// Loads the ceremony and enforces its provider-eligibility predicate.
fn eligible_ceremony(
    coordinator: &SharedCoordinator,
    access: &SharedAccess,
    identity: &Identity,
    ceremony_id: u64,
) -> Result<Ceremony> {
    let ceremony = coordinator
        .repository()
        .with_transaction(|tx| tx.ceremony(ceremony_id))
        .map_err(CoordinatorError::Storage)?;
    if !access.is_eligible(identity, &ceremony) {
        return Err(ResponseError::NotEligible);
    }
    Ok(ceremony)
}

//
// -- REQUEST / RESPONSE BODIES --
//

#[derive(FromForm)]
pub struct CeremonyQuery {
    #[field(name = "ceremonyId")]
    pub ceremony_id: u64,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CeremonyDto {
    pub prefix: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: CeremonyType,
    pub start_date: i64,
    pub end_date: i64,
    pub timeout_mechanism_type: TimeoutMechanism,
    pub penalty: i64,
    #[serde(default = "default_fixed_window")]
    pub fixed_timeout_window_secs: i64,
    #[serde(default)]
    pub auth_providers: BTreeSet<String>,
}

fn default_fixed_window() -> i64 {
    1_800
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitDto {
    pub name: String,
    #[serde(default)]
    pub prefix: Option<String>,
    pub verification_mechanism: VerificationMechanism,
    #[serde(default)]
    pub worker_handle: Option<String>,
    pub pot_filename: String,
    #[serde(default)]
    pub bootstrap_script_filename: Option<String>,
    #[serde(default)]
    pub artifact_sizes: ArtifactSizes,
    #[serde(default = "default_dynamic_threshold")]
    pub dynamic_threshold_pct: u64,
}

fn default_dynamic_threshold() -> u64 {
    100
}

#[derive(Deserialize, Serialize)]
pub struct CreateCircuitsRequest {
    pub circuits: Vec<CircuitDto>,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreContributionHashRequest {
    pub hash: String,
    pub computation_time: u64,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKeyRequest {
    pub object_key: String,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignPartsRequest {
    pub object_key: String,
    pub upload_id: String,
    pub number_of_parts: u32,
}

#[derive(Deserialize, Serialize)]
pub struct RecordChunkRequest {
    pub chunk: ChunkTag,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartRequest {
    pub object_key: String,
    pub upload_id: String,
    #[serde(default)]
    pub parts: Vec<ChunkTag>,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyContributionRequest {
    pub circuit_id: u64,
    pub contributor_identifier: String,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeCircuitRequest {
    pub circuit_id: u64,
    pub beacon: String,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanContributeResponse {
    pub can_contribute: bool,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResponse {
    pub contribution_step: Option<ContributionStep>,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadIdResponse {
    pub upload_id: String,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrlResponse {
    pub url: String,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyContributionResponse {
    pub valid: bool,
}

//
// -- REST API ENDPOINTS --
//

/// Create a ceremony in the `SCHEDULED` state. The caller becomes its
/// coordinator.
#[post("/ceremonies/create", format = "json", data = "<request>")]
pub async fn create_ceremony(
    lifecycle: &State<SharedLifecycle>,
    caller: Authenticated,
    request: Json<CeremonyDto>,
) -> Result<Json<u64>> {
    let request = request.into_inner();
    let id = lifecycle
        .create_ceremony(
            NewCeremony {
                prefix: request.prefix,
                title: request.title,
                description: request.description,
                kind: request.kind,
                start_date: request.start_date,
                end_date: request.end_date,
                timeout_mechanism_type: request.timeout_mechanism_type,
                penalty: request.penalty,
                fixed_timeout_window_secs: request.fixed_timeout_window_secs,
                auth_providers: request.auth_providers,
            },
            &caller.0.user_id,
        )
        .await?;
    Ok(Json(id))
}

/// Create the ceremony's circuits, provisioning remote verification
/// workers where needed.
#[post(
    "/ceremonies/create-circuits?<query..>",
    format = "json",
    data = "<request>"
)]
pub async fn create_circuits(
    lifecycle: &State<SharedLifecycle>,
    caller: Authenticated,
    query: CeremonyQuery,
    request: Json<CreateCircuitsRequest>,
) -> Result<Json<Vec<u64>>> {
    let circuits = request
        .into_inner()
        .circuits
        .into_iter()
        .map(|dto| {
            let prefix = dto
                .prefix
                .unwrap_or_else(|| dto.name.to_lowercase().replace(' ', "-"));
            NewCircuit {
                name: dto.name,
                prefix,
                verification_mechanism: dto.verification_mechanism,
                worker_handle: dto.worker_handle,
                pot_filename: dto.pot_filename,
                bootstrap_script_filename: dto.bootstrap_script_filename,
                artifact_sizes: dto.artifact_sizes,
                dynamic_threshold_pct: dto.dynamic_threshold_pct,
            }
        })
        .collect();
    let ids = lifecycle
        .create_circuits(query.ceremony_id, &caller.0.user_id, circuits)
        .await?;
    Ok(Json(ids))
}

/// List every ceremony.
#[get("/ceremonies")]
pub async fn list_ceremonies(coordinator: &State<SharedCoordinator>) -> Result<Json<Vec<Ceremony>>> {
    let ceremonies = coordinator
        .repository()
        .with_transaction(|tx| tx.ceremonies())
        .map_err(CoordinatorError::Storage)?;
    Ok(Json(ceremonies))
}

/// List the ceremonies currently accepting contributions.
#[get("/ceremonies/opened")]
pub async fn list_opened_ceremonies(
    coordinator: &State<SharedCoordinator>,
) -> Result<Json<Vec<Ceremony>>> {
    let ceremonies = coordinator
        .repository()
        .with_transaction(|tx| tx.ceremonies_by_state(CeremonyState::Opened))
        .map_err(CoordinatorError::Storage)?;
    Ok(Json(ceremonies))
}

/// Seal a closed ceremony once every circuit has its final contribution.
#[post("/ceremonies/finalize?<query..>")]
pub async fn finalize_ceremony(
    lifecycle: &State<SharedLifecycle>,
    caller: Authenticated,
    query: CeremonyQuery,
) -> Result<()> {
    lifecycle
        .finalize(query.ceremony_id, &caller.0.user_id)
        .await?;
    Ok(())
}

/// Admission / re-admission check for a participant.
#[get("/participants/check?<query..>")]
pub async fn check_participant(
    coordinator: &State<SharedCoordinator>,
    access: &State<SharedAccess>,
    caller: Authenticated,
    query: CeremonyQuery,
) -> Result<Json<CanContributeResponse>> {
    eligible_ceremony(coordinator, access, &caller.0, query.ceremony_id)?;
    let can_contribute = coordinator.check_participant(query.ceremony_id, &caller.0.user_id)?;
    Ok(Json(CanContributeResponse { can_contribute }))
}

/// Move to the next circuit in sequence.
#[get("/participants/progress-to-next-circuit?<query..>")]
pub async fn progress_to_next_circuit(
    coordinator: &State<SharedCoordinator>,
    access: &State<SharedAccess>,
    caller: Authenticated,
    query: CeremonyQuery,
) -> Result<()> {
    eligible_ceremony(coordinator, access, &caller.0, query.ceremony_id)?;
    coordinator.progress_to_next_circuit(query.ceremony_id, &caller.0.user_id)?;
    Ok(())
}

/// Advance within the current circuit's contribution steps.
#[get("/participants/progress-to-next-step?<query..>")]
pub async fn progress_to_next_step(
    coordinator: &State<SharedCoordinator>,
    access: &State<SharedAccess>,
    caller: Authenticated,
    query: CeremonyQuery,
) -> Result<Json<StepResponse>> {
    eligible_ceremony(coordinator, access, &caller.0, query.ceremony_id)?;
    let contribution_step =
        coordinator.progress_to_next_step(query.ceremony_id, &caller.0.user_id)?;
    Ok(Json(StepResponse { contribution_step }))
}

/// Return from an expired timeout.
#[get("/participants/resume-after-timeout?<query..>")]
pub async fn resume_after_timeout(
    coordinator: &State<SharedCoordinator>,
    access: &State<SharedAccess>,
    caller: Authenticated,
    query: CeremonyQuery,
) -> Result<()> {
    eligible_ceremony(coordinator, access, &caller.0, query.ceremony_id)?;
    coordinator.resume_after_timeout(query.ceremony_id, &caller.0.user_id)?;
    Ok(())
}

/// Store the in-progress contribution fragment posted after computing.
#[post(
    "/participants/store-contribution-hash?<query..>",
    format = "json",
    data = "<request>"
)]
pub async fn store_contribution_hash(
    coordinator: &State<SharedCoordinator>,
    access: &State<SharedAccess>,
    caller: Authenticated,
    query: CeremonyQuery,
    request: Json<StoreContributionHashRequest>,
) -> Result<()> {
    eligible_ceremony(coordinator, access, &caller.0, query.ceremony_id)?;
    let request = request.into_inner();
    coordinator.store_contribution_hash(
        query.ceremony_id,
        &caller.0.user_id,
        request.hash,
        request.computation_time,
    )?;
    Ok(())
}

/// Open a multipart upload for the caller's next zkey.
#[post("/storage/start-multipart?<query..>", format = "json", data = "<request>")]
pub async fn start_multipart(
    uploads: &State<SharedUploads>,
    coordinator: &State<SharedCoordinator>,
    access: &State<SharedAccess>,
    caller: Authenticated,
    query: CeremonyQuery,
    request: Json<ObjectKeyRequest>,
) -> Result<Json<UploadIdResponse>> {
    eligible_ceremony(coordinator, access, &caller.0, query.ceremony_id)?;
    let upload_id = uploads
        .open(query.ceremony_id, &caller.0.user_id, &request.object_key)
        .await?;
    Ok(Json(UploadIdResponse { upload_id }))
}

/// Presign PUT URLs for the open multipart upload.
#[post("/storage/presign-parts?<query..>", format = "json", data = "<request>")]
pub async fn presign_parts(
    uploads: &State<SharedUploads>,
    coordinator: &State<SharedCoordinator>,
    access: &State<SharedAccess>,
    caller: Authenticated,
    query: CeremonyQuery,
    request: Json<PresignPartsRequest>,
) -> Result<Json<Vec<String>>> {
    eligible_ceremony(coordinator, access, &caller.0, query.ceremony_id)?;
    let request = request.into_inner();
    let urls = uploads
        .presign_parts(
            query.ceremony_id,
            &caller.0.user_id,
            &request.object_key,
            &request.upload_id,
            request.number_of_parts,
        )
        .await?;
    Ok(Json(urls))
}

/// Record an uploaded chunk's ETag.
#[post("/storage/record-chunk?<query..>", format = "json", data = "<request>")]
pub async fn record_chunk(
    uploads: &State<SharedUploads>,
    coordinator: &State<SharedCoordinator>,
    access: &State<SharedAccess>,
    caller: Authenticated,
    query: CeremonyQuery,
    request: Json<RecordChunkRequest>,
) -> Result<()> {
    eligible_ceremony(coordinator, access, &caller.0, query.ceremony_id)?;
    uploads.record_chunk(query.ceremony_id, &caller.0.user_id, request.into_inner().chunk)?;
    Ok(())
}

/// Complete the multipart upload.
#[post(
    "/storage/complete-multipart?<query..>",
    format = "json",
    data = "<request>"
)]
pub async fn complete_multipart(
    uploads: &State<SharedUploads>,
    coordinator: &State<SharedCoordinator>,
    access: &State<SharedAccess>,
    caller: Authenticated,
    query: CeremonyQuery,
    request: Json<CompleteMultipartRequest>,
) -> Result<()> {
    eligible_ceremony(coordinator, access, &caller.0, query.ceremony_id)?;
    let request = request.into_inner();
    uploads
        .complete(
            query.ceremony_id,
            &caller.0.user_id,
            &request.object_key,
            &request.upload_id,
            request.parts,
        )
        .await?;
    Ok(())
}

/// Presign a GET URL for a ceremony artifact. Contribution-namespace keys
/// are served only to the owning circuit's current contributor.
#[post("/storage/presign-get?<query..>", format = "json", data = "<request>")]
pub async fn presign_get(
    coordinator: &State<SharedCoordinator>,
    blob: &State<SharedBlob>,
    access: &State<SharedAccess>,
    environment: &State<crate::environment::Environment>,
    caller: Authenticated,
    query: CeremonyQuery,
    request: Json<ObjectKeyRequest>,
) -> Result<Json<PresignedUrlResponse>> {
    let ceremony = eligible_ceremony(coordinator, access, &caller.0, query.ceremony_id)?;
    let object_key = request.into_inner().object_key;

    if s3::is_contribution_key(&object_key) {
        let circuits = coordinator
            .repository()
            .with_transaction(|tx| tx.circuits(query.ceremony_id))
            .map_err(CoordinatorError::Storage)?;
        let owns_key = circuits.iter().any(|circuit| {
            object_key.starts_with(&format!("circuits/{}/contributions/", circuit.prefix))
                && circuit.waiting_queue.current_contributor() == Some(caller.0.user_id.as_str())
        });
        let is_coordinator = ceremony.is_coordinator(&caller.0.user_id);
        if !owns_key && !is_coordinator {
            return Err(ResponseError::Coordinator(CoordinatorError::WrongObjectKey(
                object_key,
            )));
        }
    }

    let bucket = s3::bucket_name(&ceremony.prefix, &environment.bucket_postfix);
    let url = blob
        .presigned_get_url(&bucket, &object_key, environment.presigned_url_ttl)
        .await
        .map_err(CoordinatorError::Blob)?;
    Ok(Json(PresignedUrlResponse { url }))
}

/// Verify the contribution the caller claims to have just uploaded.
#[post(
    "/circuits/verify-contribution?<query..>",
    format = "json",
    data = "<request>"
)]
pub async fn verify_contribution(
    verifier: &State<SharedVerifier>,
    coordinator: &State<SharedCoordinator>,
    access: &State<SharedAccess>,
    caller: Authenticated,
    query: CeremonyQuery,
    request: Json<VerifyContributionRequest>,
) -> Result<Json<VerifyContributionResponse>> {
    eligible_ceremony(coordinator, access, &caller.0, query.ceremony_id)?;
    let request = request.into_inner();
    let valid = verifier
        .verify_contribution(
            query.ceremony_id,
            request.circuit_id,
            &caller.0.user_id,
            &request.contributor_identifier,
        )
        .await?;
    Ok(Json(VerifyContributionResponse { valid }))
}

/// Stamp the finalization beacon onto a circuit's final contribution.
#[post("/circuits/finalize?<query..>", format = "json", data = "<request>")]
pub async fn finalize_circuit(
    lifecycle: &State<SharedLifecycle>,
    caller: Authenticated,
    query: CeremonyQuery,
    request: Json<FinalizeCircuitRequest>,
) -> Result<()> {
    let request = request.into_inner();
    lifecycle.finalize_circuit(
        query.ceremony_id,
        request.circuit_id,
        &caller.0.user_id,
        request.beacon,
    )?;
    Ok(())
}

/// Liveness probe.
#[get("/healthcheck")]
pub async fn healthcheck() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Every route the server mounts.
pub fn routes() -> Vec<rocket::Route> {
    rocket::routes![
        create_ceremony,
        create_circuits,
        list_ceremonies,
        list_opened_ceremonies,
        finalize_ceremony,
        check_participant,
        progress_to_next_circuit,
        progress_to_next_step,
        resume_after_timeout,
        store_contribution_hash,
        start_multipart,
        presign_parts,
        record_chunk,
        complete_multipart,
        presign_get,
        verify_contribution,
        finalize_circuit,
        healthcheck,
    ]
}
