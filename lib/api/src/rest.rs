use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer, Result as ActixResult};
use personlink_core::{Contact, Error, Person};
use personlink_engine::{ActivityId, LinkerContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelinkChangesRequest {
    activity_id: Option<ActivityId>,
    rev_changed_start: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManualLinkRequest {
    #[serde(default)]
    person_to_link_to: String,
    #[serde(default)]
    person_to_link: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManualUnlinkRequest {
    #[serde(default)]
    person_to_remove_link_from: String,
    #[serde(default)]
    contact_to_remove_from_person: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct YieldRequest {
    job_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct YieldResponse {
    job_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteOrphanedPersonRequest {
    #[serde(default)]
    person_id: String,
}

#[derive(Deserialize)]
struct SavePersonRequest {
    #[serde(default)]
    person: Person,
    #[serde(default)]
    contacts: Vec<Contact>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PerformedManualLinkRequest {
    group_a: Vec<String>,
    group_b: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PerformedUnlinkRequest {
    person_id: String,
    contact_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    running: bool,
    current_job: Option<String>,
    watch_activity: Option<ActivityId>,
}

pub struct RestApi;

impl RestApi {
    pub async fn start(context: Arc<LinkerContext>, port: u16) -> std::io::Result<()> {
        HttpServer::new(move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600);

            App::new()
                .wrap(cors)
                .app_data(web::Data::new(context.clone()))
                .configure(Self::configure)
        })
        .bind(("0.0.0.0", port))?
        .run()
        .await
    }

    /// Register every linker route. Expects `web::Data<Arc<LinkerContext>>` in app data.
    pub fn configure(cfg: &mut web::ServiceConfig) {
        cfg.route("/status", web::get().to(status))
            .route("/forceAutolink", web::post().to(force_autolink))
            .route(
                "/dbUpdatedRelinkChanges",
                web::post().to(db_updated_relink_changes),
            )
            .route("/setupWatch", web::post().to(setup_watch))
            .route("/yield", web::post().to(yield_autolink))
            .route("/manualLink", web::post().to(manual_link))
            .route("/manualUnlink", web::post().to(manual_unlink))
            .route("/deleteOrphanedPerson", web::post().to(delete_orphaned_person))
            .route(
                "/saveNewPersonAndContacts",
                web::post().to(save_new_person_and_contacts),
            )
            .route("/manualLinks/{contact_id}", web::get().to(manual_links))
            .route("/unlinkLinks/{contact_id}", web::get().to(unlink_links))
            .route("/performedManualLink", web::post().to(performed_manual_link))
            .route("/performedUnlink", web::post().to(performed_unlink))
            .route("/resetCLB", web::post().to(reset_ledger))
            .route("/dump", web::get().to(dump_ledger));
    }
}

fn error_response(e: &Error) -> HttpResponse {
    let body = serde_json::json!({ "error": e.to_string() });
    match e {
        Error::AutolinkRunning => HttpResponse::Conflict().json(body),
        Error::PersonNotFound(_) | Error::ContactNotFound(_) | Error::DocumentNotFound(_) => {
            HttpResponse::NotFound().json(body)
        }
        Error::MissingLinkHash(_) => HttpResponse::UnprocessableEntity().json(body),
        e if e.is_client_error() => HttpResponse::BadRequest().json(body),
        e => {
            error!("Request failed: {}", e);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

fn respond<T: Serialize>(result: personlink_core::Result<T>) -> ActixResult<HttpResponse> {
    match result {
        Ok(value) => Ok(HttpResponse::Ok().json(serde_json::json!({ "result": value }))),
        Err(e) => {
            warn!("{}", e);
            Ok(error_response(&e))
        }
    }
}

async fn status(context: web::Data<Arc<LinkerContext>>) -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(StatusResponse {
        running: context.is_running(),
        current_job: context.current_job(),
        watch_activity: context.watch_activity(),
    }))
}

async fn force_autolink(context: web::Data<Arc<LinkerContext>>) -> ActixResult<HttpResponse> {
    respond(context.force_autolink().await)
}

async fn db_updated_relink_changes(
    context: web::Data<Arc<LinkerContext>>,
    req: web::Json<RelinkChangesRequest>,
) -> ActixResult<HttpResponse> {
    respond(
        context
            .db_updated_relink_changes(req.activity_id, req.rev_changed_start)
            .await,
    )
}

async fn setup_watch(context: web::Data<Arc<LinkerContext>>) -> ActixResult<HttpResponse> {
    respond(context.setup_watch().await)
}

async fn yield_autolink(
    context: web::Data<Arc<LinkerContext>>,
    req: Option<web::Json<YieldRequest>>,
) -> ActixResult<HttpResponse> {
    let req = req.map(web::Json::into_inner).unwrap_or_default();
    respond(
        context
            .yield_autolink(req.job_id.as_deref())
            .map(|job_id| YieldResponse { job_id }),
    )
}

async fn manual_link(
    context: web::Data<Arc<LinkerContext>>,
    req: web::Json<ManualLinkRequest>,
) -> ActixResult<HttpResponse> {
    respond(
        context
            .manually_link(&req.person_to_link_to, &req.person_to_link)
            .await,
    )
}

async fn manual_unlink(
    context: web::Data<Arc<LinkerContext>>,
    req: web::Json<ManualUnlinkRequest>,
) -> ActixResult<HttpResponse> {
    respond(
        context
            .manually_unlink(
                &req.person_to_remove_link_from,
                &req.contact_to_remove_from_person,
            )
            .await,
    )
}

async fn delete_orphaned_person(
    context: web::Data<Arc<LinkerContext>>,
    req: web::Json<DeleteOrphanedPersonRequest>,
) -> ActixResult<HttpResponse> {
    respond(context.delete_orphaned_person(&req.person_id).await)
}

async fn save_new_person_and_contacts(
    context: web::Data<Arc<LinkerContext>>,
    req: web::Json<SavePersonRequest>,
) -> ActixResult<HttpResponse> {
    let SavePersonRequest { person, contacts } = req.into_inner();
    respond(context.save_new_person_and_contacts(person, contacts).await)
}

async fn manual_links(
    context: web::Data<Arc<LinkerContext>>,
    path: web::Path<String>,
) -> ActixResult<HttpResponse> {
    respond(context.manual_links(&path.into_inner()).await)
}

async fn unlink_links(
    context: web::Data<Arc<LinkerContext>>,
    path: web::Path<String>,
) -> ActixResult<HttpResponse> {
    respond(context.unlink_links(&path.into_inner()).await)
}

async fn performed_manual_link(
    context: web::Data<Arc<LinkerContext>>,
    req: web::Json<PerformedManualLinkRequest>,
) -> ActixResult<HttpResponse> {
    respond(
        context
            .performed_manual_link(&req.group_a, &req.group_b)
            .await,
    )
}

async fn performed_unlink(
    context: web::Data<Arc<LinkerContext>>,
    req: web::Json<PerformedUnlinkRequest>,
) -> ActixResult<HttpResponse> {
    respond(context.performed_unlink(&req.person_id, &req.contact_id).await)
}

async fn reset_ledger(context: web::Data<Arc<LinkerContext>>) -> ActixResult<HttpResponse> {
    respond(context.reset_ledger().await)
}

async fn dump_ledger(context: web::Data<Arc<LinkerContext>>) -> ActixResult<HttpResponse> {
    respond(context.dump_ledger().await)
}
