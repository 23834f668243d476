#[macro_use] extern crate rocket;
extern crate diesel;
use std::net::IpAddr;
use std::sync::Arc;
use rocket::{Build, Orbit, Rocket};
use rocket::fairing::{self, AdHoc};
use rocket::form::Form;
use rocket::http::{Header, Status};
use rocket::serde::json::Json;
use rocket::tokio::sync::Mutex;
use rocket::State;
use rocket_db_pools::{Database, deadpool_redis};
use rocket_db_pools::diesel::MysqlPool;
use rocket_dyn_templates::{Template, context};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

pub mod admin;
pub mod config;
pub mod error;
pub mod models;
pub mod notify;
pub mod realtime;
pub mod reminders;
pub mod schema;
pub mod store;
pub mod submission;
pub mod task;
pub mod throttle;
pub mod validation;

#[cfg(test)]
mod testing;

use admin::{Dashboard, CSV_FILENAME};
use config::AppConfig;
use models::RsvpForm;
use notify::Notifier;
use reminders::{RedisReminderQueue, ReminderPolicy, ReminderQueue};
use store::{MysqlStore, SubmissionStore};
use submission::{Notice, NoticeLevel, SubmissionFlow, SubmissionOutcome};
use task::TaskHandle;
use throttle::{client_key, Throttle};
use validation::{Field, FieldErrors};

#[derive(Database)]
#[database("rsvp")]
struct Db(MysqlPool);

#[derive(Database)]
#[database("redis")]
struct Redis(deadpool_redis::Pool);

/// Services built once at ignition and shared by every request.
struct Services {
    flow: SubmissionFlow,
    store: Arc<dyn SubmissionStore>,
    notifier: Arc<Notifier>,
    throttle: Throttle,
    event_name: String,
}

/// Long-lived tasks started at liftoff and torn down at shutdown.
struct Background {
    config: AppConfig,
    redis_url: Option<String>,
    reminders: Arc<dyn ReminderQueue>,
    tasks: Mutex<Vec<TaskHandle>>,
}

#[derive(FromForm)]
struct BulkNotice {
    subject: String,
    message: String,
}

#[derive(Deserialize)]
struct FieldCheck {
    field: String,
    value: String,
}

#[derive(Serialize)]
struct FieldVerdict {
    field: Field,
    error: Option<String>,
}

#[derive(Responder)]
#[response(content_type = "text/csv")]
struct CsvDownload(Vec<u8>, Header<'static>);

fn form_page(
    services: &Services,
    form: &RsvpForm,
    notice: Option<Notice>,
    errors: Option<&FieldErrors>,
) -> Template {
    Template::render("index", context! {
        event_name: &services.event_name,
        form: form,
        notice: notice,
        errors: errors.cloned().unwrap_or_default(),
    })
}

fn slowdown() -> Template {
    Template::render("slowdown", context! {})
}

fn admin_page(services: &Services, dashboard: &Dashboard, notice: Option<Notice>) -> Template {
    Template::render("admin", context! {
        event_name: &services.event_name,
        submissions: &dashboard.submissions,
        load_error: &dashboard.load_error,
        stats: dashboard.stats(),
        recipients: dashboard.submissions.len(),
        email_configured: services.notifier.is_configured(),
        notice: notice,
    })
}

#[get("/rsvp")]
async fn index(services: &State<Services>, client_ip: Option<IpAddr>) -> Template {
    let client = client_key(client_ip);
    if services.throttle.is_blocked(&client).await {
        return slowdown();
    }
    form_page(services, &RsvpForm::default(), None, None)
}

#[post("/rsvp", data = "<rsvp>")]
async fn rsvp_submit(rsvp: Form<RsvpForm>, services: &State<Services>, client_ip: Option<IpAddr>) -> Template {
    let client = client_key(client_ip);
    if services.throttle.is_blocked(&client).await {
        return slowdown();
    }
    services.throttle.record(&client).await;

    let outcome = services.flow.submit(&rsvp).await;
    let notice = outcome.notice();

    if let SubmissionOutcome::Accepted { submission, .. } = &outcome {
        info!("RSVP {} accepted", submission.id);
    }
    if outcome.clears_form() {
        return form_page(services, &RsvpForm::default(), Some(notice), None);
    }
    form_page(services, &rsvp, Some(notice), outcome.field_errors())
}

#[post("/rsvp/validate", format = "json", data = "<check>")]
fn validate_field(check: Json<FieldCheck>) -> Result<Json<FieldVerdict>, Status> {
    let field = Field::from_name(&check.field).ok_or(Status::UnprocessableEntity)?;
    Ok(Json(FieldVerdict {
        field,
        error: validation::validate_field(field, &check.value),
    }))
}

#[get("/rsvp/admin")]
async fn admin_dashboard(services: &State<Services>) -> Template {
    let dashboard = Dashboard::load(services.store.as_ref()).await;
    admin_page(services, &dashboard, None)
}

#[post("/rsvp/admin/notify", data = "<notice>")]
async fn admin_notify(notice: Form<BulkNotice>, services: &State<Services>) -> Template {
    let dashboard = Dashboard::load(services.store.as_ref()).await;

    let result = if dashboard.load_error.is_some() {
        Notice {
            level: NoticeLevel::Error,
            text: "Could not load recipients, nothing was sent.".to_string(),
        }
    } else {
        dashboard
            .send_bulk(&services.notifier, services.store.as_ref(), &notice.subject, &notice.message)
            .await
    };

    admin_page(services, &dashboard, Some(result))
}

#[get("/rsvp/admin/export.csv")]
async fn admin_export(services: &State<Services>) -> Result<CsvDownload, Status> {
    let dashboard = Dashboard::load(services.store.as_ref()).await;
    if dashboard.load_error.is_some() {
        return Err(Status::ServiceUnavailable);
    }

    let bytes = dashboard.export_csv().map_err(|e| {
        error!("CSV export failed: {e}");
        Status::InternalServerError
    })?;

    let disposition = Header::new(
        "Content-Disposition",
        format!("attachment; filename=\"{CSV_FILENAME}\""),
    );
    Ok(CsvDownload(bytes, disposition))
}

async fn build_services(rocket: Rocket<Build>) -> fairing::Result {
    let config: AppConfig = match rocket.figment().extract() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid application config: {e}");
            return Err(rocket);
        }
    };

    let pools = match (Db::fetch(&rocket), Redis::fetch(&rocket)) {
        (Some(db), Some(redis)) => Some((db.0.clone(), redis.0.clone())),
        _ => None,
    };
    let Some((db, redis)) = pools else {
        error!("Database pools are not initialized");
        return Err(rocket);
    };
    let redis_url = rocket
        .figment()
        .extract_inner::<String>("databases.redis.url")
        .ok();

    let limit = config.call_timeout();
    let store: Arc<dyn SubmissionStore> = Arc::new(MysqlStore::new(db, Some(redis.clone()), limit));
    let notifier = Arc::new(Notifier::from_config(&config));
    let reminders: Arc<dyn ReminderQueue> = Arc::new(RedisReminderQueue::new(redis.clone(), limit));

    let policy = ReminderPolicy {
        event_at: config.event_at,
        lead: config.reminder_lead(),
    };
    if policy.event_at.is_none() {
        warn!("event_at not set, reminders will not be scheduled");
    }

    let services = Services {
        flow: SubmissionFlow::new(store.clone(), notifier.clone(), Some(reminders.clone()), policy),
        store,
        notifier,
        throttle: Throttle::new(redis, config.throttle_limit, limit),
        event_name: config.event_name.clone(),
    };

    let background = Background {
        config,
        redis_url,
        reminders,
        tasks: Mutex::new(Vec::new()),
    };

    Ok(rocket.manage(services).manage(background))
}

async fn start_background(rocket: &Rocket<Orbit>) {
    let (Some(services), Some(background)) = (rocket.state::<Services>(), rocket.state::<Background>()) else {
        return;
    };
    let mut tasks = background.tasks.lock().await;

    tasks.push(reminders::spawn_dispatcher(
        background.reminders.clone(),
        services.notifier.clone(),
        services.store.clone(),
        background.config.reminder_poll(),
    ));

    if !background.config.realtime_alerts {
        return;
    }
    let Some(url) = background.redis_url.as_deref() else {
        warn!("realtime_alerts enabled but databases.redis.url is missing");
        return;
    };
    match realtime::redis_insert_feed(url, background.config.call_timeout()).await {
        Ok(feed) => tasks.push(realtime::watch(feed, services.notifier.clone())),
        Err(e) => error!("Realtime alerts disabled: {e}"),
    }
}

async fn stop_background(rocket: &Rocket<Orbit>) {
    let Some(background) = rocket.state::<Background>() else {
        return;
    };
    let tasks: Vec<TaskHandle> = background.tasks.lock().await.drain(..).collect();
    for task in tasks {
        info!("Tearing down {}", task.name());
        task.teardown().await;
    }
}

/// Routes and templates. Expects a managed [`Services`].
fn app(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket
        .mount("/", routes![index, rsvp_submit, validate_field,
                            admin_dashboard, admin_notify, admin_export])
        .attach(Template::fairing())
}

#[launch]
fn rocket() -> _ {
    let _ = fmt().with_env_filter(EnvFilter::from_default_env()).try_init();

    app(rocket::build())
        .attach(Db::init())
        .attach(Redis::init())
        .attach(AdHoc::try_on_ignite("Services", build_services))
        .attach(AdHoc::on_liftoff("Background tasks", |rocket| Box::pin(start_background(rocket))))
        .attach(AdHoc::on_shutdown("Background teardown", |rocket| Box::pin(stop_background(rocket))))
}
