use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::dlock::LockCoordinator;
use crate::errors::LockError;
use crate::replica::ReplicaStore;

pub const LOCK_PATH: &str = "/lock";
pub const UNLOCK_PATH: &str = "/unlock";
pub const REFRESH_PATH: &str = "/refresh";
pub const TTL_PATH: &str = "/ttl";
pub const HEALTH_CHECK_PATH: &str = "/health";

// TTL applied when the /lock query omits one.
const DEFAULT_LOCK_TTL: Duration = Duration::from_millis(10);
// TTL applied when the /refresh query omits one.
const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(10);

// Configure the coordinator HTTP surface.
pub fn configure<S: ReplicaStore + 'static>(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource(LOCK_PATH).route(web::post().to(lock::<S>)))
        .service(web::resource(UNLOCK_PATH).route(web::post().to(unlock::<S>)))
        .service(web::resource(REFRESH_PATH).route(web::post().to(refresh::<S>)))
        .service(web::resource(TTL_PATH).route(web::get().to(ttl::<S>)))
        .service(web::resource(HEALTH_CHECK_PATH).route(web::get().to(health)));
}

#[derive(Deserialize)]
pub struct LockParams {
    resource: Option<String>,
    ttl: Option<String>,
}

#[derive(Deserialize)]
pub struct TokenParams {
    resource: Option<String>,
    token: Option<String>,
}

#[derive(Deserialize)]
pub struct RefreshParams {
    resource: Option<String>,
    token: Option<String>,
    ttl: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct LockBody {
    code: u16,
    token: String,
    resource: String,
    ttl: String,
    acquired: bool,
}

#[derive(Serialize, Deserialize)]
struct UnlockBody {
    code: u16,
    token: String,
    resource: String,
}

#[derive(Serialize, Deserialize)]
struct RefreshBody {
    code: u16,
    token: String,
    resource: String,
    ttl: String,
    refreshed: bool,
}

#[derive(Serialize, Deserialize)]
struct TtlBody {
    code: u16,
    resource: String,
    token: String,
    ttl: String,
}

#[derive(Serialize, Deserialize)]
struct HealthBody {
    code: u16,
    status: String,
}

#[derive(Serialize, Deserialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

#[derive(Serialize, Deserialize)]
struct ConflictBody {
    code: u16,
    acquired: bool,
    message: String,
}

async fn lock<S: ReplicaStore + 'static>(
    coordinator: web::Data<LockCoordinator<S>>,
    params: web::Query<LockParams>,
) -> HttpResponse {
    let resource = match required(&params.resource, "resource") {
        Ok(resource) => resource,
        Err(response) => return response,
    };
    let ttl = match parse_ttl(params.ttl.as_deref(), DEFAULT_LOCK_TTL) {
        Ok(ttl) => ttl,
        Err(response) => return response,
    };

    match coordinator.acquire(resource, ttl).await {
        Ok(lock) => {
            debug!("granted '{}' for {}", lock.resource, format_ttl(lock.ttl));
            HttpResponse::Ok().json(LockBody {
                code: StatusCode::OK.as_u16(),
                token: lock.token,
                resource: lock.resource,
                ttl: format_ttl(lock.ttl),
                acquired: true,
            })
        }
        Err(err) => error_response(&err),
    }
}

async fn unlock<S: ReplicaStore + 'static>(
    coordinator: web::Data<LockCoordinator<S>>,
    params: web::Query<TokenParams>,
) -> HttpResponse {
    let (resource, token) = match required_pair(&params.resource, &params.token) {
        Ok(pair) => pair,
        Err(response) => return response,
    };

    match coordinator.release(resource, token).await {
        Ok(()) => HttpResponse::Ok().json(UnlockBody {
            code: StatusCode::OK.as_u16(),
            token: token.to_owned(),
            resource: resource.to_owned(),
        }),
        Err(err) => error_response(&err),
    }
}

async fn refresh<S: ReplicaStore + 'static>(
    coordinator: web::Data<LockCoordinator<S>>,
    params: web::Query<RefreshParams>,
) -> HttpResponse {
    let (resource, token) = match required_pair(&params.resource, &params.token) {
        Ok(pair) => pair,
        Err(response) => return response,
    };
    let ttl = match parse_ttl(params.ttl.as_deref(), DEFAULT_REFRESH_TTL) {
        Ok(ttl) => ttl,
        Err(response) => return response,
    };

    match coordinator.refresh(resource, token, ttl).await {
        Ok(()) => HttpResponse::Ok().json(RefreshBody {
            code: StatusCode::OK.as_u16(),
            token: token.to_owned(),
            resource: resource.to_owned(),
            ttl: format_ttl(ttl),
            refreshed: true,
        }),
        Err(err) => error_response(&err),
    }
}

async fn ttl<S: ReplicaStore + 'static>(
    coordinator: web::Data<LockCoordinator<S>>,
    params: web::Query<TokenParams>,
) -> HttpResponse {
    let (resource, token) = match required_pair(&params.resource, &params.token) {
        Ok(pair) => pair,
        Err(response) => return response,
    };

    match coordinator.remaining_ttl(resource, token).await {
        Ok(remaining) => HttpResponse::Ok().json(TtlBody {
            code: StatusCode::OK.as_u16(),
            resource: resource.to_owned(),
            token: token.to_owned(),
            ttl: format_ttl(remaining),
        }),
        Err(err) => error_response(&err),
    }
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(HealthBody {
        code: StatusCode::OK.as_u16(),
        status: "ok".to_owned(),
    })
}

fn required<'a>(param: &'a Option<String>, name: &str) -> Result<&'a str, HttpResponse> {
    match param.as_deref() {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(bad_request(format!("missing query parameter '{}'", name))),
    }
}

fn required_pair<'a>(
    resource: &'a Option<String>,
    token: &'a Option<String>,
) -> Result<(&'a str, &'a str), HttpResponse> {
    let resource = required(resource, "resource")?;
    let token = required(token, "token")?;
    Ok((resource, token))
}

fn parse_ttl(ttl: Option<&str>, default: Duration) -> Result<Duration, HttpResponse> {
    match ttl {
        None => Ok(default),
        Some(raw) => humantime::parse_duration(raw)
            .map_err(|_| bad_request(format!("invalid duration '{}'", raw))),
    }
}

fn format_ttl(ttl: Duration) -> String {
    humantime::format_duration(ttl).to_string()
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorBody {
        code: StatusCode::BAD_REQUEST.as_u16(),
        message,
    })
}

fn error_response(err: &LockError) -> HttpResponse {
    let status = err.status_code();
    match err {
        LockError::Conflict(message) => HttpResponse::build(status).json(ConflictBody {
            code: status.as_u16(),
            acquired: false,
            message: message.clone(),
        }),
        _ => HttpResponse::build(status).json(ErrorBody {
            code: status.as_u16(),
            message: err.to_string(),
        }),
    }
}
