use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use warp::http::{StatusCode, Uri};
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::calculator;
use crate::parser::{self, FORM_ERROR};
use crate::render;
use crate::service::{RecordService, ServiceError};

// Form and JSON bodies are two short integers; anything bigger is abuse.
const MAX_BODY_BYTES: u64 = 4 * 1024;

/// Raw submission, as typed by the user. Missing fields arrive empty and
/// fail validation like any other bad input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitForm {
    #[serde(default)]
    pub weight: String,
    #[serde(default)]
    pub height: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordView {
    pub id: u64,
    pub value: f64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiError {
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Serve `/static/style.css`.
    pub with_static: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self { with_static: true }
    }
}

pub struct BmiServer {
    service: RecordService,
    options: ServerOptions,
}

impl BmiServer {
    pub fn new(service: RecordService, options: ServerOptions) -> Self {
        Self { service, options }
    }

    /// Serves until `shutdown` resolves.
    pub async fn run<F>(&self, addr: SocketAddr, shutdown: F) -> Result<(), warp::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let routes = routes(self.service.clone(), self.options.clone());
        let (bound, server) = warp::serve(routes).try_bind_with_graceful_shutdown(addr, shutdown)?;
        info!(%bound, "BMI server listening");
        server.await;
        Ok(())
    }
}

/// The full route table. Built once; every handler gets its own clone of
/// the service.
///
/// Paths are matched before methods so an unknown path is a 404 rather than
/// a 405 borrowed from a sibling route.
pub fn routes(
    service: RecordService,
    options: ServerOptions,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    // 1. GET /
    let index = warp::path::end()
        .and(warp::get())
        .map(|| html(StatusCode::OK, render::form(None)));

    // 2. POST /
    let submit = warp::path::end()
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::form::<SubmitForm>())
        .and(with_service(service.clone()))
        .and_then(submit_form);

    // 3. GET /show/<id>
    let show = warp::path!("show" / String)
        .and(warp::get())
        .and(warp::header::optional::<String>("host"))
        .and(with_service(service.clone()))
        .and_then(show_record);

    // --- JSON API ---

    // 4. POST /api/records
    let api_create = warp::path!("api" / "records")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json::<SubmitForm>())
        .and(with_service(service.clone()))
        .and_then(api_create_record);

    // 5. GET /api/records/<id>
    let api_get = warp::path!("api" / "records" / String)
        .and(warp::get())
        .and(with_service(service))
        .and_then(api_get_record);

    // 6. GET /static/style.css
    let assets = warp::path!("static" / "style.css")
        .and(warp::get())
        .and(enabled(options.with_static))
        .map(|| {
            warp::reply::with_header(render::STYLESHEET, "content-type", "text/css; charset=utf-8")
                .into_response()
        });

    index
        .or(submit)
        .unify()
        .or(show)
        .unify()
        .or(api_create)
        .unify()
        .or(api_get)
        .unify()
        .or(assets)
        .unify()
        .recover(handle_rejection)
        .with(warp::trace::request())
}

fn with_service(service: RecordService) -> impl Filter<Extract = (RecordService,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

/// Passes when `on` is set, otherwise rejects as if the route did not exist.
fn enabled(on: bool) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::any()
        .and_then(move || async move {
            if on {
                Ok(())
            } else {
                Err(warp::reject::not_found())
            }
        })
        .untuple_one()
}

// --- HTML HANDLERS ---

async fn submit_form(form: SubmitForm, service: RecordService) -> Result<Response, Rejection> {
    let pair = match parser::parse_input_pair(&form.weight, &form.height) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, "form rejected");
            return Ok(html(StatusCode::OK, render::form(Some(FORM_ERROR))));
        }
    };

    match run_blocking(service, move |s| s.get_or_create(pair)).await {
        Ok(id) => match format!("/show/{}", id).parse::<Uri>() {
            Ok(location) => Ok(warp::redirect::see_other(location).into_response()),
            Err(e) => {
                error!(id, error = %e, "could not build redirect");
                Ok(fault_page(StatusCode::INTERNAL_SERVER_ERROR))
            }
        },
        Err(e) => Ok(service_fault(&e)),
    }
}

async fn show_record(raw_id: String, host: Option<String>, service: RecordService) -> Result<Response, Rejection> {
    let Some(id) = parser::parse_record_id(&raw_id) else {
        return Err(warp::reject::not_found());
    };

    match run_blocking(service, move |s| s.lookup(id)).await {
        Ok(record) => Ok(html(StatusCode::OK, render::details(&record, host.as_deref()))),
        Err(ServiceError::NotFound(_)) => Err(warp::reject::not_found()),
        Err(e) => Ok(service_fault(&e)),
    }
}

// --- JSON HANDLERS ---

async fn api_create_record(form: SubmitForm, service: RecordService) -> Result<Response, Rejection> {
    let pair = match parser::parse_input_pair(&form.weight, &form.height) {
        Ok(pair) => pair,
        Err(e) => return Ok(json_error(StatusCode::BAD_REQUEST, e.to_string())),
    };

    match run_blocking(service, move |s| s.get_or_create(pair)).await {
        Ok(id) => {
            // Equal to the stored value by construction; the record itself
            // may still be in flight if another request created it.
            let view = RecordView {
                id,
                value: calculator::compute(pair),
                url: format!("/show/{}", id),
            };
            Ok(warp::reply::with_status(warp::reply::json(&view), StatusCode::CREATED).into_response())
        }
        Err(e) => {
            log_fault(&e);
            Ok(json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()))
        }
    }
}

async fn api_get_record(raw_id: String, service: RecordService) -> Result<Response, Rejection> {
    let Some(id) = parser::parse_record_id(&raw_id) else {
        return Ok(json_error(StatusCode::NOT_FOUND, "not found".to_string()));
    };

    match run_blocking(service, move |s| s.lookup(id)).await {
        Ok(record) => Ok(warp::reply::json(&RecordView {
            id: record.id,
            value: record.value,
            url: format!("/show/{}", record.id),
        })
        .into_response()),
        Err(ServiceError::NotFound(_)) => Ok(json_error(StatusCode::NOT_FOUND, "not found".to_string())),
        Err(e) => {
            log_fault(&e);
            Ok(json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()))
        }
    }
}

// --- HELPERS ---

/// Store calls block; keep them off the async workers.
async fn run_blocking<T, F>(service: RecordService, op: F) -> Result<T, ServiceError>
where
    F: FnOnce(&RecordService) -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&service))
        .await
        .map_err(|e| ServiceError::Aborted(e.to_string()))?
}

fn html(status: StatusCode, body: String) -> Response {
    warp::reply::with_status(warp::reply::html(body), status).into_response()
}

fn json_error(status: StatusCode, error: String) -> Response {
    warp::reply::with_status(warp::reply::json(&ApiError { error }), status).into_response()
}

fn log_fault(err: &ServiceError) {
    if err.is_invariant_violation() {
        error!(error = %err, "invariant violation");
    } else {
        error!(error = %err, "request failed");
    }
}

fn service_fault(err: &ServiceError) -> Response {
    log_fault(err);
    fault_page(StatusCode::INTERNAL_SERVER_ERROR)
}

fn fault_page(status: StatusCode) -> Response {
    let reason = status.canonical_reason().unwrap_or("Error");
    html(status, render::fault(status.as_u16(), reason))
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    if err.is_not_found() {
        return Ok(html(StatusCode::NOT_FOUND, render::not_found()));
    }

    // Body rejections first: a request that reached a body filter matched
    // that route's method, whatever its siblings said.
    let status = if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        StatusCode::PAYLOAD_TOO_LARGE
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        StatusCode::LENGTH_REQUIRED
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        StatusCode::UNSUPPORTED_MEDIA_TYPE
    } else if err.find::<warp::body::BodyDeserializeError>().is_some() {
        StatusCode::BAD_REQUEST
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        StatusCode::METHOD_NOT_ALLOWED
    } else {
        error!(rejection = ?err, "unhandled rejection");
        StatusCode::INTERNAL_SERVER_ERROR
    };

    Ok(fault_page(status))
}
