use crate::config::ValidationError;
use crate::dispatch::DispatchError;
use crate::registry::RegistryError;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Response, StatusCode};
use http_body_util::combinators::BoxBody;
use serde_json::{Value, json};
use shared::http::full_body;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum DispatcherError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
    #[error("service alias error: {0}")]
    Services(#[from] resolver::config::ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no {0} dispatcher was configured")]
    MissingDispatcher(&'static str),
}

pub type ResponseBody = BoxBody<Bytes, DispatcherError>;

/// The JSON error document returned to the browser.
pub fn error_json(action: &str, error_code: &str, detail: &str) -> Value {
    json!({
        "status": "failure",
        "action": action,
        "error_code": error_code,
        "detail": detail,
    })
}

pub fn json_response(status: StatusCode, body: &Value) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn error_response(
    status: StatusCode,
    action: &str,
    error_code: &str,
    detail: &str,
) -> Response<ResponseBody> {
    json_response(status, &error_json(action, error_code, detail))
}

pub fn dispatch_error_response(action: &str, err: &DispatchError) -> Response<ResponseBody> {
    let mut body = error_json(action, err.error_code(), &err.detail());
    if let (Some(service_name), Some(object)) = (err.service_name(), body.as_object_mut()) {
        object.insert("service_name".into(), service_name.into());
    }
    json_response(err.status_code(), &body)
}
