use crate::config::{Config, DispatcherKind, PROPERTIES_PATH, SessionConfig};
use crate::dispatch::{DispatchResponse, Dispatcher};
use crate::errors::{
    DispatcherError, ResponseBody, dispatch_error_response, error_response, json_response,
};
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::proxy::ServiceProxy;
use crate::registry::Dispatchers;
use crate::session::{RequestContext, Session, SessionStore};
use crate::session_init::SessionEndpoints;
use crate::upload::{UploadAction, parse_form};
use crate::wrapper::ServiceCallWrapper;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::service::Service;
use serde_json::{Map, Value};
use shared::http::{full_body, make_error_response};
use shared::{gauge, histogram};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

const SERVICE_CALL_ACTION: &str = "SERVICE_CALL";
const UPLOAD_ACTION: &str = "FILE_UPLOAD";

struct Proxy {
    path_prefix: String,
    proxy: ServiceProxy,
}

struct Routes {
    sessions: Arc<SessionStore>,
    session_config: SessionConfig,
    session_endpoints: SessionEndpoints,
    mounts: HashMap<String, Arc<Dispatcher>>,
    proxy: Option<Proxy>,
    uploads: HashMap<String, UploadAction>,
    client_properties: BTreeMap<String, String>,
    development_identity: Option<Session>,
}

/// The browser-facing service: session endpoints, JSON dispatch mounts, the
/// named-service proxy and the upload forms.
#[derive(Clone)]
pub struct WorkbenchService {
    routes: Arc<Routes>,
}

fn dispatcher_for(
    dispatchers: &Dispatchers,
    kind: DispatcherKind,
) -> Result<Arc<Dispatcher>, DispatcherError> {
    dispatchers
        .get(kind)
        .ok_or(DispatcherError::MissingDispatcher(kind.as_str()))
}

impl WorkbenchService {
    pub fn new(
        config: &Config,
        dispatchers: &Dispatchers,
        sessions: Arc<SessionStore>,
    ) -> Result<Self, DispatcherError> {
        let mut mounts = HashMap::new();
        for mount in &config.mounts {
            mounts.insert(mount.path.clone(), dispatcher_for(dispatchers, mount.kind)?);
        }

        let proxy = match &config.proxy {
            Some(proxy) => Some(Proxy {
                path_prefix: proxy.path_prefix.trim_end_matches('/').to_string(),
                proxy: ServiceProxy::new(dispatcher_for(dispatchers, proxy.kind)?),
            }),
            None => None,
        };

        let mut uploads = HashMap::new();
        if let Some(upload) = &config.upload {
            let dispatcher = dispatcher_for(dispatchers, DispatcherKind::DataApi)?;
            let action = || {
                UploadAction::new(
                    dispatcher.clone(),
                    upload.home_dir_service.clone(),
                    upload.file_upload_service.clone(),
                )
            };
            uploads.insert(upload.path.clone(), action());
            if let Some(path) = &upload.make_public_path {
                uploads.insert(path.clone(), action().with_success_marker());
            }
        }

        let development_identity = match &config.security.development_identity {
            Some(identity) if !config.security.enabled => {
                tracing::warn!(
                    principal = %identity.principal,
                    "security is disabled; anonymous requests use the development identity"
                );
                Some(Session::from(identity))
            }
            _ => None,
        };

        Ok(WorkbenchService {
            routes: Arc::new(Routes {
                session_endpoints: SessionEndpoints::new(sessions.clone(), config.sessions.clone()),
                sessions,
                session_config: config.sessions.clone(),
                mounts,
                proxy,
                uploads,
                client_properties: config.client_properties.clone(),
                development_identity,
            }),
        })
    }

    pub async fn handle<B>(&self, request: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Display,
    {
        gauge!(REQUESTS_INFLIGHT).increment(1.0);
        let start = Instant::now();

        let (route, response) = self.routes.route(request).await;

        histogram!(
            REQUEST_DURATION,
            "route" => route,
            "status" => response.status().as_u16().to_string()
        )
        .record(start.elapsed().as_secs_f64());
        gauge!(REQUESTS_INFLIGHT).decrement(1.0);
        response
    }
}

impl Service<Request<Incoming>> for WorkbenchService {
    type Response = Response<ResponseBody>;
    type Error = DispatcherError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}

impl Routes {
    async fn route<B>(&self, request: Request<B>) -> (&'static str, Response<ResponseBody>)
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Display,
    {
        let mut ctx = RequestContext::from_request(&request, &self.sessions);
        if ctx.session.is_none()
            && let Some(identity) = &self.development_identity
        {
            ctx = ctx.with_session(identity.clone());
        }

        let (parts, body) = request.into_parts();
        let path = parts.uri.path().to_string();

        if path == self.session_config.init_path {
            if parts.method != Method::GET {
                return ("session_init", method_not_allowed());
            }
            return ("session_init", self.session_endpoints.init(&parts.headers));
        }
        if path == self.session_config.logout_path {
            return ("logout", self.session_endpoints.logout(&parts.headers));
        }
        if path == PROPERTIES_PATH {
            if parts.method != Method::GET {
                return ("properties", method_not_allowed());
            }
            return ("properties", self.properties());
        }

        if let Some(upload) = self.uploads.get(&path) {
            if parts.method != Method::POST {
                return ("upload", method_not_allowed());
            }
            return ("upload", self.upload(&ctx, upload, body).await);
        }

        if let Some(proxy) = &self.proxy
            && let Some(service_path) = path.strip_prefix(&proxy.path_prefix)
            && (service_path.is_empty() || service_path.starts_with('/'))
        {
            let body = match collect(body).await {
                Ok(body) => body,
                Err(response) => return ("proxy", response),
            };
            let response = proxy.proxy.forward(&ctx, service_path, &parts, body).await;
            return ("proxy", response);
        }

        if let Some(dispatcher) = self.mounts.get(&path) {
            if parts.method != Method::POST {
                return ("dispatch", method_not_allowed());
            }
            return ("dispatch", dispatch(&ctx, dispatcher, &parts, body).await);
        }

        tracing::debug!(method = %parts.method, path, "no route matched");
        ("not_found", make_error_response(StatusCode::NOT_FOUND))
    }

    fn properties(&self) -> Response<ResponseBody> {
        let properties: Map<String, Value> = self
            .client_properties
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        json_response(StatusCode::OK, &Value::Object(properties))
    }

    async fn upload<B>(
        &self,
        ctx: &RequestContext,
        upload: &UploadAction,
        body: B,
    ) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Display,
    {
        let Some(content_type) = ctx.content_type.clone().filter(|_| ctx.is_multipart()) else {
            return error_response(
                StatusCode::BAD_REQUEST,
                UPLOAD_ACTION,
                "ERR_BAD_OR_MISSING_FIELD",
                "expected a multipart/form-data request",
            );
        };

        // One batch per session at a time; anonymous uploads are not tracked.
        if let Some(id) = &ctx.session_id
            && !self.sessions.stage_upload(id)
        {
            return error_response(
                StatusCode::CONFLICT,
                UPLOAD_ACTION,
                "ERR_UPLOAD_IN_PROGRESS",
                "another upload for this session has not finished",
            );
        }

        let response = async {
            let body = collect(body).await?;
            let items = parse_form(&content_type, body).await.map_err(|e| {
                error_response(
                    StatusCode::BAD_REQUEST,
                    UPLOAD_ACTION,
                    "ERR_BAD_OR_MISSING_FIELD",
                    &e.to_string(),
                )
            })?;
            let results = upload.execute(ctx, items).await;
            Ok::<_, Response<ResponseBody>>(json_response(StatusCode::OK, &Value::Object(results)))
        }
        .await;

        if let Some(id) = &ctx.session_id {
            self.sessions.clear_upload(id);
        }
        response.unwrap_or_else(|response| response)
    }
}

async fn dispatch<B>(
    ctx: &RequestContext,
    dispatcher: &Dispatcher,
    parts: &Parts,
    body: B,
) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Display,
{
    let body = match collect(body).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let wrapper: ServiceCallWrapper = match serde_json::from_slice(&body) {
        Ok(wrapper) => wrapper,
        Err(e) => {
            tracing::debug!(path = parts.uri.path(), error = %e, "invalid service call");
            return error_response(
                StatusCode::BAD_REQUEST,
                SERVICE_CALL_ACTION,
                "ERR_BAD_OR_MISSING_FIELD",
                &format!("invalid service call: {e}"),
            );
        }
    };

    match dispatcher.dispatch(ctx, wrapper).await {
        Ok(response) => relay(response),
        Err(e) => dispatch_error_response(SERVICE_CALL_ACTION, &e),
    }
}

fn relay(dispatched: DispatchResponse) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(dispatched.body));
    *response.status_mut() = dispatched.status;
    if let Some(value) = dispatched
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

async fn collect<B>(body: B) -> Result<Bytes, Response<ResponseBody>>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    match body.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            tracing::debug!(error = %e, "failed to read request body");
            Err(make_error_response(StatusCode::BAD_REQUEST))
        }
    }
}

fn method_not_allowed() -> Response<ResponseBody> {
    make_error_response(StatusCode::METHOD_NOT_ALLOWED)
}
