use crate::config::DispatcherKind;
use crate::connectors::{ConnectorError, OutboundRequest, UrlConnector};
use crate::metrics_defs::{DISPATCH_DURATION, DISPATCH_ERRORS};
use crate::session::RequestContext;
use crate::wrapper::{MultipartPart, ServiceCallWrapper};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Method, StatusCode};
use reqwest::multipart::{Form, Part};
use resolver::{ResolverError, ServiceCallResolver};
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Resolution(#[from] ResolverError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("service call timed out")]
    Timeout,
    #[error("service call failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("service responded with {status}")]
    Backend { status: StatusCode, body: String },
    #[error("invalid request body: {0}")]
    InvalidBody(String),
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DispatchError::Timeout
        } else {
            // Outbound URLs carry tickets and tokens in their query strings.
            DispatchError::Transport(e.without_url())
        }
    }
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::Resolution(ResolverError::Unresolvable { .. }) => {
                StatusCode::BAD_REQUEST
            }
            DispatchError::Resolution(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::Connector(e) if e.is_authentication_failure() => {
                StatusCode::UNAUTHORIZED
            }
            DispatchError::Connector(
                ConnectorError::InvalidAddress { .. }
                | ConnectorError::UnsupportedScheme(_)
                | ConnectorError::UnsupportedAnchor
                | ConnectorError::MissingRemoteAddress,
            ) => StatusCode::BAD_REQUEST,
            DispatchError::Connector(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Transport(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Backend { status, .. } => *status,
            DispatchError::InvalidBody(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn error_code(&self) -> &'static str {
        let status = self.status_code();
        match self {
            _ if status == StatusCode::UNAUTHORIZED => "ERR_NOT_AUTHENTICATED",
            DispatchError::Resolution(ResolverError::Unresolvable { .. }) => {
                "ERR_UNRESOLVABLE_SERVICE"
            }
            DispatchError::Resolution(_) | DispatchError::Connector(_)
                if status == StatusCode::BAD_REQUEST =>
            {
                "ERR_BAD_REQUEST"
            }
            DispatchError::Resolution(_) | DispatchError::Connector(_) => "ERR_CONFIGURATION",
            DispatchError::Timeout => "ERR_TIMEOUT",
            DispatchError::Transport(_) => "ERR_SERVICE_UNAVAILABLE",
            DispatchError::Backend { .. } => "ERR_SERVICE",
            DispatchError::InvalidBody(_) => "ERR_BAD_OR_MISSING_FIELD",
        }
    }

    /// A message that is safe to show the browser.
    pub fn detail(&self) -> String {
        match self {
            DispatchError::Transport(_) => "unable to reach the service".to_string(),
            DispatchError::Connector(e) if e.is_authentication_failure() => {
                "user is not authenticated".to_string()
            }
            DispatchError::Connector(
                ConnectorError::InvalidAddress { .. } | ConnectorError::UnsupportedScheme(_),
            ) => "invalid service address".to_string(),
            DispatchError::Connector(_) if self.status_code().is_server_error() => {
                "unable to prepare the service call".to_string()
            }
            DispatchError::Resolution(_) if self.status_code().is_server_error() => {
                "service configuration error".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn service_name(&self) -> Option<&str> {
        match self {
            DispatchError::Resolution(ResolverError::Unresolvable { service_name }) => {
                Some(service_name)
            }
            _ => None,
        }
    }
}

/// Per-dispatcher adjustments to what gets sent.
pub trait DispatchHooks: Send + Sync {
    fn update_request_body(
        &self,
        _ctx: &RequestContext,
        body: String,
    ) -> Result<String, DispatchError> {
        Ok(body)
    }

    fn additional_parts(&self, _ctx: &RequestContext) -> Result<Vec<MultipartPart>, DispatchError> {
        Ok(Vec::new())
    }
}

pub struct PassThrough;

impl DispatchHooks for PassThrough {}

/// Adds the session's username to a JSON object body as `user`.
pub struct InjectJsonUser;

impl DispatchHooks for InjectJsonUser {
    fn update_request_body(
        &self,
        ctx: &RequestContext,
        body: String,
    ) -> Result<String, DispatchError> {
        let username = ctx.username().ok_or(ConnectorError::NotAuthenticated)?;
        let mut json: serde_json::Value = serde_json::from_str(&body)
            .map_err(|_| DispatchError::InvalidBody("body is not valid JSON".into()))?;
        let object = json
            .as_object_mut()
            .ok_or_else(|| DispatchError::InvalidBody("body is not a JSON object".into()))?;
        object.insert("user".into(), username.into());
        Ok(json.to_string())
    }
}

/// Adds the session's username as a `user` multipart part.
pub struct AppendUserPart;

impl DispatchHooks for AppendUserPart {
    fn additional_parts(&self, ctx: &RequestContext) -> Result<Vec<MultipartPart>, DispatchError> {
        let username = ctx.username().ok_or(ConnectorError::NotAuthenticated)?;
        Ok(vec![MultipartPart::text("user", username)])
    }
}

#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Resolves, authenticates and executes service calls. The connector and
/// hooks decide how the call is authenticated and what extra data it carries.
pub struct Dispatcher {
    kind: DispatcherKind,
    resolver: Arc<ServiceCallResolver>,
    connector: Arc<dyn UrlConnector>,
    hooks: Arc<dyn DispatchHooks>,
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(
        kind: DispatcherKind,
        resolver: Arc<ServiceCallResolver>,
        connector: Arc<dyn UrlConnector>,
        hooks: Arc<dyn DispatchHooks>,
        client: reqwest::Client,
    ) -> Self {
        Dispatcher {
            kind,
            resolver,
            connector,
            hooks,
            client,
        }
    }

    pub fn kind(&self) -> DispatcherKind {
        self.kind
    }

    pub fn resolver(&self) -> &ServiceCallResolver {
        &self.resolver
    }

    pub fn connector(&self) -> &dyn UrlConnector {
        self.connector.as_ref()
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn hooks(&self) -> &dyn DispatchHooks {
        self.hooks.as_ref()
    }

    /// Performs the call and returns whatever the backend answered, including
    /// error statuses.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        wrapper: ServiceCallWrapper,
    ) -> Result<DispatchResponse, DispatchError> {
        let start = Instant::now();
        let address = without_query(&wrapper.address).to_string();
        let result = self.execute(ctx, wrapper).await;

        let outcome = match &result {
            Ok(response) if response.status.is_success() => "success",
            Ok(_) => "backend_error",
            Err(_) => "error",
        };
        histogram!(DISPATCH_DURATION, "kind" => self.kind.as_str(), "outcome" => outcome)
            .record(start.elapsed().as_secs_f64());

        if let Err(e) = &result {
            counter!(DISPATCH_ERRORS, "kind" => self.kind.as_str(), "error_code" => e.error_code())
                .increment(1);
            tracing::warn!(
                kind = self.kind.as_str(),
                address = %address,
                error = %e,
                "service call failed"
            );
        }
        result
    }

    /// Like [`Dispatcher::dispatch`] but treats non-2xx statuses as errors
    /// and returns the body as text.
    pub async fn get_service_data(
        &self,
        ctx: &RequestContext,
        wrapper: ServiceCallWrapper,
    ) -> Result<String, DispatchError> {
        let response = self.dispatch(ctx, wrapper).await?;
        let body = String::from_utf8_lossy(&response.body).into_owned();
        if !response.status.is_success() {
            return Err(DispatchError::Backend {
                status: response.status,
                body,
            });
        }
        Ok(body)
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        wrapper: ServiceCallWrapper,
    ) -> Result<DispatchResponse, DispatchError> {
        let address = self.resolver.resolve_address(&wrapper.address)?;
        let method: Method = wrapper.method.into();

        let mut outbound = if wrapper.body.is_some() || wrapper.is_multipart() {
            self.connector.get_request(ctx, &address, method).await?
        } else {
            let mut request = self.connector.get_url_connection(ctx, &address).await?;
            request.method = method;
            request
        };

        if wrapper.options.add_ip_address {
            outbound.add_ip_address(ctx)?;
        }
        if wrapper.options.force_json_content_type {
            outbound
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        let ServiceCallWrapper { body, parts, .. } = wrapper;
        let OutboundRequest {
            method,
            url,
            mut headers,
        } = outbound;

        tracing::debug!(
            kind = self.kind.as_str(),
            connector = self.connector.name(),
            method = %method,
            url = %loggable_url(&url),
            "dispatching service call"
        );

        let mut request = if !parts.is_empty() {
            // The multipart encoder sets its own content type and boundary.
            headers.remove(CONTENT_TYPE);
            let mut parts = parts;
            parts.extend(self.hooks.additional_parts(ctx)?);
            self.client
                .request(method, url)
                .headers(headers)
                .multipart(multipart_form(parts)?)
        } else {
            self.client.request(method, url).headers(headers)
        };

        if let Some(body) = body {
            request = request.body(self.hooks.update_request_body(ctx, body)?);
        }

        let response = request.send().await?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        Ok(DispatchResponse {
            status,
            content_type,
            body,
        })
    }
}

/// The part of an address that is safe to log.
pub(crate) fn without_query(address: &str) -> &str {
    address.split(['?', '#']).next().unwrap_or(address)
}

pub(crate) fn loggable_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    let _ = url.set_password(None);
    url.to_string()
}

pub(crate) fn multipart_form(parts: Vec<MultipartPart>) -> Result<Form, DispatchError> {
    let mut form = Form::new();
    for part in parts {
        let mut encoded = Part::bytes(part.data.to_vec());
        if let Some(filename) = part.filename {
            encoded = encoded.file_name(filename);
        }
        if let Some(content_type) = &part.content_type {
            encoded = encoded.mime_str(content_type).map_err(|_| {
                DispatchError::InvalidBody(format!("invalid content type for part {}", part.name))
            })?;
        }
        form = form.part(part.name, encoded);
    }
    Ok(form)
}
