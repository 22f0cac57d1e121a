use crate::dispatch::{DispatchError, Dispatcher, multipart_form};
use crate::errors::{ResponseBody, dispatch_error_response, error_response};
use crate::session::RequestContext;
use crate::upload::parse_form;
use crate::wrapper::MultipartPart;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST};
use http::request::Parts;
use http::{Response, StatusCode};
use reqwest::multipart::Form;
use shared::http::{add_via_header, filter_hop_by_hop, full_body};
use std::sync::Arc;

const PROXY_ACTION: &str = "PROXY_SERVICE_CALL";
const BAD_FIELD: &str = "ERR_BAD_OR_MISSING_FIELD";

/// Forwards `{prefix}/{service name}` requests to the resolved service and
/// relays the response as is.
pub struct ServiceProxy {
    dispatcher: Arc<Dispatcher>,
}

impl ServiceProxy {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        ServiceProxy { dispatcher }
    }

    pub async fn forward(
        &self,
        ctx: &RequestContext,
        service_path: &str,
        parts: &Parts,
        body: Bytes,
    ) -> Response<ResponseBody> {
        let service_name = service_path.trim_start_matches('/');
        if service_name.is_empty() {
            return error_response(
                StatusCode::BAD_REQUEST,
                PROXY_ACTION,
                BAD_FIELD,
                "no service name provided",
            );
        }

        let mut address = match self.dispatcher.resolver().resolve_address(service_name) {
            Ok(address) => address,
            Err(e) => {
                let err = DispatchError::from(e);
                if err.status_code() != StatusCode::BAD_REQUEST {
                    return dispatch_error_response(PROXY_ACTION, &err);
                }
                return error_response(
                    StatusCode::BAD_REQUEST,
                    PROXY_ACTION,
                    BAD_FIELD,
                    &err.to_string(),
                );
            }
        };
        if let Some(query) = parts.uri.query() {
            address.push(if address.contains('?') { '&' } else { '?' });
            address.push_str(query);
        }

        match self.send(ctx, &address, parts, body).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(service = service_name, error = %e, "proxied call failed");
                dispatch_error_response(PROXY_ACTION, &e)
            }
        }
    }

    async fn send(
        &self,
        ctx: &RequestContext,
        address: &str,
        parts: &Parts,
        body: Bytes,
    ) -> Result<Response<ResponseBody>, DispatchError> {
        let connector = self.dispatcher.connector();
        let outbound = if body.is_empty() {
            let mut request = connector.get_url_connection(ctx, address).await?;
            request.method = parts.method.clone();
            request
        } else {
            connector
                .get_request(ctx, address, parts.method.clone())
                .await?
        };

        let mut headers = parts.headers.clone();
        filter_hop_by_hop(&mut headers, parts.version);
        headers.remove(HOST);
        headers.remove(COOKIE);
        headers.remove(CONTENT_LENGTH);
        for (name, value) in &outbound.headers {
            headers.insert(name, value.clone());
        }

        let request = self
            .dispatcher
            .client()
            .request(outbound.method, outbound.url);
        let request = match self.outbound_body(ctx, parts, body).await? {
            OutboundBody::Empty => request.headers(headers),
            OutboundBody::Raw(body) => request.headers(headers).body(body),
            OutboundBody::Form(form) => {
                // The multipart encoder sets its own content type and boundary.
                headers.remove(CONTENT_TYPE);
                request.headers(headers).multipart(form)
            }
        };
        let upstream = request.send().await?;

        let status = upstream.status();
        let version = upstream.version();
        let mut response_headers = upstream.headers().clone();
        let upstream_body = upstream.bytes().await?;

        filter_hop_by_hop(&mut response_headers, version);
        response_headers.remove(CONTENT_LENGTH);
        add_via_header(&mut response_headers, version);

        let mut response = Response::new(full_body(upstream_body));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

enum OutboundBody {
    Empty,
    Raw(Bytes),
    Form(Form),
}

impl ServiceProxy {
    /// Runs the dispatcher's hooks over a proxied body, the same way
    /// dispatched calls get them.
    async fn outbound_body(
        &self,
        ctx: &RequestContext,
        parts: &Parts,
        body: Bytes,
    ) -> Result<OutboundBody, DispatchError> {
        if body.is_empty() {
            return Ok(OutboundBody::Empty);
        }
        let hooks = self.dispatcher.hooks();

        if ctx.is_multipart() {
            let extra = hooks.additional_parts(ctx)?;
            if extra.is_empty() {
                return Ok(OutboundBody::Raw(body));
            }
            let content_type = parts
                .headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let items = parse_form(content_type, body)
                .await
                .map_err(|e| DispatchError::InvalidBody(e.to_string()))?;
            let mut form_parts: Vec<MultipartPart> = items
                .into_iter()
                .map(|item| MultipartPart {
                    name: item.field_name,
                    filename: item.filename,
                    content_type: item.content_type,
                    data: item.data,
                })
                .collect();
            form_parts.extend(extra);
            return Ok(OutboundBody::Form(multipart_form(form_parts)?));
        }

        match String::from_utf8(body.to_vec()) {
            Ok(text) => Ok(OutboundBody::Raw(Bytes::from(
                hooks.update_request_body(ctx, text)?,
            ))),
            // Binary bodies cannot be rewritten; a hook that needs to see the
            // body rejects them.
            Err(_) => hooks
                .update_request_body(ctx, String::new())
                .map(|_| OutboundBody::Raw(body)),
        }
    }
}
