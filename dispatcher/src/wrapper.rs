use bytes::Bytes;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl From<HttpMethod> for http::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => http::Method::GET,
            HttpMethod::Post => http::Method::POST,
            HttpMethod::Put => http::Method::PUT,
            HttpMethod::Delete => http::Method::DELETE,
        }
    }
}

/// Per-call request adjustments applied after the connector runs.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CallOptions {
    /// Adds the browser's address as the `ip-address` query parameter.
    pub add_ip_address: bool,
    /// Sends the body as `application/json` whatever the inbound type was.
    pub force_json_content_type: bool,
}

/// One part of a multipart body forwarded to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl MultipartPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        MultipartPart {
            name: name.into(),
            filename: None,
            content_type: None,
            data: Bytes::from(value.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A browser-initiated service call.
///
/// The browser sends `{"address": ..., "type": "POST", "body": ...}`;
/// multipart parts are only ever attached on the server.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ServiceCallWrapper {
    pub address: String,
    #[serde(rename = "type", default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(skip)]
    pub parts: Vec<MultipartPart>,
    #[serde(default)]
    pub options: CallOptions,
}

impl ServiceCallWrapper {
    pub fn new(method: HttpMethod, address: impl Into<String>) -> Self {
        ServiceCallWrapper {
            address: address.into(),
            method,
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_parts(mut self, parts: Vec<MultipartPart>) -> Self {
        self.parts = parts;
        self
    }

    pub fn is_multipart(&self) -> bool {
        !self.parts.is_empty()
    }
}
