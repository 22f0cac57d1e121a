//! Outbound request construction for backend service calls.
//!
//! A [`UrlConnector`] turns a resolved address into an [`OutboundRequest`]
//! carrying whatever credential the backend expects. Connectors fail closed:
//! when the credential cannot be produced the call is not made.

mod authenticated;
mod cas;
mod data_api;
mod foundational;
mod unauthenticated;
mod validating;

pub use authenticated::AuthenticatedConnector;
pub use cas::CasConnector;
pub use data_api::DataApiConnector;
pub use foundational::{DEFAULT_USERNAME, FoundationalApiConnector};
pub use unauthenticated::UnauthenticatedConnector;
pub use validating::AuthenticationValidatingConnector;

use crate::assertion::AssertionError;
use crate::cas::CasError;
use crate::session::RequestContext;
use crate::token::TokenError;
use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName};
use http::Method;
use url::Url;

/// Carries the signed and encrypted identity assertion.
pub const ASSERTION_HEADER: HeaderName = HeaderName::from_static("x-workbench-assertion");

/// Carries `Basic <token>` for the foundational API.
pub const FOUNDATIONAL_API_TOKEN_HEADER: HeaderName =
    HeaderName::from_static("x-foundational-api-token");

#[derive(thiserror::Error, Debug)]
pub enum ConnectorError {
    #[error("user is not authenticated")]
    NotAuthenticated,
    #[error("invalid service address {address}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported URL scheme in {0}")]
    UnsupportedScheme(String),
    #[error("URLs with anchors are not currently supported")]
    UnsupportedAnchor,
    #[error("remote address of the request is unknown")]
    MissingRemoteAddress,
    #[error("unable to build the identity assertion: {0}")]
    Assertion(#[from] AssertionError),
    #[error("unable to generate the foundational API token: {0}")]
    Token(#[from] TokenError),
    #[error("unable to obtain a proxy ticket: {0}")]
    ProxyTicket(#[from] CasError),
    #[error("invalid header value")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),
}

impl ConnectorError {
    /// Whether the caller should be told to authenticate rather than see a
    /// server error.
    pub fn is_authentication_failure(&self) -> bool {
        match self {
            ConnectorError::NotAuthenticated => true,
            ConnectorError::Assertion(e) => e.is_authentication_failure(),
            ConnectorError::ProxyTicket(CasError::Rejected { .. }) => true,
            _ => false,
        }
    }
}

/// A request to a backend service that has not been sent yet.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl OutboundRequest {
    pub fn new(method: Method, url: Url) -> Self {
        OutboundRequest {
            method,
            url,
            headers: HeaderMap::new(),
        }
    }

    /// Appends a URL-encoded query parameter, keeping existing parameters.
    pub fn add_query_param(&mut self, name: &str, value: &str) {
        self.url.query_pairs_mut().append_pair(name, value);
    }

    /// Tells the backend which address the browser connected from.
    pub fn add_ip_address(&mut self, ctx: &RequestContext) -> Result<(), ConnectorError> {
        let remote = ctx
            .remote_addr
            .ok_or(ConnectorError::MissingRemoteAddress)?;
        self.add_query_param("ip-address", &remote.to_string());
        Ok(())
    }
}

pub(crate) fn parse_address(address: &str) -> Result<Url, ConnectorError> {
    let url = Url::parse(address).map_err(|source| ConnectorError::InvalidAddress {
        address: address.to_string(),
        source,
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ConnectorError::UnsupportedScheme(address.to_string())),
    }
}

#[async_trait]
pub trait UrlConnector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds a GET request for `address`.
    async fn get_url_connection(
        &self,
        ctx: &RequestContext,
        address: &str,
    ) -> Result<OutboundRequest, ConnectorError>;

    /// Builds a request that will carry a body.
    async fn get_request(
        &self,
        ctx: &RequestContext,
        address: &str,
        method: Method,
    ) -> Result<OutboundRequest, ConnectorError> {
        let mut request = self.get_url_connection(ctx, address).await?;
        request.method = method;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::alice_context;

    #[test]
    fn test_add_query_param_encodes_value() {
        let mut request = OutboundRequest::new(
            Method::GET,
            Url::parse("http://data.example.org/files?path=/home").unwrap(),
        );
        request.add_query_param("user", "jane doe&co");
        assert_eq!(
            request.url.as_str(),
            "http://data.example.org/files?path=/home&user=jane+doe%26co"
        );
    }

    #[test]
    fn test_add_ip_address() {
        let mut request =
            OutboundRequest::new(Method::GET, Url::parse("http://apps.example.org/").unwrap());
        request
            .add_ip_address(&alice_context(Method::GET, None))
            .unwrap();
        assert_eq!(request.url.query(), Some("ip-address=10.0.0.7"));

        let anonymous = RequestContext::default();
        assert!(matches!(
            request.add_ip_address(&anonymous),
            Err(ConnectorError::MissingRemoteAddress)
        ));
    }

    #[test]
    fn test_invalid_address() {
        assert!(matches!(
            parse_address("not a url"),
            Err(ConnectorError::InvalidAddress { .. })
        ));
        assert!(matches!(
            parse_address("mailto:alice@example.org"),
            Err(ConnectorError::UnsupportedScheme(_))
        ));
    }
}
