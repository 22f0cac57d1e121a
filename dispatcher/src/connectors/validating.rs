use super::{ConnectorError, OutboundRequest, UrlConnector, parse_address};
use crate::session::RequestContext;
use async_trait::async_trait;
use http::Method;

/// Requires an authenticated session but sends no credential.
#[derive(Debug, Default)]
pub struct AuthenticationValidatingConnector;

#[async_trait]
impl UrlConnector for AuthenticationValidatingConnector {
    fn name(&self) -> &'static str {
        "authentication_validating"
    }

    async fn get_url_connection(
        &self,
        ctx: &RequestContext,
        address: &str,
    ) -> Result<OutboundRequest, ConnectorError> {
        if ctx.principal().is_none() {
            return Err(ConnectorError::NotAuthenticated);
        }
        Ok(OutboundRequest::new(Method::GET, parse_address(address)?))
    }
}
