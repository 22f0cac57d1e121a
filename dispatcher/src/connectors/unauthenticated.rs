use super::{ConnectorError, OutboundRequest, UrlConnector, parse_address};
use crate::session::RequestContext;
use async_trait::async_trait;
use http::Method;

/// Connects to services that need no credential.
#[derive(Debug, Default)]
pub struct UnauthenticatedConnector;

#[async_trait]
impl UrlConnector for UnauthenticatedConnector {
    fn name(&self) -> &'static str {
        "unauthenticated"
    }

    async fn get_url_connection(
        &self,
        _ctx: &RequestContext,
        address: &str,
    ) -> Result<OutboundRequest, ConnectorError> {
        Ok(OutboundRequest::new(Method::GET, parse_address(address)?))
    }
}
