use super::{ASSERTION_HEADER, ConnectorError, OutboundRequest, UrlConnector, parse_address};
use crate::assertion::AssertionBuilder;
use crate::session::RequestContext;
use async_trait::async_trait;
use http::{HeaderValue, Method};
use std::sync::Arc;

/// Attaches a signed and encrypted identity assertion to every request.
///
/// Without an assertion builder (security disabled) this behaves exactly like
/// [`super::UnauthenticatedConnector`].
pub struct AuthenticatedConnector {
    assertions: Option<Arc<dyn AssertionBuilder>>,
}

impl AuthenticatedConnector {
    pub fn new(assertions: Option<Arc<dyn AssertionBuilder>>) -> Self {
        AuthenticatedConnector { assertions }
    }
}

#[async_trait]
impl UrlConnector for AuthenticatedConnector {
    fn name(&self) -> &'static str {
        "authenticated"
    }

    async fn get_url_connection(
        &self,
        ctx: &RequestContext,
        address: &str,
    ) -> Result<OutboundRequest, ConnectorError> {
        let mut request = OutboundRequest::new(Method::GET, parse_address(address)?);

        if let Some(assertions) = &self.assertions {
            let assertion = assertions.build(ctx).await.inspect_err(|e| {
                tracing::error!(error = %e, "unable to build the identity assertion");
            })?;
            request
                .headers
                .insert(ASSERTION_HEADER, HeaderValue::from_str(&assertion)?);
        }

        Ok(request)
    }
}
