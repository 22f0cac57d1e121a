use super::{ConnectorError, OutboundRequest, UrlConnector, parse_address};
use crate::session::RequestContext;
use async_trait::async_trait;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::Method;

/// Identifies the user to the data management service with a `user` query
/// parameter.
#[derive(Debug, Default)]
pub struct DataApiConnector;

impl DataApiConnector {
    fn update_address(
        &self,
        ctx: &RequestContext,
        address: &str,
    ) -> Result<url::Url, ConnectorError> {
        let username = ctx.username().ok_or(ConnectorError::NotAuthenticated)?;
        let mut url = parse_address(address)?;
        if url.fragment().is_some_and(|f| !f.is_empty()) {
            return Err(ConnectorError::UnsupportedAnchor);
        }
        url.query_pairs_mut().append_pair("user", username);
        Ok(url)
    }
}

#[async_trait]
impl UrlConnector for DataApiConnector {
    fn name(&self) -> &'static str {
        "data_api"
    }

    async fn get_url_connection(
        &self,
        ctx: &RequestContext,
        address: &str,
    ) -> Result<OutboundRequest, ConnectorError> {
        let mut request = OutboundRequest::new(Method::GET, self.update_address(ctx, address)?);

        // Non-multipart bodies sent to the data service are always JSON.
        if matches!(ctx.method, Method::POST | Method::PUT) && !ctx.is_multipart() {
            request
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        Ok(request)
    }

    async fn get_request(
        &self,
        ctx: &RequestContext,
        address: &str,
        method: Method,
    ) -> Result<OutboundRequest, ConnectorError> {
        Ok(OutboundRequest::new(method, self.update_address(ctx, address)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::alice_context;

    #[tokio::test]
    async fn test_user_parameter_appended() {
        let ctx = alice_context(Method::GET, None);
        let connector = DataApiConnector;

        let request = connector
            .get_url_connection(&ctx, "http://data.example.org/stat")
            .await
            .unwrap();
        assert_eq!(request.url.as_str(), "http://data.example.org/stat?user=alice");

        let request = connector
            .get_url_connection(&ctx, "http://data.example.org/dir?path=%2Fhome")
            .await
            .unwrap();
        assert_eq!(
            request.url.as_str(),
            "http://data.example.org/dir?path=%2Fhome&user=alice"
        );
    }

    #[tokio::test]
    async fn test_anchor_rejected() {
        let err = DataApiConnector
            .get_url_connection(
                &alice_context(Method::GET, None),
                "http://data.example.org/dir#top",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::UnsupportedAnchor));
    }

    #[tokio::test]
    async fn test_requires_username() {
        let err = DataApiConnector
            .get_url_connection(&RequestContext::default(), "http://data.example.org/")
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::NotAuthenticated));
        assert_eq!(err.to_string(), "user is not authenticated");
    }

    #[tokio::test]
    async fn test_json_forced_for_non_multipart_writes() {
        let address = "http://data.example.org/rename";

        let post = alice_context(Method::POST, Some("text/plain"));
        let request = DataApiConnector.get_url_connection(&post, address).await.unwrap();
        assert_eq!(request.headers.get(CONTENT_TYPE).unwrap(), "application/json");

        let unset = alice_context(Method::PUT, None);
        let request = DataApiConnector.get_url_connection(&unset, address).await.unwrap();
        assert_eq!(request.headers.get(CONTENT_TYPE).unwrap(), "application/json");

        let multipart = alice_context(Method::POST, Some("multipart/form-data; boundary=x"));
        let request = DataApiConnector
            .get_url_connection(&multipart, address)
            .await
            .unwrap();
        assert!(request.headers.get(CONTENT_TYPE).is_none());

        let get = alice_context(Method::GET, None);
        let request = DataApiConnector.get_url_connection(&get, address).await.unwrap();
        assert!(request.headers.get(CONTENT_TYPE).is_none());

        let request = DataApiConnector
            .get_request(&post, address, Method::POST)
            .await
            .unwrap();
        assert!(request.headers.get(CONTENT_TYPE).is_none());
    }
}
