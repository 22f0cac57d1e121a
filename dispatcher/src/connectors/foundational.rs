use super::{
    ConnectorError, FOUNDATIONAL_API_TOKEN_HEADER, OutboundRequest, UrlConnector, parse_address,
};
use crate::session::RequestContext;
use crate::token::FoundationalApiTokenGenerator;
use async_trait::async_trait;
use http::{HeaderValue, Method};
use std::sync::Arc;

/// Username sent when security is disabled and none is configured.
pub const DEFAULT_USERNAME: &str = "ipctest";

pub struct FoundationalApiConnector {
    tokens: Arc<FoundationalApiTokenGenerator>,
    security_enabled: bool,
    default_username: String,
}

impl FoundationalApiConnector {
    pub fn new(
        tokens: Arc<FoundationalApiTokenGenerator>,
        security_enabled: bool,
        default_username: Option<String>,
    ) -> Self {
        FoundationalApiConnector {
            tokens,
            security_enabled,
            default_username: default_username.unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
        }
    }

    fn username<'a>(&'a self, ctx: &'a RequestContext) -> Result<&'a str, ConnectorError> {
        if self.security_enabled {
            ctx.username().ok_or(ConnectorError::NotAuthenticated)
        } else {
            Ok(&self.default_username)
        }
    }
}

#[async_trait]
impl UrlConnector for FoundationalApiConnector {
    fn name(&self) -> &'static str {
        "foundational_api"
    }

    async fn get_url_connection(
        &self,
        ctx: &RequestContext,
        address: &str,
    ) -> Result<OutboundRequest, ConnectorError> {
        let mut request = OutboundRequest::new(Method::GET, parse_address(address)?);
        let token = self.tokens.generate_token(self.username(ctx)?)?;
        request.headers.insert(
            FOUNDATIONAL_API_TOKEN_HEADER,
            HeaderValue::from_str(&format!("Basic {token}"))?,
        );
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::alice_context;
    use crate::token::write_key_file;

    fn tokens() -> (tempfile::TempDir, Arc<FoundationalApiTokenGenerator>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foundational.key");
        write_key_file(&path).unwrap();
        let tokens = FoundationalApiTokenGenerator::from_key_file(Some(&path)).unwrap();
        (dir, Arc::new(tokens))
    }

    fn token_user(tokens: &FoundationalApiTokenGenerator, request: &OutboundRequest) -> String {
        let header = request
            .headers
            .get(FOUNDATIONAL_API_TOKEN_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        let token = header.strip_prefix("Basic ").unwrap();
        let plaintext = tokens.decrypt_token(token).unwrap();
        let (user, timestamp) = plaintext.split_once('|').unwrap();
        assert!(timestamp.chars().all(|c| c.is_ascii_digit()));
        user.to_string()
    }

    #[tokio::test]
    async fn test_default_username_when_security_disabled() {
        let (_dir, tokens) = tokens();
        let connector = FoundationalApiConnector::new(tokens.clone(), false, None);

        let request = connector
            .get_url_connection(&RequestContext::default(), "http://foundational.example.org/users")
            .await
            .unwrap();
        assert_eq!(token_user(&tokens, &request), "ipctest");

        let connector =
            FoundationalApiConnector::new(tokens.clone(), false, Some("svc-account".into()));
        let request = connector
            .get_url_connection(&alice_context(Method::GET, None), "http://foundational.example.org/")
            .await
            .unwrap();
        assert_eq!(token_user(&tokens, &request), "svc-account");
    }

    #[tokio::test]
    async fn test_session_username_when_security_enabled() {
        let (_dir, tokens) = tokens();
        let connector = FoundationalApiConnector::new(tokens.clone(), true, Some("ignored".into()));

        let request = connector
            .get_url_connection(&alice_context(Method::GET, None), "http://foundational.example.org/")
            .await
            .unwrap();
        assert_eq!(token_user(&tokens, &request), "alice");

        let err = connector
            .get_url_connection(&RequestContext::default(), "http://foundational.example.org/")
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::NotAuthenticated));
    }
}
