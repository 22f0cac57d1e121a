use crate::config::{IdentityHeaders, SessionConfig};
use crate::errors::ResponseBody;
use crate::session::{Session, SessionStore};
use http::header::{CONTENT_TYPE, HeaderMap, HeaderValue, LOCATION, SET_COOKIE};
use http::{Response, StatusCode};
use shared::http::full_body;
use std::sync::Arc;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SessionInitError {
    #[error("internal configuration error: no assertion count provided")]
    MissingAssertionCount,
    #[error("assertion URL header {0} is missing")]
    MissingAssertionUrl(String),
    #[error("no principal provided by the identity provider")]
    MissingPrincipal,
}

impl SessionInitError {
    fn status_code(&self) -> StatusCode {
        match self {
            SessionInitError::MissingPrincipal => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Reads the identity the fronting service provider injected into the
/// request. Assertion URL headers are numbered from `01`.
pub fn session_from_headers(
    headers: &HeaderMap,
    names: &IdentityHeaders,
) -> Result<Session, SessionInitError> {
    let count: usize = header_value(headers, &names.assertion_count)
        .and_then(|count| count.parse().ok())
        .ok_or(SessionInitError::MissingAssertionCount)?;

    let assertion_urls = (1..=count)
        .map(|i| {
            let name = format!("{}{i:02}", names.assertion_url_prefix);
            header_value(headers, &name).ok_or(SessionInitError::MissingAssertionUrl(name))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let principal =
        header_value(headers, &names.principal).ok_or(SessionInitError::MissingPrincipal)?;

    Ok(Session {
        principal: Some(principal),
        username: header_value(headers, &names.username),
        email: header_value(headers, &names.email),
        assertion_urls,
        proxy_granting_ticket: header_value(headers, &names.proxy_granting_ticket),
    })
}

/// Session initialization and logout.
pub struct SessionEndpoints {
    sessions: Arc<SessionStore>,
    config: SessionConfig,
}

impl SessionEndpoints {
    pub fn new(sessions: Arc<SessionStore>, config: SessionConfig) -> Self {
        SessionEndpoints { sessions, config }
    }

    pub fn init(&self, headers: &HeaderMap) -> Response<ResponseBody> {
        let session = match session_from_headers(headers, &self.config.headers) {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "unable to initialize session");
                let mut response = Response::new(full_body(format!("{e}\n")));
                *response.status_mut() = e.status_code();
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                return response;
            }
        };

        // A new login always gets a fresh session id.
        if let Some((previous, _)) = self.sessions.lookup_cookie(headers) {
            self.sessions.remove(&previous);
        }

        tracing::info!(
            principal = session.principal.as_deref().unwrap_or_default(),
            assertions = session.assertion_urls.len(),
            "session initialized"
        );
        let id = self.sessions.create(session);
        let cookie = self.cookie(&format!("{id}; Path=/"));
        redirect(&self.config.initial_page, &cookie)
    }

    pub fn logout(&self, headers: &HeaderMap) -> Response<ResponseBody> {
        if let Some((id, session)) = self.sessions.lookup_cookie(headers) {
            tracing::info!(
                principal = session.principal.as_deref().unwrap_or_default(),
                "session ended"
            );
            self.sessions.remove(&id);
        }

        let cookie = self.cookie("; Path=/; Max-Age=0");
        let target = self
            .config
            .logout_redirect
            .as_deref()
            .unwrap_or(&self.config.initial_page);
        redirect(target, &cookie)
    }

    fn cookie(&self, value_and_scope: &str) -> String {
        let secure = if self.config.secure_cookie { "; Secure" } else { "" };
        format!(
            "{}={value_and_scope}; HttpOnly; SameSite=Lax{secure}",
            self.sessions.cookie_name()
        )
    }
}

fn redirect(location: &str, cookie: &str) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(""));
    *response.status_mut() = StatusCode::FOUND;
    let headers = response.headers_mut();
    match HeaderValue::from_str(location) {
        Ok(value) => {
            headers.insert(LOCATION, value);
        }
        Err(_) => {
            tracing::error!(location, "invalid redirect location");
            headers.insert(LOCATION, HeaderValue::from_static("/"));
        }
    }
    if let Ok(value) = HeaderValue::from_str(cookie) {
        headers.insert(SET_COOKIE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::COOKIE;

    fn endpoints() -> SessionEndpoints {
        let config = SessionConfig {
            initial_page: "/workbench/".into(),
            ..Default::default()
        };
        SessionEndpoints::new(Arc::new(SessionStore::new(&config)), config)
    }

    fn identity_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Shib-Assertion-Count", HeaderValue::from_static("2"));
        headers.insert(
            "Shib-Assertion-01",
            HeaderValue::from_static("https://idp.example.org/assertion/1"),
        );
        headers.insert(
            "Shib-Assertion-02",
            HeaderValue::from_static("https://idp.example.org/assertion/2"),
        );
        headers.insert("eppn", HeaderValue::from_static("alice@example.org"));
        headers.insert("uid", HeaderValue::from_static("alice"));
        headers.insert("mail", HeaderValue::from_static("alice@example.org"));
        headers
    }

    fn session_id(response: &Response<ResponseBody>) -> String {
        let cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        let (pair, _) = cookie.split_once(';').unwrap();
        pair.split_once('=').unwrap().1.to_string()
    }

    #[test]
    fn test_session_from_headers() {
        let session =
            session_from_headers(&identity_headers(), &IdentityHeaders::default()).unwrap();
        assert_eq!(session.principal.as_deref(), Some("alice@example.org"));
        assert_eq!(session.username.as_deref(), Some("alice"));
        assert_eq!(
            session.assertion_urls,
            vec![
                "https://idp.example.org/assertion/1".to_string(),
                "https://idp.example.org/assertion/2".to_string(),
            ]
        );
        assert_eq!(session.proxy_granting_ticket, None);
    }

    #[test]
    fn test_missing_assertion_count() {
        let mut headers = identity_headers();
        headers.remove("Shib-Assertion-Count");
        assert_eq!(
            session_from_headers(&headers, &IdentityHeaders::default()),
            Err(SessionInitError::MissingAssertionCount)
        );

        let response = endpoints().init(&headers);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_missing_numbered_assertion() {
        let mut headers = identity_headers();
        headers.remove("Shib-Assertion-02");
        assert_eq!(
            session_from_headers(&headers, &IdentityHeaders::default()),
            Err(SessionInitError::MissingAssertionUrl("Shib-Assertion-02".into()))
        );
    }

    #[test]
    fn test_missing_principal() {
        let mut headers = identity_headers();
        headers.remove("eppn");
        let response = endpoints().init(&headers);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_init_then_logout() {
        let endpoints = endpoints();

        let response = endpoints.init(&identity_headers());
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/workbench/");
        let cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("WORKBENCH_SESSION="));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.ends_with("; Secure"));

        let id = session_id(&response);
        assert_eq!(
            endpoints.sessions.get(&id).unwrap().username.as_deref(),
            Some("alice")
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("WORKBENCH_SESSION={id}")).unwrap(),
        );
        let response = endpoints.logout(&headers);
        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(response.headers()[SET_COOKIE]
            .to_str()
            .unwrap()
            .contains("Max-Age=0"));
        assert!(endpoints.sessions.get(&id).is_none());
    }

    #[test]
    fn test_plain_http_cookie() {
        let config = SessionConfig {
            secure_cookie: false,
            ..Default::default()
        };
        let endpoints = SessionEndpoints::new(Arc::new(SessionStore::new(&config)), config);

        for response in [
            endpoints.init(&identity_headers()),
            endpoints.logout(&HeaderMap::new()),
        ] {
            let cookie = response.headers()[SET_COOKIE].to_str().unwrap();
            assert!(cookie.contains("HttpOnly"));
            assert!(!cookie.contains("Secure"));
        }
    }

    #[test]
    fn test_reinit_replaces_session() {
        let endpoints = endpoints();
        let first = session_id(&endpoints.init(&identity_headers()));

        let mut headers = identity_headers();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("WORKBENCH_SESSION={first}")).unwrap(),
        );
        let second = session_id(&endpoints.init(&headers));

        assert_ne!(first, second);
        assert!(endpoints.sessions.get(&first).is_none());
        assert!(endpoints.sessions.get(&second).is_some());
    }
}
