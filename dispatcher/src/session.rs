use crate::config::{DevelopmentIdentity, SessionConfig};
use crate::metrics_defs::{SESSIONS_CREATED, UPLOADS_REJECTED};
use http::header::{CONTENT_TYPE, COOKIE, HeaderMap};
use http::Method;
use moka::sync::Cache;
use rand::RngCore;
use shared::counter;
use shared::http::RemoteAddr;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Identity attributes captured when the session was initialized.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    /// Federated principal name (eppn)
    pub principal: Option<String>,
    /// Local username (uid)
    pub username: Option<String>,
    pub email: Option<String>,
    /// URLs the identity provider exposes the login assertions at
    pub assertion_urls: Vec<String>,
    pub proxy_granting_ticket: Option<String>,
}

impl From<&DevelopmentIdentity> for Session {
    fn from(identity: &DevelopmentIdentity) -> Self {
        Session {
            principal: Some(identity.principal.clone()),
            username: Some(identity.username.clone()),
            email: identity.email.clone(),
            ..Default::default()
        }
    }
}

/// In-memory sessions keyed by the session cookie value. Sessions expire
/// after the configured idle time.
pub struct SessionStore {
    cookie_name: String,
    sessions: Cache<String, Arc<Session>>,
    // Session ids with an upload batch currently being forwarded.
    staged_uploads: Cache<String, ()>,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        let idle = Duration::from_secs(config.idle_timeout_secs);
        SessionStore {
            cookie_name: config.cookie_name.clone(),
            sessions: Cache::builder()
                .max_capacity(config.max_sessions)
                .time_to_idle(idle)
                .build(),
            staged_uploads: Cache::builder()
                .max_capacity(config.max_sessions)
                .time_to_live(idle)
                .build(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn create(&self, session: Session) -> String {
        let mut id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut id);
        let id = hex::encode(id);

        self.sessions.insert(id.clone(), Arc::new(session));
        counter!(SESSIONS_CREATED).increment(1);
        id
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id)
    }

    pub fn remove(&self, id: &str) {
        self.sessions.invalidate(id);
        self.staged_uploads.invalidate(id);
    }

    /// Marks an upload batch as in flight for the session. Returns false when
    /// another batch for the same session has not finished yet.
    pub fn stage_upload(&self, id: &str) -> bool {
        let staged = self
            .staged_uploads
            .entry(id.to_string())
            .or_insert_with(|| ())
            .is_fresh();
        if !staged {
            counter!(UPLOADS_REJECTED).increment(1);
        }
        staged
    }

    pub fn clear_upload(&self, id: &str) {
        self.staged_uploads.invalidate(id);
    }

    /// Looks up the session named by the request's cookie header.
    pub fn lookup_cookie(&self, headers: &HeaderMap) -> Option<(String, Arc<Session>)> {
        let id = session_cookie(headers, &self.cookie_name)?;
        let session = self.get(&id)?;
        Some((id, session))
    }
}

fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// Everything a connector may consult about the inbound request.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub session_id: Option<String>,
    pub session: Option<Arc<Session>>,
    pub method: Method,
    pub content_type: Option<String>,
    pub remote_addr: Option<IpAddr>,
}

impl RequestContext {
    pub fn from_request<B>(request: &http::Request<B>, sessions: &SessionStore) -> Self {
        let (session_id, session) = match sessions.lookup_cookie(request.headers()) {
            Some((id, session)) => (Some(id), Some(session)),
            None => (None, None),
        };

        RequestContext {
            session_id,
            session,
            method: request.method().clone(),
            content_type: request
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            remote_addr: request
                .extensions()
                .get::<RemoteAddr>()
                .map(|addr| addr.0.ip()),
        }
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(Arc::new(session));
        self
    }

    pub fn principal(&self) -> Option<&str> {
        self.session.as_ref()?.principal.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.session.as_ref()?.username.as_deref()
    }

    pub fn email(&self) -> Option<&str> {
        self.session.as_ref()?.email.as_deref()
    }

    pub fn assertion_urls(&self) -> &[String] {
        match &self.session {
            Some(session) => &session.assertion_urls,
            None => &[],
        }
    }

    pub fn proxy_granting_ticket(&self) -> Option<&str> {
        self.session.as_ref()?.proxy_granting_ticket.as_deref()
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("multipart"))
    }
}
