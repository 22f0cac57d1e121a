use crate::keys::KeystoreSource;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

/// Serves `client_properties`.
pub const PROPERTIES_PATH: &str = "/properties";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Mount path must be non-empty and start with '/'")]
    InvalidMountPath(String),

    #[error("Duplicate mount path: {0}")]
    DuplicateMount(String),

    #[error("Path {0} is under the proxy prefix and would never be reached")]
    ShadowedByProxy(String),

    #[error("Security is enabled but {0} is not set")]
    MissingSecurityProperty(&'static str),

    #[error("A cas dispatcher is mounted but no CAS server is configured")]
    CasNotConfigured,

    #[error("A foundational_api dispatcher is mounted but no key file is configured")]
    FoundationalKeyMissing,

    #[error("Request timeout cannot be 0")]
    InvalidTimeout,
}

/// The dispatcher flavours that can be mounted. Each one pairs a URL
/// connector with the request-body hooks it needs.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherKind {
    /// Signed and encrypted assertion header when security is enabled.
    Secured,
    Unsecured,
    /// No credential; the username is injected into the JSON request body.
    AuthenticatedJson,
    /// `user` query parameter, plus a `user` part on multipart requests.
    DataApi,
    /// CAS proxy ticket query parameter.
    Cas,
    /// Encrypted username token header.
    FoundationalApi,
    /// Requires an authenticated session, adds no credential.
    AuthenticationValidating,
}

impl DispatcherKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DispatcherKind::Secured => "secured",
            DispatcherKind::Unsecured => "unsecured",
            DispatcherKind::AuthenticatedJson => "authenticated_json",
            DispatcherKind::DataApi => "data_api",
            DispatcherKind::Cas => "cas",
            DispatcherKind::FoundationalApi => "foundational_api",
            DispatcherKind::AuthenticationValidating => "authentication_validating",
        }
    }
}

/// Dispatcher configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for browser requests
    pub listener: Listener,
    /// Admin listener for health and readiness checks
    pub admin_listener: Listener,
    /// Logical service name aliases
    pub services: resolver::config::Config,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    /// JSON dispatch endpoints
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Named-service pass-through proxy
    pub proxy: Option<ProxyConfig>,
    /// Multipart file upload endpoint
    pub upload: Option<UploadConfig>,
    pub cas: Option<CasConfig>,
    /// Key/value pairs served to the browser from `/properties`
    #[serde(default)]
    pub client_properties: BTreeMap<String, String>,
    /// Applies to every outbound backend request
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_http_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.http_timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }

        let mut paths = HashSet::new();
        let mut claim = |path: &str| -> Result<(), ValidationError> {
            if path.is_empty() || !path.starts_with('/') {
                return Err(ValidationError::InvalidMountPath(path.to_string()));
            }
            if !paths.insert(path.to_string()) {
                return Err(ValidationError::DuplicateMount(path.to_string()));
            }
            Ok(())
        };

        let mut routes: Vec<&str> = self.mounts.iter().map(|m| m.path.as_str()).collect();
        if let Some(upload) = &self.upload {
            routes.push(&upload.path);
            routes.extend(upload.make_public_path.as_deref());
        }
        routes.push(&self.sessions.init_path);
        routes.push(&self.sessions.logout_path);
        routes.push(PROPERTIES_PATH);
        for path in &routes {
            claim(path)?;
        }

        if let Some(proxy) = &self.proxy {
            claim(&proxy.path_prefix)?;
            let prefix = proxy.path_prefix.trim_end_matches('/');
            let shadowed = routes.iter().find(|path| {
                path.strip_prefix(prefix)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            });
            if let Some(path) = shadowed {
                return Err(ValidationError::ShadowedByProxy(path.to_string()));
            }
        }

        let kinds = self.dispatcher_kinds();
        if kinds.contains(&DispatcherKind::Cas) && self.cas.is_none() {
            return Err(ValidationError::CasNotConfigured);
        }
        if kinds.contains(&DispatcherKind::FoundationalApi)
            && self.security.foundational_api_key_file.is_none()
        {
            return Err(ValidationError::FoundationalKeyMissing);
        }

        self.security.validate()
    }

    /// Every dispatcher kind referenced by a mount, the proxy or the upload endpoint.
    pub fn dispatcher_kinds(&self) -> HashSet<DispatcherKind> {
        let mut kinds: HashSet<DispatcherKind> = self.mounts.iter().map(|m| m.kind).collect();
        if let Some(proxy) = &self.proxy {
            kinds.insert(proxy.kind);
        }
        if self.upload.is_some() {
            kinds.insert(DispatcherKind::DataApi);
        }
        kinds
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Keystore and credential settings for the authenticating connectors.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SecurityConfig {
    #[serde(default)]
    pub enabled: bool,
    pub keystore_path: Option<PathBuf>,
    pub keystore_type: Option<String>,
    pub keystore_password: Option<String>,
    pub signing_key_alias: Option<String>,
    pub signing_key_password: Option<String>,
    pub encrypting_key_alias: Option<String>,
    pub foundational_api_key_file: Option<PathBuf>,
    /// Username sent to the foundational API when security is disabled
    pub default_username: Option<String>,
    /// Fetch assertions through the loopback interface instead of the
    /// host named in the assertion URL
    #[serde(default)]
    pub use_loopback_interface: bool,
    /// Identity attached to requests without a session while security is disabled
    pub development_identity: Option<DevelopmentIdentity>,
}

impl SecurityConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled {
            self.keystore_source()?;
        }
        Ok(())
    }

    /// The keystore settings, all of which must be present.
    pub fn keystore_source(&self) -> Result<KeystoreSource, ValidationError> {
        fn required<T: Clone>(value: &Option<T>, name: &'static str) -> Result<T, ValidationError> {
            value
                .clone()
                .ok_or(ValidationError::MissingSecurityProperty(name))
        }

        Ok(KeystoreSource {
            path: required(&self.keystore_path, "keystore_path")?,
            keystore_type: required(&self.keystore_type, "keystore_type")?,
            password: required(&self.keystore_password, "keystore_password")?,
            signing_alias: required(&self.signing_key_alias, "signing_key_alias")?,
            signing_password: required(&self.signing_key_password, "signing_key_password")?,
            encrypting_alias: required(&self.encrypting_key_alias, "encrypting_key_alias")?,
        })
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DevelopmentIdentity {
    pub principal: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub idle_timeout_secs: u64,
    pub max_sessions: u64,
    /// Endpoint the identity provider redirects to after login
    pub init_path: String,
    pub logout_path: String,
    /// Where the browser lands once the session is initialized
    pub initial_page: String,
    pub logout_redirect: Option<String>,
    /// Marks the session cookie `Secure`. Only turn off for plain-HTTP
    /// development setups.
    pub secure_cookie: bool,
    pub headers: IdentityHeaders,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            cookie_name: "WORKBENCH_SESSION".into(),
            idle_timeout_secs: 30 * 60,
            max_sessions: 100_000,
            init_path: "/session/init".into(),
            logout_path: "/session/logout".into(),
            initial_page: "/".into(),
            logout_redirect: None,
            secure_cookie: true,
            headers: IdentityHeaders::default(),
        }
    }
}

/// Names of the headers the fronting identity provider injects.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityHeaders {
    pub assertion_count: String,
    /// Numbered with two digits starting at 01
    pub assertion_url_prefix: String,
    pub principal: String,
    pub username: String,
    pub email: String,
    pub proxy_granting_ticket: String,
}

impl Default for IdentityHeaders {
    fn default() -> Self {
        IdentityHeaders {
            assertion_count: "Shib-Assertion-Count".into(),
            assertion_url_prefix: "Shib-Assertion-".into(),
            principal: "eppn".into(),
            username: "uid".into(),
            email: "mail".into(),
            proxy_granting_ticket: "Cas-Proxy-Granting-Ticket".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Mount {
    pub path: String,
    pub kind: DispatcherKind,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// Requests under this prefix are forwarded to the service named by the
    /// remaining path
    pub path_prefix: String,
    #[serde(default = "default_proxy_kind")]
    pub kind: DispatcherKind,
}

fn default_proxy_kind() -> DispatcherKind {
    DispatcherKind::Unsecured
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UploadConfig {
    pub path: String,
    /// Same upload handling, with `"success": "true"` added to the summary
    pub make_public_path: Option<String>,
    /// Logical service returning the user's home directory
    pub home_dir_service: String,
    /// Logical service accepting the multipart upload
    pub file_upload_service: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CasConfig {
    pub server_url: Url,
}
