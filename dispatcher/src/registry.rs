use crate::assertion::{AssertionBuilder, AssertionUrlProbe, SignedAssertionBuilder};
use crate::cas::{CasError, CasServerTicketSource, ProxyTicketSource};
use crate::config::{Config, DispatcherKind, ValidationError};
use crate::connectors::{
    AuthenticatedConnector, AuthenticationValidatingConnector, CasConnector, DataApiConnector,
    FoundationalApiConnector, UnauthenticatedConnector, UrlConnector,
};
use crate::dispatch::{AppendUserPart, DispatchHooks, Dispatcher, InjectJsonUser, PassThrough};
use crate::keys::KeyLoader;
use crate::token::{FoundationalApiTokenGenerator, TokenError};
use resolver::ServiceCallResolver;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("unable to load the foundational API key: {0}")]
    Token(#[from] TokenError),
    #[error("unable to configure the CAS client: {0}")]
    Cas(#[from] CasError),
    #[error("unable to build the HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// The dispatchers used by the configured endpoints, one per kind.
pub struct Dispatchers {
    by_kind: HashMap<DispatcherKind, Arc<Dispatcher>>,
    keys: Option<Arc<KeyLoader>>,
}

impl Dispatchers {
    /// Builds only the kinds the configuration refers to, so credentials for
    /// unused kinds are never required.
    pub fn from_config(
        config: &Config,
        resolver: Arc<ServiceCallResolver>,
    ) -> Result<Self, RegistryError> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let security = &config.security;

        let mut keys = None;
        let mut by_kind = HashMap::new();

        for kind in config.dispatcher_kinds() {
            let (connector, hooks): (Arc<dyn UrlConnector>, Arc<dyn DispatchHooks>) = match kind {
                DispatcherKind::Secured => {
                    let assertions: Option<Arc<dyn AssertionBuilder>> = if security.enabled {
                        let loader = Arc::new(KeyLoader::new(security.keystore_source()?));
                        keys = Some(loader.clone());
                        let probe =
                            AssertionUrlProbe::new(security.use_loopback_interface, timeout)?;
                        Some(Arc::new(SignedAssertionBuilder::new(loader, probe)))
                    } else {
                        None
                    };
                    (
                        Arc::new(AuthenticatedConnector::new(assertions)),
                        Arc::new(PassThrough),
                    )
                }
                DispatcherKind::Unsecured => {
                    (Arc::new(UnauthenticatedConnector), Arc::new(PassThrough))
                }
                DispatcherKind::AuthenticatedJson => {
                    (Arc::new(UnauthenticatedConnector), Arc::new(InjectJsonUser))
                }
                DispatcherKind::DataApi => (Arc::new(DataApiConnector), Arc::new(AppendUserPart)),
                DispatcherKind::Cas => {
                    let server_url = &config
                        .cas
                        .as_ref()
                        .ok_or(ValidationError::CasNotConfigured)?
                        .server_url;
                    let tickets: Arc<dyn ProxyTicketSource> =
                        Arc::new(CasServerTicketSource::new(server_url, timeout)?);
                    (Arc::new(CasConnector::new(tickets)), Arc::new(PassThrough))
                }
                DispatcherKind::FoundationalApi => {
                    let tokens = FoundationalApiTokenGenerator::from_key_file(
                        security.foundational_api_key_file.as_deref(),
                    )?;
                    let connector = FoundationalApiConnector::new(
                        Arc::new(tokens),
                        security.enabled,
                        security.default_username.clone(),
                    );
                    (Arc::new(connector), Arc::new(PassThrough))
                }
                DispatcherKind::AuthenticationValidating => (
                    Arc::new(AuthenticationValidatingConnector),
                    Arc::new(PassThrough),
                ),
            };

            tracing::debug!(
                kind = kind.as_str(),
                connector = connector.name(),
                "configured dispatcher"
            );
            let dispatcher = Dispatcher::new(kind, resolver.clone(), connector, hooks, client.clone());
            by_kind.insert(kind, Arc::new(dispatcher));
        }

        Ok(Dispatchers { by_kind, keys })
    }

    pub fn get(&self, kind: DispatcherKind) -> Option<Arc<Dispatcher>> {
        self.by_kind.get(&kind).cloned()
    }

    /// The key loader of the secured dispatcher, when security is enabled.
    pub fn key_loader(&self) -> Option<&Arc<KeyLoader>> {
        self.keys.as_ref()
    }

    /// Ready once every dispatcher can sign requests, i.e. the keystore (if
    /// any) has loaded.
    pub fn readiness(&self) -> impl Fn() -> bool + Send + Sync + use<> {
        let keys = self.keys.clone();
        move || keys.as_ref().is_none_or(|loader| loader.is_loaded())
    }

    /// Loads the keystore in the background, retrying until it succeeds, so
    /// readiness does not wait for the first signed call.
    pub fn preload_keys(&self, retry_interval: Duration) {
        let Some(loader) = self.keys.clone() else {
            return;
        };
        tokio::spawn(async move {
            while let Err(e) = loader.get().await {
                tracing::error!(error = %e, "unable to load the keystore");
                tokio::time::sleep(retry_interval).await;
            }
            tracing::info!("keystore loaded");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CasConfig, Mount, SecurityConfig};
    use crate::testutils::write_test_keystore;
    use crate::token::write_key_file;

    fn base_config() -> Config {
        serde_yaml::from_str(
            r#"
listener:
    host: "127.0.0.1"
    port: 8080
admin_listener:
    host: "127.0.0.1"
    port: 8081
services:
    aliases:
        prefix: org.iplantc.services
"#,
        )
        .unwrap()
    }

    fn resolver(config: &Config) -> Arc<ServiceCallResolver> {
        Arc::new(config.services.build_resolver().unwrap())
    }

    fn mount(path: &str, kind: DispatcherKind) -> Mount {
        Mount {
            path: path.into(),
            kind,
        }
    }

    #[test]
    fn test_builds_only_mounted_kinds() {
        let mut config = base_config();
        config.mounts = vec![
            mount("/rpc", DispatcherKind::Unsecured),
            mount("/rpc/json", DispatcherKind::AuthenticatedJson),
        ];

        let dispatchers = Dispatchers::from_config(&config, resolver(&config)).unwrap();
        assert_eq!(
            dispatchers.get(DispatcherKind::Unsecured).unwrap().kind(),
            DispatcherKind::Unsecured
        );
        assert_eq!(
            dispatchers
                .get(DispatcherKind::AuthenticatedJson)
                .unwrap()
                .connector()
                .name(),
            "unauthenticated"
        );
        // The foundational key file is only needed when that kind is mounted.
        assert!(dispatchers.get(DispatcherKind::FoundationalApi).is_none());
        assert!(dispatchers.key_loader().is_none());
    }

    #[test]
    fn test_secured_with_security_enabled_shares_key_loader() {
        let mut config = base_config();
        config.mounts = vec![mount("/rpc/secured", DispatcherKind::Secured)];
        config.security = SecurityConfig {
            enabled: true,
            keystore_path: Some("/nonexistent/keystore.json".into()),
            keystore_type: Some(crate::keys::KEYSTORE_TYPE.into()),
            keystore_password: Some("changeit".into()),
            signing_key_alias: Some("signing".into()),
            signing_key_password: Some("changeit".into()),
            encrypting_key_alias: Some("encrypting".into()),
            ..Default::default()
        };

        // Keys load lazily, so a missing keystore does not fail startup.
        let dispatchers = Dispatchers::from_config(&config, resolver(&config)).unwrap();
        let loader = dispatchers.key_loader().unwrap();
        assert!(!loader.is_loaded());
        assert!(!dispatchers.readiness()());
        assert_eq!(
            dispatchers
                .get(DispatcherKind::Secured)
                .unwrap()
                .connector()
                .name(),
            "authenticated"
        );
    }

    #[tokio::test]
    async fn test_ready_once_keystore_loads() {
        let (_dir, fixture) = write_test_keystore();
        let mut config = base_config();
        config.mounts = vec![mount("/rpc/secured", DispatcherKind::Secured)];
        let source = fixture.source();
        config.security = SecurityConfig {
            enabled: true,
            keystore_path: Some(source.path),
            keystore_type: Some(source.keystore_type),
            keystore_password: Some(source.password),
            signing_key_alias: Some(source.signing_alias),
            signing_key_password: Some(source.signing_password),
            encrypting_key_alias: Some(source.encrypting_alias),
            ..Default::default()
        };

        let dispatchers = Dispatchers::from_config(&config, resolver(&config)).unwrap();
        let is_ready = dispatchers.readiness();
        assert!(!is_ready());

        dispatchers.preload_keys(Duration::from_millis(10));
        for _ in 0..500 {
            if is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(is_ready());
    }

    #[test]
    fn test_ready_without_security() {
        let mut config = base_config();
        config.mounts = vec![mount("/rpc/secured", DispatcherKind::Secured)];
        let dispatchers = Dispatchers::from_config(&config, resolver(&config)).unwrap();
        assert!(dispatchers.readiness()());
    }

    #[test]
    fn test_foundational_key_loaded_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("foundational.key");

        let mut config = base_config();
        config.mounts = vec![mount("/rpc/foundational", DispatcherKind::FoundationalApi)];
        config.security.foundational_api_key_file = Some(key_file.clone());

        assert!(matches!(
            Dispatchers::from_config(&config, resolver(&config)),
            Err(RegistryError::Token(TokenError::Io { .. }))
        ));

        write_key_file(&key_file).unwrap();
        assert!(Dispatchers::from_config(&config, resolver(&config)).is_ok());
    }

    #[test]
    fn test_upload_implies_data_api() {
        let mut config = base_config();
        config.upload = Some(crate::config::UploadConfig {
            path: "/upload".into(),
            make_public_path: None,
            home_dir_service: "org.iplantc.services.home".into(),
            file_upload_service: "org.iplantc.services.upload".into(),
        });
        config.cas = Some(CasConfig {
            server_url: "https://cas.example.org/cas".parse().unwrap(),
        });

        let dispatchers = Dispatchers::from_config(&config, resolver(&config)).unwrap();
        assert!(dispatchers.get(DispatcherKind::DataApi).is_some());
        assert!(dispatchers.get(DispatcherKind::Cas).is_none());
    }
}
