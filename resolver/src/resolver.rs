use crate::interpolation::{InterpolationError, interpolate};
use crate::metrics_defs::{ADDRESS_PASSTHROUGH, ADDRESS_RESOLVED, ADDRESS_UNRESOLVABLE};
use shared::counter;
use std::collections::HashMap;

const PREFIX_KEY: &str = "prefix";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ResolverError {
    #[error("alias table has no `prefix` entry")]
    MissingPrefix,
    #[error("invalid alias table: {0}")]
    Interpolation(#[from] InterpolationError),
    #[error("unable to resolve service name: {service_name}")]
    Unresolvable { service_name: String },
}

/// Maps logical service names to backend URLs.
///
/// Addresses that start with the configured prefix are treated as logical
/// names and must be present in the alias table. Everything else is assumed
/// to already be a URL and is returned unchanged.
#[derive(Debug)]
pub struct ServiceCallResolver {
    prefix: String,
    aliases: HashMap<String, String>,
}

impl ServiceCallResolver {
    pub fn new(properties: HashMap<String, String>) -> Result<Self, ResolverError> {
        let prefix = match properties.get(PREFIX_KEY) {
            Some(p) if !p.is_empty() => p.clone(),
            _ => return Err(ResolverError::MissingPrefix),
        };

        let aliases = interpolate(&properties)?;
        tracing::debug!(prefix = %prefix, entries = aliases.len(), "loaded alias table");

        Ok(ServiceCallResolver { prefix, aliases })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn resolve_address(&self, address: &str) -> Result<String, ResolverError> {
        if !address.starts_with(&self.prefix) {
            counter!(ADDRESS_PASSTHROUGH).increment(1);
            return Ok(address.to_string());
        }

        let (service_name, query) = match address.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (address, None),
        };

        let Some(url) = self.aliases.get(service_name) else {
            counter!(ADDRESS_UNRESOLVABLE).increment(1);
            tracing::warn!(service_name, "unresolvable service name");
            return Err(ResolverError::Unresolvable {
                service_name: service_name.to_string(),
            });
        };

        counter!(ADDRESS_RESOLVED).increment(1);
        Ok(match query {
            Some(query) => format!("{url}?{query}"),
            None => url.clone(),
        })
    }
}
