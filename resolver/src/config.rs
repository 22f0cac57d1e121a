use crate::resolver::{ResolverError, ServiceCallResolver};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read alias file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse alias file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
}

/// Alias table configuration.
///
/// Entries may be given inline, in a separate flat YAML file, or both. Inline
/// entries take precedence over entries read from the file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    pub aliases_file: Option<PathBuf>,
}

impl Config {
    pub fn load_aliases(&self) -> Result<HashMap<String, String>, ConfigError> {
        let mut aliases = match &self.aliases_file {
            Some(path) => {
                let file = File::open(path)?;
                serde_yaml::from_reader::<_, HashMap<String, String>>(file)?
            }
            None => HashMap::new(),
        };

        aliases.extend(
            self.aliases
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        Ok(aliases)
    }

    pub fn build_resolver(&self) -> Result<ServiceCallResolver, ConfigError> {
        Ok(ServiceCallResolver::new(self.load_aliases()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn test_inline_aliases() {
        let yaml = r#"
aliases:
    prefix: org.iplantc.services
    org.iplantc.services.jobs.list: "http://jobs.internal/list"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let resolver = config.build_resolver().unwrap();
        assert_eq!(
            resolver
                .resolve_address("org.iplantc.services.jobs.list?limit=5")
                .unwrap(),
            "http://jobs.internal/list?limit=5"
        );
    }

    #[test]
    fn test_file_aliases_with_inline_override() {
        let file = write_tmp_file(
            r#"
prefix: org.iplantc.services
data.host: data.internal
org.iplantc.services.data.home: "http://${data.host}/home"
"#,
        );
        let config = Config {
            aliases: HashMap::from([("data.host".to_string(), "data.staging".to_string())]),
            aliases_file: Some(file.path().to_path_buf()),
        };

        let resolver = config.build_resolver().unwrap();
        assert_eq!(
            resolver
                .resolve_address("org.iplantc.services.data.home")
                .unwrap(),
            "http://data.staging/home"
        );
    }

    #[test]
    fn test_missing_alias_file() {
        let config = Config {
            aliases: HashMap::new(),
            aliases_file: Some("/nonexistent/aliases.yaml".into()),
        };
        assert!(matches!(config.build_resolver(), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_missing_prefix() {
        let config = Config::default();
        assert!(matches!(
            config.build_resolver(),
            Err(ConfigError::Resolver(ResolverError::MissingPrefix))
        ));
    }
}
