use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Build-time template variables are read from `FLEETING_VAR_<NAME>` (name lowercased).
const VAR_PREFIX: &str = "FLEETING_VAR_";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("environment variable {0} is not defined")]
    Missing(String),
    #[error("environment variable {name} has an invalid value: {value}")]
    Invalid { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Redis { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsSettings {
    pub region: String,
    pub availability_zones: Vec<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Process configuration, resolved once at startup and handed to whoever needs it.
#[derive(Debug, Clone)]
pub struct Settings {
    pub projects_dir: PathBuf,
    pub cache: CacheBackend,
    pub cache_ttl: Duration,
    pub git_base_url: String,
    pub probe_concurrency: usize,
    pub default_instance_type: String,
    pub bind_addr: String,
    pub key_name: String,
    pub security_groups: Vec<String>,
    pub notify_topic: Option<String>,
    pub build_vars: BTreeMap<String, String>,
    pub provider: String,
    pub aws: AwsSettings,
}

impl Settings {
    /// Read from the process environment, after loading `.env` if there is one.
    pub fn from_env() -> Result<Self, SettingsError> {
        dotenv::dotenv().ok();
        let vars: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_lookup(|name| vars.get(name).cloned(), vars.keys().cloned())
    }

    /// Build from an arbitrary lookup; `names` lists every defined variable so
    /// `FLEETING_VAR_*` entries can be discovered.
    pub fn from_lookup<F, I>(lookup: F, names: I) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
        I: IntoIterator<Item = String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require =
            |name: &str| get(name).ok_or_else(|| SettingsError::Missing(name.to_string()));
        let number = |name: &str, default: u64| -> Result<u64, SettingsError> {
            match get(name) {
                None => Ok(default),
                Some(raw) => raw.parse().map_err(|_| SettingsError::Invalid {
                    name: name.to_string(),
                    value: raw,
                }),
            }
        };

        let cache = match get("FLEETING_CACHE").as_deref() {
            None | Some("memory") => CacheBackend::Memory,
            Some("redis") => CacheBackend::Redis {
                url: get("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            },
            Some(other) => {
                return Err(SettingsError::Invalid {
                    name: "FLEETING_CACHE".to_string(),
                    value: other.to_string(),
                })
            }
        };

        let provider = get("PROVIDER").unwrap_or_else(|| "aws".to_string()).to_lowercase();
        let region = get("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string());
        let availability_zones = match get("AWS_AVAILABILITY_ZONES") {
            Some(raw) => split_list(&raw),
            None => vec![format!("{}a", region)],
        };
        let (access_key_id, secret_access_key) = if provider == "aws" {
            (
                Some(require("AWS_ACCESS_KEY_ID")?),
                Some(require("AWS_SECRET_ACCESS_KEY")?),
            )
        } else {
            (get("AWS_ACCESS_KEY_ID"), get("AWS_SECRET_ACCESS_KEY"))
        };

        let build_vars = names
            .into_iter()
            .filter_map(|name| {
                let var = name.strip_prefix(VAR_PREFIX)?.to_lowercase();
                let value = lookup(&name)?;
                (!var.is_empty()).then_some((var, value))
            })
            .collect();

        let probe_concurrency = number("FLEETING_PROBE_CONCURRENCY", 4)?.max(1);

        Ok(Self {
            projects_dir: PathBuf::from(
                get("FLEETING_PROJECTS_DIR").unwrap_or_else(|| "projects".to_string()),
            ),
            cache,
            cache_ttl: Duration::from_secs(number("FLEETING_CACHE_TTL_SECS", 3600)?),
            git_base_url: get("FLEETING_GIT_BASE_URL")
                .unwrap_or_else(|| "https://github.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            probe_concurrency: usize::try_from(probe_concurrency).unwrap_or(usize::MAX),
            default_instance_type: get("FLEETING_DEFAULT_INSTANCE_TYPE")
                .unwrap_or_else(|| "t1.micro".to_string()),
            bind_addr: get("FLEETING_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8001".to_string()),
            key_name: require("AWS_KEY_NAME")?,
            security_groups: split_list(&require("AWS_SECURITY_GROUP")?),
            notify_topic: get("AWS_NOTIFY_TOPIC"),
            build_vars,
            provider,
            aws: AwsSettings {
                region,
                availability_zones,
                access_key_id,
                secret_access_key,
            },
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, SettingsError> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|name| map.get(name).cloned(), map.keys().cloned())
    }

    const MINIMAL_MOCK: &[(&str, &str)] = &[
        ("PROVIDER", "mock"),
        ("AWS_KEY_NAME", "fleeting"),
        ("AWS_SECURITY_GROUP", "web, ssh"),
    ];

    #[test]
    fn defaults() {
        let s = settings(MINIMAL_MOCK).unwrap();
        assert_eq!(s.cache, CacheBackend::Memory);
        assert_eq!(s.cache_ttl, Duration::from_secs(3600));
        assert_eq!(s.git_base_url, "https://github.com");
        assert_eq!(s.probe_concurrency, 4);
        assert_eq!(s.default_instance_type, "t1.micro");
        assert_eq!(s.security_groups, vec!["web".to_string(), "ssh".to_string()]);
        assert_eq!(s.aws.availability_zones, vec!["us-east-1a".to_string()]);
        assert!(s.notify_topic.is_none());
    }

    #[test]
    fn missing_required_variable_is_named() {
        let err = settings(&[("PROVIDER", "mock"), ("AWS_SECURITY_GROUP", "sg")]).unwrap_err();
        assert_eq!(err.to_string(), "environment variable AWS_KEY_NAME is not defined");

        let err = settings(&[("AWS_KEY_NAME", "k"), ("AWS_SECURITY_GROUP", "sg")]).unwrap_err();
        assert_eq!(err, SettingsError::Missing("AWS_ACCESS_KEY_ID".into()));
    }

    #[test]
    fn redis_backend_selection() {
        let mut pairs = MINIMAL_MOCK.to_vec();
        pairs.push(("FLEETING_CACHE", "redis"));
        assert_eq!(
            settings(&pairs).unwrap().cache,
            CacheBackend::Redis {
                url: "redis://localhost:6379".into()
            }
        );
        pairs.push(("REDIS_URL", "redis://cache:6380/2"));
        assert_eq!(
            settings(&pairs).unwrap().cache,
            CacheBackend::Redis {
                url: "redis://cache:6380/2".into()
            }
        );

        let mut pairs = MINIMAL_MOCK.to_vec();
        pairs.push(("FLEETING_CACHE", "memcached"));
        assert!(matches!(settings(&pairs), Err(SettingsError::Invalid { .. })));
    }

    #[test]
    fn collects_build_vars_and_rejects_bad_numbers() {
        let mut pairs = MINIMAL_MOCK.to_vec();
        pairs.push(("FLEETING_VAR_PERSONA_URL", "https://login.example.org"));
        let s = settings(&pairs).unwrap();
        assert_eq!(
            s.build_vars.get("persona_url").map(String::as_str),
            Some("https://login.example.org")
        );

        pairs.push(("FLEETING_CACHE_TTL_SECS", "soon"));
        assert!(matches!(
            settings(&pairs).unwrap_err(),
            SettingsError::Invalid { .. }
        ));
    }
}
