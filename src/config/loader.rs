use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use std::path::Path;

use super::schema::EndpointConfig;
use crate::error::{ConfigError, Result};

const ENV_PREFIX: &str = "WIRECALL_";

pub const SUPPORTED_NETWORKS: &[&str] = &["tcp", "tcp4", "tcp6", "unix"];

fn base() -> Figment {
    Figment::from(Serialized::defaults(EndpointConfig::default()))
}

pub async fn load_from_env_or_file() -> Result<EndpointConfig> {
    let config: EndpointConfig = base()
        .merge(Toml::file("wirecall.toml"))
        .merge(Json::file("wirecall.json"))
        .merge(Yaml::file("wirecall.yaml"))
        .merge(Yaml::file("wirecall.yml"))
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<EndpointConfig> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => base().merge(Toml::file(path)),
        Some("json") => base().merge(Json::file(path)),
        Some("yaml") | Some("yml") => base().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into());
        }
    };

    let config: EndpointConfig = figment
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &EndpointConfig) -> Result<()> {
    if !SUPPORTED_NETWORKS.contains(&config.network.as_str()) {
        return Err(ConfigError::Validation(format!(
            "Unsupported network '{}', expected one of {:?}",
            config.network, SUPPORTED_NETWORKS
        ))
        .into());
    }

    #[cfg(not(unix))]
    if config.network == "unix" {
        return Err(
            ConfigError::Validation("unix sockets are not available on this platform".into())
                .into(),
        );
    }

    if config.listen_address.trim().is_empty() {
        return Err(ConfigError::Validation("Listen address must not be empty".into()).into());
    }

    if config.max_message_size == 0 {
        return Err(
            ConfigError::Validation("Max message size must be greater than 0".into()).into(),
        );
    }

    if config.max_concurrent_handlers == 0 {
        return Err(ConfigError::Validation(
            "Max concurrent handlers must be greater than 0".into(),
        )
        .into());
    }

    if config.default_body_codec.trim().is_empty() {
        return Err(ConfigError::Validation("Default body codec must be set".into()).into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use std::io::Write;

    fn write_config(ext: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(&format!(".{ext}"))
            .tempfile()
            .unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_load_toml_with_defaults() {
        let file = write_config(
            "toml",
            r#"
listenAddress = "127.0.0.1:0"
redialTimes = -1
slowCometDurationMs = 250

[logging]
level = "debug"
"#,
        );
        let config = load_from_path(file.path()).await.unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:0");
        assert_eq!(config.redial_times, -1);
        assert_eq!(config.slow_comet_duration_ms, 250);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.network, "tcp");
        assert_eq!(config.default_body_codec, "json");
        assert_eq!(config.redial_interval_ms, 100);
        assert!(config.session_age().is_none());
    }

    #[tokio::test]
    async fn test_load_json() {
        let file = write_config(
            "json",
            r#"{"network": "tcp4", "defaultContextAgeMs": 1500, "printDetail": true}"#,
        );
        let config = load_from_path(file.path()).await.unwrap();
        assert_eq!(config.network, "tcp4");
        assert_eq!(config.context_age().map(|d| d.as_millis()), Some(1500));
        assert!(config.print_detail);
    }

    #[tokio::test]
    async fn test_rejects_unknown_extension() {
        let file = write_config("ini", "network = tcp");
        let err = load_from_path(file.path()).await.unwrap_err();
        assert!(matches!(err, RpcError::Config(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate() {
        assert!(validate(&EndpointConfig::default()).is_ok());

        let bad_network = EndpointConfig {
            network: "sctp".into(),
            ..Default::default()
        };
        assert!(validate(&bad_network).is_err());

        let empty_listen = EndpointConfig {
            listen_address: " ".into(),
            ..Default::default()
        };
        assert!(validate(&empty_listen).is_err());

        let zero_size = EndpointConfig {
            max_message_size: 0,
            ..Default::default()
        };
        assert!(validate(&zero_size).is_err());

        let zero_handlers = EndpointConfig {
            max_concurrent_handlers: 0,
            ..Default::default()
        };
        assert!(validate(&zero_handlers).is_err());
    }
}
