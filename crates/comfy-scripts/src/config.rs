use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use comfyui_api::PollSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use model_fetch::Credentials;
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// System wide configuration file.
pub const SYSTEM_CONFIG: &str = "/etc/comfy-scripts/config.toml";
/// Configuration file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "comfy-scripts.toml";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the ComfyUI server.
    pub url: String,
    /// Where downloaded images are written.
    pub output_dir: PathBuf,
    /// Root of the ComfyUI models tree.
    pub models_dir: PathBuf,
    pub poll: PollConfig,
    pub optimizer: OptimizerConfig,
    pub hf_token: Option<String>,
    pub civitai_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "http://localhost:8188".to_owned(),
            output_dir: PathBuf::from("outputs"),
            models_dir: PathBuf::from("ComfyUI/models"),
            poll: PollConfig::default(),
            optimizer: OptimizerConfig::default(),
            hf_token: None,
            civitai_api_key: None,
            openrouter_api_key: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub submit_attempts: u32,
    pub retry_delay_secs: u64,
    pub concurrency: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        let settings = PollSettings::default();
        Self {
            interval_secs: settings.interval.as_secs(),
            timeout_secs: settings.timeout.as_secs(),
            submit_attempts: settings.submit_attempts,
            retry_delay_secs: settings.retry_delay.as_secs(),
            concurrency: settings.concurrency,
        }
    }
}

impl PollConfig {
    pub fn settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            submit_attempts: self.submit_attempts,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            concurrency: self.concurrency,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct OptimizerConfig {
    /// OpenAI compatible chat completions endpoint.
    pub endpoint: String,
    pub model: String,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://openrouter.ai/api/v1/chat/completions".to_owned(),
            model: "anthropic/claude-3.5-sonnet".to_owned(),
        }
    }
}

impl Config {
    /// Layers defaults, config files and the environment.
    ///
    /// `path` replaces the config file in the working directory.
    pub fn figment(path: Option<&Path>) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(SYSTEM_CONFIG))
            .merge(Toml::file(path.unwrap_or(Path::new(LOCAL_CONFIG))))
            .merge(Env::prefixed("COMFY_").split("__"))
            .merge(Env::raw().only(&["HUGGINGFACE_TOKEN"]).map(|_| "hf_token".into()))
            .merge(Env::raw().only(&["CIVITAI_API_KEY"]).map(|_| "civitai_api_key".into()))
            .merge(
                Env::raw()
                    .only(&["OPENROUTER_API_KEY"])
                    .map(|_| "openrouter_api_key".into()),
            )
    }

    /// Loads the configuration.
    ///
    /// # Errors
    ///
    /// Fails if an explicitly given file does not exist or any layer holds
    /// values of the wrong type.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            if !path.is_file() {
                bail!("Config file {} not found", path.display());
            }
        }
        Self::figment(path)
            .extract()
            .context("Invalid configuration")
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            hf_token: self.hf_token.clone(),
            civitai_api_key: self.civitai_api_key.clone(),
        }
    }
}

/// Resolves the server URL from the command line overrides.
///
/// `url` wins outright; `host` and `port` replace those parts of the
/// configured URL.
pub fn server_url(
    configured: &str,
    url: Option<&str>,
    host: Option<&str>,
    port: Option<u16>,
) -> anyhow::Result<String> {
    if let Some(url) = url {
        return Ok(url.to_owned());
    }
    if host.is_none() && port.is_none() {
        return Ok(configured.to_owned());
    }
    let mut url = Url::parse(configured)
        .with_context(|| format!("Invalid server URL {}", configured))?;
    if let Some(host) = host {
        url.set_host(Some(host))
            .with_context(|| format!("Invalid host {}", host))?;
    }
    if let Some(port) = port {
        url.set_port(Some(port))
            .map_err(|_| anyhow::anyhow!("Cannot set port on {}", configured))?;
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn test_defaults() {
        Jail::expect_with(|_| {
            let config: Config = Config::figment(None).extract()?;
            assert_eq!(config.url, "http://localhost:8188");
            assert_eq!(config.poll.settings(), PollSettings::default());
            assert_eq!(config.optimizer, OptimizerConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                LOCAL_CONFIG,
                r#"
                url = "http://gpu-box:8188"
                output_dir = "renders"

                [poll]
                timeout_secs = 600
                concurrency = 2
                "#,
            )?;
            jail.set_env("COMFY_POLL__INTERVAL_SECS", "5");
            jail.set_env("CIVITAI_API_KEY", "civ-key");

            let config: Config = Config::figment(None).extract()?;
            assert_eq!(config.url, "http://gpu-box:8188");
            assert_eq!(config.output_dir, PathBuf::from("renders"));
            assert_eq!(config.poll.timeout_secs, 600);
            assert_eq!(config.poll.interval_secs, 5);
            assert_eq!(config.poll.concurrency, 2);
            assert_eq!(config.poll.submit_attempts, 3);
            assert_eq!(config.civitai_api_key.as_deref(), Some("civ-key"));
            assert_eq!(config.credentials().civitai_api_key.as_deref(), Some("civ-key"));
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", r#"url = "http://from-file:8188""#)?;
            jail.set_env("COMFY_URL", "http://from-env:8188");

            let config: Config = Config::figment(Some(Path::new("custom.toml"))).extract()?;
            assert_eq!(config.url, "http://from-env:8188");
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_config() {
        Jail::expect_with(|_| {
            assert!(Config::load(Some(Path::new("missing.toml"))).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_server_url_overrides() {
        let configured = "http://localhost:8188";
        assert_eq!(
            server_url(configured, None, None, None).unwrap(),
            "http://localhost:8188"
        );
        assert_eq!(
            server_url(configured, Some("http://other:1"), Some("ignored"), None).unwrap(),
            "http://other:1"
        );
        assert_eq!(
            server_url(configured, None, Some("10.0.0.2"), Some(8189)).unwrap(),
            "http://10.0.0.2:8189/"
        );
    }
}
