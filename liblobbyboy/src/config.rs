// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{collections::HashMap, fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::instrument;

use crate::duration;

/// Reads and parses the config file fresh off disk. The daemon's
/// authentication plugin calls this on every single auth attempt
/// (rather than caching a parsed `Config`) so that an operator can
/// add or revoke a user's authorized key without restarting lobbyboy.
#[instrument(skip_all)]
pub fn read_config(config_path: &str) -> anyhow::Result<Config> {
    let config_str = fs::read_to_string(config_path)
        .with_context(|| format!("reading config toml at {}", config_path))?;
    let config: Config = toml::from_str(&config_str).context("parsing config file")?;
    config.validate()?;
    Ok(config)
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Address lobbyboy listens for incoming ssh connections on,
    /// e.g. "0.0.0.0:2222".
    pub listen_addr: String,

    /// Directory lobbyboy stores its host key, per-provider workspaces
    /// and the server registry file under.
    pub data_dir: PathBuf,

    /// Basename of the json file, relative to data_dir, the server
    /// registry is persisted to. Defaults to "available_servers.json".
    #[serde(default = "default_servers_file")]
    pub servers_file: String,

    /// How often the reaper wakes up to sweep the registry looking for
    /// servers to destroy. Accepts the same duration literals as
    /// min_life_to_live. Defaults to "1m".
    #[serde(default = "default_min_destroy_interval")]
    pub min_destroy_interval: String,

    /// tracing level: "trace", "debug", "info", "warn" or "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Users allowed to authenticate, keyed by ssh username.
    #[serde(default)]
    pub user: HashMap<String, UserConfig>,

    /// Configured backend providers, keyed by a name the user selects
    /// from the create-a-new-server menu.
    #[serde(default)]
    pub provider: HashMap<String, ProviderConfig>,
}

fn default_servers_file() -> String {
    "available_servers.json".to_string()
}

fn default_min_destroy_interval() -> String {
    "1m".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        duration::parse(&self.min_destroy_interval)
            .with_context(|| format!("invalid min_destroy_interval '{}'", self.min_destroy_interval))?;
        for (name, p) in self.provider.iter() {
            p.validate().with_context(|| format!("invalid config for provider '{}'", name))?;
        }
        Ok(())
    }

    pub fn servers_file_path(&self) -> PathBuf {
        self.data_dir.join(&self.servers_file)
    }

    pub fn min_destroy_interval(&self) -> std::time::Duration {
        // validated at load time, so this can't fail
        duration::parse(&self.min_destroy_interval).unwrap_or(std::time::Duration::from_secs(60))
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct UserConfig {
    /// Newline-separated `authorized_keys`-format public key lines.
    pub authorized_keys: Option<String>,

    /// Plaintext password, compared verbatim against the presented
    /// password. Absent means password auth always fails for this user.
    pub password: Option<String>,
}

impl UserConfig {
    /// Yields each non-blank line of `authorized_keys` paired with its
    /// declared key type (e.g. "ssh-rsa", "ssh-ed25519").
    pub fn authorized_key_lines(&self) -> impl Iterator<Item = &str> {
        self.authorized_keys
            .as_deref()
            .into_iter()
            .flat_map(|s| s.lines())
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProviderConfig {
    /// Whether this provider is offered in the create-a-new-server menu.
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Minimum amount of time a server must live, regardless of billing
    /// cycle, before the reaper is willing to destroy it. "0" disables
    /// the billing-cycle check entirely and allows immediate destruction.
    pub min_life_to_live: String,

    /// The provider's billing granularity, e.g. "1h" for a provider that
    /// bills by the hour.
    #[serde(default = "default_bill_time_unit")]
    pub bill_time_unit: String,

    /// How long before the end of a billing cycle the reaper insists on
    /// leaving as a safety margin before it will destroy a server.
    #[serde(default = "default_destroy_safe_time")]
    pub destroy_safe_time: String,

    /// Prefix prepended to generated server names for this provider.
    pub server_name_prefix: Option<String>,

    /// API token used to authenticate against the provider's API.
    /// Providers also accept a same-named environment variable override.
    pub api_token: Option<String>,

    /// Extra public keys, in authorized_keys format, injected into
    /// every server this provider creates (in addition to the
    /// freshly minted per-server key pair).
    #[serde(default)]
    pub extra_ssh_keys: Vec<String>,

    /// Any provider-specific settings not modeled above; concrete
    /// Provider implementations are free to deserialize this further.
    #[serde(flatten)]
    pub extra: HashMap<String, toml::Value>,
}

fn default_true() -> bool {
    true
}

fn default_bill_time_unit() -> String {
    "1h".to_string()
}

fn default_destroy_safe_time() -> String {
    "0".to_string()
}

impl ProviderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        duration::parse(&self.min_life_to_live).context("invalid min_life_to_live")?;
        duration::parse(&self.bill_time_unit).context("invalid bill_time_unit")?;
        duration::parse(&self.destroy_safe_time).context("invalid destroy_safe_time")?;
        Ok(())
    }
}
