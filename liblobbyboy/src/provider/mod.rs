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

//! The `Provider` capability every backend vm adapter implements, plus
//! a small registry of the configured set of them. lobbyboy's core
//! never looks past this trait: it has no notion of DigitalOcean,
//! Vultr or any other specific cloud, only of "a thing that can create
//! and destroy servers".

pub mod process;

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::Local;
use tracing::info;

use crate::{config::ProviderConfig, errors::Error, keys, registry::ServerMeta};

/// Something the orchestrator can send progress lines down while a
/// provider is busy creating or destroying a server. Implemented by
/// the live ssh channel during an interactive session, and by a no-op
/// sink when the reaper calls a provider with no attached client.
pub trait Progress: Send + Sync {
    fn send_line(&self, line: &str);
}

pub struct NullProgress;
impl Progress for NullProgress {
    fn send_line(&self, _line: &str) {}
}

/// The capability set a backend adapter implements. Every method here
/// is synchronous and potentially slow (creating a cloud vm can take
/// minutes) -- callers are expected to run these off the async runtime
/// via `tokio::task::spawn_blocking`.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn config(&self) -> &ProviderConfig;

    /// Provisions a brand new backend server, returning its metadata.
    /// May talk to `progress` to narrate what it's doing.
    fn create_server(&self, progress: &dyn Progress) -> anyhow::Result<ServerMeta>;

    /// Tears down a previously created server. `progress` is `None`
    /// when called from the reaper, rather than from a live session.
    fn destroy_server(&self, meta: &ServerMeta, progress: &dyn Progress) -> anyhow::Result<bool>;

    /// Builds the argv used to exec a child ssh process connecting to
    /// the given server.
    fn ssh_server_command(&self, meta: &ServerMeta) -> Vec<String> {
        let priv_key = meta.private_key_path();
        let mut command = vec![
            "ssh".to_string(),
            "-i".to_string(),
            priv_key.to_string_lossy().into_owned(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-p".to_string(),
            meta.server_port.to_string(),
            "-l".to_string(),
            meta.server_user.clone(),
        ];
        command.extend(meta.ssh_extra_args.iter().cloned());
        command.push(meta.server_host.clone());
        command
    }
}

/// Picks a server name of the form `<prefix>-<date>[a-z]`, trying
/// successive letter suffixes until an unused workspace directory is
/// found, matching the collision-avoidance scheme backend adapters in
/// the wild use to keep concurrently created servers from colliding.
pub fn generate_default_server_name(
    provider_name: &str,
    provider_config: &ProviderConfig,
    workspace_root: &Path,
) -> anyhow::Result<(String, PathBuf)> {
    let base = Local::now().format("%Y-%m-%d-%H%M").to_string();
    let base = match &provider_config.server_name_prefix {
        Some(prefix) => format!("{}-{}", prefix, base),
        None => base,
    };

    let suffixes = std::iter::once(String::new()).chain(('a'..='z').map(|c| c.to_string()));
    for suffix in suffixes {
        let candidate = format!("{}{}", base, suffix);
        let workspace = workspace_root.join(&candidate);
        if !workspace.exists() {
            fs::create_dir_all(&workspace)
                .with_context(|| format!("creating workspace {:?}", workspace))?;
            return Ok((candidate, workspace));
        }
    }
    Err(Error::NoAvailableName(format!(
        "{}'s server {}[a-z] already exist!",
        provider_name, base
    ))
    .into())
}

/// Drops a fresh per-server key pair into a server's workspace and
/// returns the authorized_keys lines to inject into the server: the
/// freshly minted public key plus any `extra_ssh_keys` configured for
/// the provider.
pub fn collect_ssh_keys(provider_config: &ProviderConfig, workspace: &Path) -> anyhow::Result<Vec<String>> {
    let key_pair = keys::confirm_key_pair(workspace)?;
    let mut ssh_keys = provider_config.extra_ssh_keys.clone();
    ssh_keys.push(keys::public_key_line(&key_pair)?);
    Ok(ssh_keys)
}

/// Builds the configured, enabled set of providers keyed by name.
pub fn build_registry(
    data_dir: &Path,
    providers_config: &HashMap<String, ProviderConfig>,
) -> HashMap<String, Box<dyn Provider>> {
    let mut providers: HashMap<String, Box<dyn Provider>> = HashMap::new();
    for (name, config) in providers_config.iter() {
        if !config.enable {
            continue;
        }
        match name.as_str() {
            "process" => {
                let workspace = data_dir.join(name);
                providers.insert(
                    name.clone(),
                    Box::new(process::ProcessProvider::new(name.clone(), config.clone(), workspace)),
                );
            }
            other => {
                // Real cloud adapters (digitalocean, vultr, linode, ...) are
                // registered by the embedding binary; the core only ships
                // the process provider used for its own tests.
                info!(provider = other, "no built-in adapter for provider, skipping");
            }
        }
    }
    providers
}

/// Looks up the provider that owns `meta`, used by both the
/// orchestrator's post-logout check and the reaper sweep.
pub fn lookup<'a>(
    providers: &'a HashMap<String, Box<dyn Provider>>,
    meta: &ServerMeta,
) -> anyhow::Result<&'a dyn Provider> {
    providers
        .get(&meta.provider_name)
        .map(|b| b.as_ref())
        .ok_or_else(|| Error::NoProvider(format!("no provider for server {}", meta.server_name)).into())
}
