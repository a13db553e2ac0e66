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

//! The durable registry of servers lobbyboy has created and may still
//! own. The registry lives at `data_dir/servers_file` as a json array
//! and is always read-modified-written as a whole under `REGISTRY_LOCK`
//! so that concurrent client sessions and the reaper never observe or
//! produce a torn file.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use lazy_static::lazy_static;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, instrument};

lazy_static! {
    /// Serializes every read-modify-write cycle against the registry
    /// file. Held only for the duration of a single load+write, never
    /// across a provider call, so a slow `create_server` never blocks
    /// the reaper or other sessions from reading the registry.
    static ref REGISTRY_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
}

/// A single backend server lobbyboy knows about.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerMeta {
    pub provider_name: String,
    pub server_name: String,
    pub workspace: PathBuf,
    pub server_host: String,
    #[serde(default = "default_server_user")]
    pub server_user: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    pub created_timestamp: u64,
    #[serde(default)]
    pub ssh_extra_args: Vec<String>,
    #[serde(default = "default_manage")]
    pub manage: bool,
}

fn default_server_user() -> String {
    "root".to_string()
}

fn default_server_port() -> u16 {
    22
}

fn default_manage() -> bool {
    true
}

impl ServerMeta {
    pub fn now_timestamp() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    }

    /// How long this server has been alive, in seconds.
    pub fn live_secs(&self) -> u64 {
        Self::now_timestamp().saturating_sub(self.created_timestamp)
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.workspace.join(crate::consts::PRIVATE_KEY_BASENAME)
    }
}

/// Loads the full set of registered servers. A missing or empty file is
/// treated as an empty registry, not an error, since that's simply the
/// state of a freshly installed lobbyboy.
#[instrument(skip_all)]
pub fn load(path: &Path) -> anyhow::Result<Vec<ServerMeta>> {
    let _guard = REGISTRY_LOCK.lock().unwrap();
    load_locked(path)
}

fn load_locked(path: &Path) -> anyhow::Result<Vec<ServerMeta>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("reading registry {:?}", path))?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let servers: Vec<ServerMeta> =
        serde_json::from_str(&raw).with_context(|| format!("parsing registry {:?}", path))?;
    debug!(count = servers.len(), "loaded server registry");
    Ok(servers)
}

/// Applies `new` (appended) and `deleted` (removed by server_name) to
/// the registry in a single atomic read-modify-write, then returns the
/// resulting set. The write is performed by writing a sibling temp file
/// and renaming it over the registry path, so a crash mid-write never
/// leaves a partially written registry behind.
#[instrument(skip(new))]
pub fn update(
    path: &Path,
    new: Vec<ServerMeta>,
    deleted: &[String],
) -> anyhow::Result<Vec<ServerMeta>> {
    let _guard = REGISTRY_LOCK.lock().unwrap();
    let mut servers = load_locked(path)?;
    if !deleted.is_empty() {
        servers.retain(|s| !deleted.contains(&s.server_name));
    }
    servers.extend(new);
    write_locked(path, &servers)?;
    Ok(servers)
}

/// Removes `server_name` from the registry and persists the result,
/// but only if it was actually present. Returns the removed entry to
/// whichever caller wins the race, so the orchestrator's post-logout
/// check and the reaper's sweep can both consult the same server
/// without ever both deciding they're the one who gets to destroy it:
/// the registry lock here is the single source of truth for "who
/// claimed this row".
#[instrument(skip(path))]
pub fn claim(path: &Path, server_name: &str) -> anyhow::Result<Option<ServerMeta>> {
    let _guard = REGISTRY_LOCK.lock().unwrap();
    let mut servers = load_locked(path)?;
    let Some(idx) = servers.iter().position(|s| s.server_name == server_name) else {
        return Ok(None);
    };
    let claimed = servers.remove(idx);
    write_locked(path, &servers)?;
    Ok(Some(claimed))
}

/// Appends a freshly created server to the on-disk registry, under the
/// same lock every other registry mutation takes.
pub fn register_new_server(servers_file: &Path, meta: ServerMeta) -> anyhow::Result<()> {
    update(servers_file, vec![meta], &[]).map(|_| ())
}

/// Writes `servers` to `path` via a sibling temp file and rename, the
/// same atomic-replace discipline every registry mutation uses.
fn write_locked(path: &Path, servers: &[ServerMeta]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating registry dir {:?}", parent))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(servers).context("serializing registry")?;
    fs::write(&tmp_path, body).with_context(|| format!("writing {:?}", tmp_path))?;
    fs::rename(&tmp_path, path).with_context(|| format!("renaming {:?} to {:?}", tmp_path, path))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn meta(name: &str) -> ServerMeta {
        ServerMeta {
            provider_name: "process".to_string(),
            server_name: name.to_string(),
            workspace: PathBuf::from("/tmp/ws"),
            server_host: "127.0.0.1".to_string(),
            server_user: "root".to_string(),
            server_port: 22,
            created_timestamp: ServerMeta::now_timestamp(),
            ssh_extra_args: vec![],
            manage: true,
        }
    }

    #[test]
    fn missing_file_is_empty() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("servers.json");
        assert_eq!(load(&path)?.len(), 0);
        Ok(())
    }

    #[test]
    fn update_round_trips() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("servers.json");

        update(&path, vec![meta("a"), meta("b")], &[])?;
        let loaded = load(&path)?;
        assert_eq!(loaded.len(), 2);

        update(&path, vec![], &["a".to_string()])?;
        let loaded = load(&path)?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].server_name, "b");
        Ok(())
    }

    #[test]
    fn claim_removes_once() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("servers.json");
        update(&path, vec![meta("a"), meta("b")], &[])?;

        let claimed = claim(&path, "a")?;
        assert_eq!(claimed.map(|m| m.server_name), Some("a".to_string()));
        assert_eq!(load(&path)?.len(), 1);

        // a second claim of the same, now-gone name finds nothing to do.
        let second = claim(&path, "a")?;
        assert!(second.is_none());
        assert_eq!(load(&path)?.len(), 1);
        Ok(())
    }

    #[test]
    fn repeated_delete_is_idempotent() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("servers.json");
        update(&path, vec![meta("a")], &[])?;
        update(&path, vec![], &["a".to_string()])?;
        let after_first = load(&path)?;
        update(&path, vec![], &["a".to_string()])?;
        let after_second = load(&path)?;
        assert_eq!(after_first, after_second);
        assert!(after_second.is_empty());
        Ok(())
    }
}
