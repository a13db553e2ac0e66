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

//! A reference `Provider` that "creates" a backend server by spawning
//! a local `sshd` instance on an ephemeral loopback port instead of
//! talking to a cloud api. It exists so the orchestrator and reaper
//! can be exercised end to end (in this crate's own integration tests,
//! and as a runnable demo) without an account on a real cloud.

use std::{
    fs,
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    process::{Child, Command},
};

use anyhow::Context;
use serde_derive::{Deserialize, Serialize};
use tracing::info;

use crate::{config::ProviderConfig, consts::SERVER_META_FILENAME, provider, provider::Progress, registry::ServerMeta};

pub struct ProcessProvider {
    name: String,
    config: ProviderConfig,
    workspace_root: PathBuf,
}

impl ProcessProvider {
    pub fn new(name: String, config: ProviderConfig, workspace_root: PathBuf) -> Self {
        ProcessProvider { name, config, workspace_root }
    }
}

/// What we persist alongside a server's key material so `destroy_server`
/// can find the sshd process to kill, mirroring the raw-server-blob
/// persistence pattern used to stash provider-private bookkeeping.
#[derive(Serialize, Deserialize)]
struct RawServer {
    pid: u32,
}

fn save_raw(workspace: &std::path::Path, raw: &RawServer) -> anyhow::Result<()> {
    let path = workspace.join(SERVER_META_FILENAME);
    fs::write(&path, serde_json::to_string(raw)?).with_context(|| format!("writing {:?}", path))
}

fn load_raw(workspace: &std::path::Path) -> anyhow::Result<RawServer> {
    let path = workspace.join(SERVER_META_FILENAME);
    let body = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
    serde_json::from_str(&body).with_context(|| format!("parsing {:?}", path))
}

fn ephemeral_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).context("binding ephemeral port")?;
    let addr: SocketAddr = listener.local_addr()?;
    Ok(addr.port())
}

impl provider::Provider for ProcessProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn create_server(&self, progress: &dyn Progress) -> anyhow::Result<ServerMeta> {
        let (server_name, workspace) =
            provider::generate_default_server_name(&self.name, &self.config, &self.workspace_root)?;
        progress.send_line(&format!("Generate server {} workspace {:?} done.", server_name, workspace));

        let ssh_keys = provider::collect_ssh_keys(&self.config, &workspace)?;
        let authorized_keys_path = workspace.join("authorized_keys");
        fs::write(&authorized_keys_path, ssh_keys.join("\n"))
            .with_context(|| format!("writing {:?}", authorized_keys_path))?;

        let port = ephemeral_port()?;
        let sshd_config_path = workspace.join("sshd_config");
        fs::write(
            &sshd_config_path,
            format!(
                "Port {port}\n\
                 ListenAddress 127.0.0.1\n\
                 HostKey {host_key}\n\
                 AuthorizedKeysFile {authorized_keys}\n\
                 UsePAM no\n\
                 PidFile {workspace}/sshd.pid\n",
                port = port,
                host_key = workspace.join(crate::consts::PRIVATE_KEY_BASENAME).display(),
                authorized_keys = authorized_keys_path.display(),
                workspace = workspace.display(),
            ),
        )
        .with_context(|| format!("writing {:?}", sshd_config_path))?;

        progress.send_line("Check starting sshd");
        let child: Child = Command::new("/usr/sbin/sshd")
            .arg("-D")
            .arg("-e")
            .arg("-f")
            .arg(&sshd_config_path)
            .spawn()
            .context("spawning sshd for process provider")?;
        let pid = child.id();
        // we deliberately don't wait() on this child: it's a long running
        // daemon that outlives create_server, and gets reaped by destroy_server.
        std::mem::forget(child);

        save_raw(&workspace, &RawServer { pid })?;
        progress.send_line(&format!("New server {} created!", server_name));

        Ok(ServerMeta {
            provider_name: self.name.clone(),
            server_name,
            workspace,
            server_host: "127.0.0.1".to_string(),
            server_user: "root".to_string(),
            server_port: port,
            created_timestamp: ServerMeta::now_timestamp(),
            ssh_extra_args: vec![],
            manage: true,
        })
    }

    fn destroy_server(&self, meta: &ServerMeta, progress: &dyn Progress) -> anyhow::Result<bool> {
        let raw = match load_raw(&meta.workspace) {
            Ok(raw) => raw,
            Err(e) => {
                info!(server = %meta.server_name, error = %e, "no process record, treating as already destroyed");
                return Ok(true);
            }
        };

        progress.send_line(&format!("Stopping sshd pid {} for {}", raw.pid, meta.server_name));
        // Safety: raw.pid was produced by our own Command::spawn above.
        let res = unsafe { libc::kill(raw.pid as libc::pid_t, libc::SIGTERM) };
        Ok(res == 0 || res == -1 /* ESRCH: already gone */)
    }
}
