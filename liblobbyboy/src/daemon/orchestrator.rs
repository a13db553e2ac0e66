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

//! The per-connection state machine: authenticate, negotiate a pty,
//! walk the user through picking or creating a backend server, spawn
//! a child ssh process onto it and proxy bytes until it exits.

use std::{
    collections::HashMap,
    net::SocketAddr,
    os::unix::io::AsRawFd,
    os::unix::process::CommandExt,
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicI32, Ordering},
        mpsc as std_mpsc, Arc, Mutex,
    },
};

use anyhow::Context;
use async_trait::async_trait;
use russh::{
    server::{Auth, Handle, Handler, Msg, Session},
    Channel, ChannelId, Pty,
};
use russh_keys::key::PublicKey;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, instrument, warn};

use crate::{
    config::{self, Config},
    daemon::{prompt::PromptReader, proxy, reaper},
    errors::Error,
    provider::{self, Progress, Provider},
    registry::{self, ServerMeta},
    session_table::SessionTable,
    tty,
};

/// Narrates a provider's slow `create_server`/`destroy_server` call
/// straight down the live ssh channel, so a client sitting in CREATE or
/// waiting on the post-logout destroy check sees the same progress
/// lines the provider would otherwise only log. The reaper's own sweep
/// has no attached client, so it keeps using `NullProgress` instead.
struct ChannelProgress {
    handle: Handle,
    channel: ChannelId,
    rt: tokio::runtime::Handle,
}

impl Progress for ChannelProgress {
    fn send_line(&self, line: &str) {
        let data = russh::CryptoVec::from(format!("{}\r\n", line).into_bytes());
        if self.rt.block_on(self.handle.data(self.channel, data)).is_err() {
            debug!("client went away while writing provider progress");
        }
    }
}

/// Process-wide state every connection's handler needs a reference to.
/// Constructed once in `daemon::run` and shared (via `Arc`) across
/// every `SessionHandler`.
pub struct Shared {
    pub config_path: String,
    pub providers: Arc<HashMap<String, Box<dyn Provider>>>,
}

pub struct LobbyServer {
    pub shared: Arc<Shared>,
}

impl russh::server::Server for LobbyServer {
    type Handler = SessionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> SessionHandler {
        SessionHandler {
            shared: self.shared.clone(),
            peer_addr,
            username: None,
            pty: None,
            data_tx: None,
            pty_ready: Arc::new(Notify::new()),
            child_pid: Arc::new(AtomicI32::new(0)),
        }
    }
}

struct PtyState {
    master: std::os::unix::io::OwnedFd,
    slave: std::os::unix::io::OwnedFd,
}

pub struct SessionHandler {
    shared: Arc<Shared>,
    peer_addr: Option<SocketAddr>,
    username: Option<String>,
    pty: Option<Arc<Mutex<PtyState>>>,
    data_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    pty_ready: Arc<Notify>,
    child_pid: Arc<AtomicI32>,
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = anyhow::Error;

    #[instrument(skip(self, password))]
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let config = config::read_config(&self.shared.config_path)?;
        let ok = config
            .user
            .get(user)
            .and_then(|u| u.password.as_deref())
            .map(|expected| constant_time_eq(expected.as_bytes(), password.as_bytes()))
            .unwrap_or(false);
        self.username = Some(user.to_string());
        Ok(if ok { Auth::Accept } else { Auth::Reject { proceed_with_methods: None } })
    }

    #[instrument(skip(self, public_key))]
    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let config = config::read_config(&self.shared.config_path)?;
        let presented = russh_keys::PublicKeyBase64::public_key_base64(public_key);
        let ok = config
            .user
            .get(user)
            .map(|u| {
                u.authorized_key_lines()
                    .any(|line| line.split_whitespace().nth(1).map(|k| k == presented).unwrap_or(false))
            })
            .unwrap_or(false);
        self.username = Some(user.to_string());
        Ok(if ok { Auth::Accept } else { Auth::Reject { proceed_with_methods: None } })
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    #[instrument(skip(self, _modes, session))]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = tty::Size {
            rows: row_height as u16,
            cols: col_width as u16,
            pixel_width: pix_width as u16,
            pixel_height: pix_height as u16,
        };
        let pair = tty::allocate(size).context("allocating pty pair")?;
        self.pty = Some(Arc::new(Mutex::new(PtyState { master: pair.master, slave: pair.slave })));
        self.pty_ready.notify_one();
        session.channel_success(channel);
        Ok(())
    }

    #[instrument(skip(self, _session))]
    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = tty::Size {
            rows: row_height as u16,
            cols: col_width as u16,
            pixel_width: pix_width as u16,
            pixel_height: pix_height as u16,
        };
        if let Some(pty) = &self.pty {
            let pty = pty.lock().unwrap();
            size.set_fd(pty.master.as_raw_fd())?;
        }
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid != 0 {
            // Safety: pid was produced by our own child spawn, which calls
            // setsid() so the pid also identifies its process group.
            unsafe {
                libc::kill(-pid, libc::SIGWINCH);
            }
        }
        Ok(())
    }

    #[instrument(skip(self, session))]
    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        if self.pty.is_none() {
            let _ =
                tokio::time::timeout(crate::consts::PTY_READY_TIMEOUT, self.pty_ready.notified()).await;
        }
        let Some(pty) = self.pty.clone() else {
            warn!("client never asked for a tty, ending session");
            session.data(channel, russh::CryptoVec::from(b"*** Client never asked for a tty.\r\n".to_vec()));
            session.close(channel);
            return Ok(());
        };

        session.channel_success(channel);

        let (tx, rx) = mpsc::unbounded_channel();
        self.data_tx = Some(tx);

        let shared = self.shared.clone();
        let handle = session.handle();
        let peer_addr = self.peer_addr;
        let child_pid = self.child_pid.clone();

        tokio::spawn(async move {
            if let Err(e) = run_session(shared, handle, channel, pty, rx, peer_addr, child_pid).await {
                warn!(error = %e, "session ended with error");
            }
        });

        Ok(())
    }

    async fn data(&mut self, _channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(tx) = &self.data_tx {
            let _ = tx.send(data.to_vec());
        }
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

async fn send_line(handle: &Handle, channel: ChannelId, line: impl AsRef<str>) {
    let data = russh::CryptoVec::from(format!("{}\r\n", line.as_ref()).into_bytes());
    let _ = handle.data(channel, data).await;
}

/// Drives everything downstream of a successful shell-req: the
/// create-or-resume menu, spawning the backend ssh client, proxying,
/// and the post-logout destroy check.
async fn run_session(
    shared: Arc<Shared>,
    handle: Handle,
    channel: ChannelId,
    pty: Arc<Mutex<PtyState>>,
    mut data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    peer_addr: Option<SocketAddr>,
    child_pid: Arc<AtomicI32>,
) -> anyhow::Result<()> {
    let config = config::read_config(&shared.config_path)?;
    let peer_addr = peer_addr.unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());

    send_line(&handle, channel, format!("Welcome to lobbyboy {}!", env!("CARGO_PKG_VERSION"))).await;

    let meta = {
        let mut prompt = PromptReader::new(handle.clone(), channel, &mut data_rx);
        match choose_or_create_server(&shared, &config, &mut prompt, &handle, channel).await {
            Ok(meta) => meta,
            Err(Error::UserCancelled) => {
                send_line(&handle, channel, "Got EOF, closing session...").await;
                let _ = handle.close(channel).await;
                return Ok(());
            }
            Err(e) => {
                send_line(&handle, channel, format!("lobbyboy got an error from the provider: {}", e)).await;
                let _ = handle.close(channel).await;
                return Ok(());
            }
        }
    };

    let provider = provider::lookup(&shared.providers, &meta)?;
    let ssh_command = provider.ssh_server_command(&meta);
    send_line(
        &handle,
        channel,
        format!("Redirect you to {} server: {} ({})...", meta.provider_name, meta.server_name, meta.server_host),
    )
    .await;

    let (slave_fd, master_fd) = {
        let pty = pty.lock().unwrap();
        (pty.slave.try_clone().context("cloning pty slave fd")?, pty.master.as_raw_fd())
    };

    let mut command = Command::new(&ssh_command[0]);
    command.args(&ssh_command[1..]);
    command.stdin(Stdio::from(slave_fd.try_clone().context("cloning slave fd for stdin")?));
    command.stdout(Stdio::from(slave_fd.try_clone().context("cloning slave fd for stdout")?));
    command.stderr(Stdio::from(slave_fd));
    unsafe {
        command.pre_exec(|| {
            // A fresh session/process group so a window-change SIGWINCH
            // reaches the whole backend ssh job, not just the direct child.
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().context("spawning backend ssh client")?;
    child_pid.store(child.id() as i32, Ordering::SeqCst);
    SessionTable::global().add(&meta.server_name, peer_addr);

    let (to_master_tx, to_master_rx) = std_mpsc::channel::<Vec<u8>>();
    let proxy_rt = tokio::runtime::Handle::current();
    let proxy_handle = handle.clone();
    let mut proxy_task =
        tokio::task::spawn_blocking(move || proxy::run(proxy_rt, proxy_handle, channel, master_fd, to_master_rx, child));

    loop {
        tokio::select! {
            chunk = data_rx.recv() => {
                match chunk {
                    Some(bytes) => { let _ = to_master_tx.send(bytes); }
                    None => break,
                }
            }
            res = &mut proxy_task => {
                if let Ok(Err(e)) = res {
                    warn!(error = %e, "proxy loop ended with an error");
                }
                break;
            }
        }
    }
    child_pid.store(0, Ordering::SeqCst);

    send_line(&handle, channel, format!("lobbyboy: ssh to remote server {} closed.", meta.server_name)).await;
    SessionTable::global().remove(&meta.server_name, peer_addr);

    let provider_config = config
        .provider
        .get(&meta.provider_name)
        .cloned()
        .context("provider config vanished mid-session")?;
    let decision = reaper::need_destroy(&provider_config, SessionTable::global(), &meta);
    send_line(&handle, channel, format!("lobbyboy: this server {}.", decision.reason)).await;
    if decision.destroy {
        send_line(
            &handle,
            channel,
            format!("lobbyboy: i will destroy {} ({}) now!", meta.server_name, meta.server_host),
        )
        .await;
        let progress = ChannelProgress { handle: handle.clone(), channel, rt: tokio::runtime::Handle::current() };
        let claimed =
            tokio::task::block_in_place(|| reaper::destroy(provider, &progress, &config.servers_file_path(), &meta))?;
        if claimed {
            send_line(
                &handle,
                channel,
                format!("lobbyboy: server {} ({}) has been destroyed.", meta.server_name, meta.server_host),
            )
            .await;
        } else {
            send_line(
                &handle,
                channel,
                format!("lobbyboy: server {} was already claimed by another destroy, leaving it alone.", meta.server_name),
            )
            .await;
        }
    }

    let _ = handle.close(channel).await;
    Ok(())
}

async fn choose_or_create_server(
    shared: &Shared,
    config: &Config,
    prompt: &mut PromptReader<'_>,
    handle: &Handle,
    channel: ChannelId,
) -> Result<ServerMeta, Error> {
    let servers_file = config.servers_file_path();
    let available = registry::load(&servers_file).map_err(|e| Error::Other(e.to_string()))?;

    if available.is_empty() {
        prompt.send(b"There are no available servers, provisioning a new server...\r\n").await;
        return create_server(shared, config, prompt, handle, channel).await;
    }

    let mut options = vec!["Create a new server...".to_string()];
    for meta in &available {
        let active = SessionTable::global().count(&meta.server_name);
        options.push(format!(
            "Enter {} {} {} ({} active sessions)",
            meta.provider_name, meta.server_name, meta.server_host, active
        ));
    }

    let choice = prompt
        .choose_option(&options, Some(&format!("There are {} available servers:", available.len())), None)
        .await?;

    if choice == 0 {
        return create_server(shared, config, prompt, handle, channel).await;
    }
    Ok(available[choice - 1].clone())
}

async fn create_server(
    shared: &Shared,
    config: &Config,
    prompt: &mut PromptReader<'_>,
    handle: &Handle,
    channel: ChannelId,
) -> Result<ServerMeta, Error> {
    let enabled: Vec<String> =
        config.provider.iter().filter(|(_, c)| c.enable).map(|(name, _)| name.clone()).collect();
    if enabled.is_empty() {
        prompt.send(b"There are no available providers.\r\n").await;
        return Err(Error::NoProvider("no enabled providers configured".to_string()));
    }

    let chosen_name = if enabled.len() == 1 {
        enabled[0].clone()
    } else {
        let idx = prompt
            .choose_option(
                &enabled,
                Some("Available server providers:"),
                Some("Please choose a provider to create a new server: "),
            )
            .await?;
        enabled[idx].clone()
    };

    let provider = shared
        .providers
        .get(&chosen_name)
        .ok_or_else(|| Error::NoProvider(format!("no provider registered for '{}'", chosen_name)))?;

    // create_server can block for minutes (provisioning a real cloud vm),
    // so it runs off the async runtime via block_in_place rather than
    // spawn_blocking, which keeps the borrowed handle/channel usable
    // from inside the closure below.
    let progress = ChannelProgress { handle: handle.clone(), channel, rt: tokio::runtime::Handle::current() };
    let meta = {
        let provider = provider.as_ref();
        tokio::task::block_in_place(|| provider.create_server(&progress))
            .with_context(|| format!("provider '{}' failed to create a server", chosen_name))
            .map_err(|e| Error::Other(e.to_string()))?
    };

    registry::register_new_server(&config.servers_file_path(), meta.clone())
        .map_err(|e| Error::Other(format!("failed to persist new server to registry: {}", e)))?;

    Ok(meta)
}
