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

//! The full-duplex byte pump between a backend shell's pty master and
//! the client's ssh channel. This is lobbyboy's hot loop: it runs for
//! the entire lifetime of a proxied session.

use std::{os::unix::io::RawFd, process::Child, sync::mpsc::Receiver, time::Duration};

use anyhow::{anyhow, Context};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use russh::{server::Handle, ChannelId, CryptoVec};
use tracing::{debug, instrument};

use crate::consts::{BUF_SIZE, PROXY_POLL_DURATION};

/// Pumps bytes between `master_fd` and the ssh channel until `child`
/// exits or either side closes. Runs on a dedicated blocking thread
/// (via `tokio::task::spawn_blocking`) since it does synchronous
/// poll()/read()/write() against a raw fd, the same way the original
/// select()-based proxy loop this is modeled on does.
#[instrument(skip_all)]
pub fn run(
    rt: tokio::runtime::Handle,
    handle: Handle,
    channel_id: ChannelId,
    master_fd: RawFd,
    from_channel: Receiver<Vec<u8>>,
    mut child: Child,
) -> anyhow::Result<()> {
    let timeout = PollTimeout::try_from(PROXY_POLL_DURATION.as_millis() as u16)
        .unwrap_or(PollTimeout::from(Duration::from_millis(100).as_millis() as u16));

    loop {
        if child.try_wait().context("polling child status")?.is_some() {
            debug!("child exited, ending proxy loop");
            break;
        }

        let mut fds = [PollFd::new(unsafe { std::os::fd::BorrowedFd::borrow_raw(master_fd) }, PollFlags::POLLIN)];
        let n = poll(&mut fds, timeout).context("polling pty master")?;
        if n > 0 {
            if let Some(revents) = fds[0].revents() {
                if revents.contains(PollFlags::POLLIN) {
                    let mut buf = [0u8; BUF_SIZE];
                    match nix::unistd::read(master_fd, &mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let data = CryptoVec::from(buf[..n].to_vec());
                            if rt.block_on(handle.data(channel_id, data)).is_err() {
                                return Err(anyhow!("client channel closed"));
                            }
                        }
                        Err(nix::errno::Errno::EIO) => break,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        while let Ok(chunk) = from_channel.try_recv() {
            nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(master_fd) }, &chunk)
                .context("writing client input to pty master")?;
        }
    }

    let _ = child.kill();
    let _ = child.wait();
    Ok(())
}
