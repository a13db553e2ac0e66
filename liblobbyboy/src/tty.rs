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

//! Pty pair allocation and window size propagation for the terminal a
//! proxied shell session runs inside of.

use std::os::unix::io::{OwnedFd, RawFd};

use anyhow::Context;
use nix::pty::{openpty, OpenptyResult};

// see `man ioctl_tty` for info on this ioctl command
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

#[derive(Debug, Default, Clone, Copy)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl Size {
    /// set_fd applies this size to the pty indicated by the given file
    /// descriptor, the same way openssh's sshd does after a pty-req or
    /// window-change request.
    pub fn set_fd(&self, fd: RawFd) -> anyhow::Result<()> {
        let term_size = libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        };

        // Safety: term_size is stack allocated and lives for the whole call.
        unsafe {
            tiocswinsz(fd, &term_size).context("setting term size")?;
        }

        Ok(())
    }
}

/// A freshly allocated pty master/slave pair, sized per the given
/// pty-req parameters.
pub struct Pair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocates a new pty pair and applies the given initial size to it,
/// mirroring what a pty-req ssh channel request asks for.
pub fn allocate(size: Size) -> anyhow::Result<Pair> {
    let OpenptyResult { master, slave } = openpty(None, None).context("allocating pty pair")?;
    size.set_fd(std::os::unix::io::AsRawFd::as_raw_fd(&master))?;
    Ok(Pair { master, slave })
}
