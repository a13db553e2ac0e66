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

use std::time;

/// How long we poll the pty master / ssh channel pair for data during
/// the proxy loop.
pub const PROXY_POLL_DURATION: time::Duration = time::Duration::from_millis(100);

/// Max number of bytes we shuttle between the pty and the channel in a
/// single read.
pub const BUF_SIZE: usize = 1024 * 10;

/// How long we wait for a client to open a channel after the ssh
/// handshake completes.
pub const CHANNEL_ACCEPT_TIMEOUT: time::Duration = time::Duration::from_secs(20);

/// How long we wait for a pty-req before giving up on a shell-req.
pub const PTY_READY_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// Default interval between reaper sweeps, overridable via
/// `min_destroy_interval` in the config file.
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 60;

/// Default bit size for the lobby host key and per-server keys.
pub const DEFAULT_KEY_BITS: usize = 3072;

/// Basename, relative to a workspace directory, that a private key pair
/// is stored under.
pub const PRIVATE_KEY_BASENAME: &str = "id_rsa";

/// Basename of the on-disk file a provider persists its raw server
/// metadata blob under, inside a server's workspace.
pub const SERVER_META_FILENAME: &str = "server.json";
