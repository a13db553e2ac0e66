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

//! The in-memory table of which client peer addresses currently have a
//! live proxy session against which backend server. Kept separate from
//! the on-disk registry (and its own lock) so that slow registry disk
//! I/O never head-of-line blocks a session trying to register or
//! deregister itself.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Mutex, OnceLock},
};

#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<String, Vec<SocketAddr>>>,
}

impl SessionTable {
    pub fn global() -> &'static SessionTable {
        static TABLE: OnceLock<SessionTable> = OnceLock::new();
        TABLE.get_or_init(SessionTable::default)
    }

    pub fn add(&self, server_name: &str, peer: SocketAddr) {
        let mut table = self.inner.lock().unwrap();
        table.entry(server_name.to_string()).or_default().push(peer);
    }

    pub fn remove(&self, server_name: &str, peer: SocketAddr) {
        let mut table = self.inner.lock().unwrap();
        if let Some(peers) = table.get_mut(server_name) {
            peers.retain(|p| *p != peer);
            if peers.is_empty() {
                table.remove(server_name);
            }
        }
    }

    pub fn count(&self, server_name: &str) -> usize {
        let table = self.inner.lock().unwrap();
        table.get(server_name).map(Vec::len).unwrap_or(0)
    }

    /// Total number of live proxy sessions across every server, used by
    /// the term signal handler to warn before an exit that drops them.
    pub fn total_active(&self) -> usize {
        let table = self.inner.lock().unwrap();
        table.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_remove_counts() {
        let table = SessionTable::default();
        let a: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:1001".parse().unwrap();

        assert_eq!(table.count("srv"), 0);
        table.add("srv", a);
        table.add("srv", b);
        assert_eq!(table.count("srv"), 2);

        table.remove("srv", a);
        assert_eq!(table.count("srv"), 1);

        table.remove("srv", b);
        assert_eq!(table.count("srv"), 0);
    }

    #[test]
    fn total_active_sums_across_servers() {
        let table = SessionTable::default();
        let a: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:1001".parse().unwrap();

        table.add("srv-a", a);
        table.add("srv-b", b);
        assert_eq!(table.total_active(), 2);

        table.remove("srv-a", a);
        assert_eq!(table.total_active(), 1);
    }
}
