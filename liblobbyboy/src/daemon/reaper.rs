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

//! Background sweep that periodically destroys servers nobody is using
//! any more, timed to land just inside the provider's billing cycle
//! boundary rather than the instant a server goes idle.

use std::{collections::HashMap, path::Path, sync::Arc, thread, time::Duration};

use tracing::{error, info, instrument, warn};

use crate::{
    config::ProviderConfig,
    duration,
    provider::{NullProgress, Progress, Provider},
    registry::{self, ServerMeta},
    session_table::SessionTable,
};

/// Outcome of consulting the destroy policy for a single server.
pub struct Decision {
    pub destroy: bool,
    pub reason: String,
}

/// Decides whether `meta` should be destroyed right now.
///
/// The policy, in order:
/// 1. Any live session pins the server: never destroy out from under a
///    connected user.
/// 2. `manage = false` opts a server out of the reaper entirely.
/// 3. `min_life_to_live` is a hard floor; "0" disables it outright.
/// 4. Otherwise a server is only destroyed once the remaining time in
///    its current billing cycle drops to (or below) `destroy_safe_time`,
///    so lobbyboy never throws away time already paid for.
#[instrument(skip(provider_config, session_table), fields(server = %meta.server_name))]
pub fn need_destroy(
    provider_config: &ProviderConfig,
    session_table: &SessionTable,
    meta: &ServerMeta,
) -> Decision {
    let active = session_table.count(&meta.server_name);
    if active > 0 {
        return Decision { destroy: false, reason: format!("still have {} active sessions", active) };
    }
    if !meta.manage {
        return Decision { destroy: false, reason: "not managed by lobbyboy".to_string() };
    }

    let live = Duration::from_secs(meta.live_secs());
    let min_life_to_live = match duration::parse(&provider_config.min_life_to_live) {
        Ok(d) => d,
        Err(e) => {
            warn!(
                server = %meta.server_name,
                min_life_to_live = %provider_config.min_life_to_live,
                error = %e,
                "invalid min_life_to_live, keeping server rather than guessing",
            );
            return Decision { destroy: false, reason: format!("invalid min_life_to_live: {}", e) };
        }
    };
    if min_life_to_live.is_zero() {
        return Decision { destroy: true, reason: "min_life_to_live set to 0".to_string() };
    }
    if live < min_life_to_live {
        let remaining = min_life_to_live - live;
        return Decision {
            destroy: false,
            reason: format!(
                "still have {} to live (min_life_to_live={})",
                duration::humanize(remaining),
                provider_config.min_life_to_live
            ),
        };
    }

    let bill_time_unit = match duration::parse(&provider_config.bill_time_unit) {
        Ok(d) => d,
        Err(e) => {
            warn!(
                server = %meta.server_name,
                bill_time_unit = %provider_config.bill_time_unit,
                error = %e,
                "invalid bill_time_unit, keeping server rather than guessing",
            );
            return Decision { destroy: false, reason: format!("invalid bill_time_unit: {}", e) };
        }
    };
    let destroy_safe_time = match duration::parse(&provider_config.destroy_safe_time) {
        Ok(d) => d,
        Err(e) => {
            warn!(
                server = %meta.server_name,
                destroy_safe_time = %provider_config.destroy_safe_time,
                error = %e,
                "invalid destroy_safe_time, keeping server rather than guessing",
            );
            return Decision { destroy: false, reason: format!("invalid destroy_safe_time: {}", e) };
        }
    };

    let bill_secs = bill_time_unit.as_secs().max(1);
    let into_cycle = meta.live_secs() % bill_secs;
    let remaining_in_cycle = bill_secs.saturating_sub(into_cycle);
    if remaining_in_cycle > destroy_safe_time.as_secs() {
        let remaining = Duration::from_secs(remaining_in_cycle - destroy_safe_time.as_secs());
        return Decision {
            destroy: false,
            reason: format!(
                "still have {} to live (bill_time_unit={})",
                duration::humanize(remaining),
                provider_config.bill_time_unit
            ),
        };
    }

    Decision { destroy: true, reason: "is about to enter the next billing cycle".to_string() }
}

/// Claims `meta`'s row out of the registry and, only if the claim
/// actually removed something, destroys it via its provider. Used by
/// both the background sweep and a session's own post-logout check, so
/// the claim (not the provider call) is what decides who gets to
/// destroy a given server: whichever caller observes the row still
/// present under the registry lock wins, and the loser's `destroy`
/// call becomes a no-op that returns `false` rather than racing the
/// winner's provider call. Returns whether this caller was the one
/// that destroyed it.
#[instrument(skip(provider, progress, servers_file), fields(server = %meta.server_name))]
pub fn destroy(
    provider: &dyn Provider,
    progress: &dyn Progress,
    servers_file: &Path,
    meta: &ServerMeta,
) -> anyhow::Result<bool> {
    let Some(claimed) = registry::claim(servers_file, &meta.server_name)? else {
        info!(server = %meta.server_name, "server already claimed by another destroy, skipping");
        return Ok(false);
    };
    provider.destroy_server(&claimed, progress)?;
    Ok(true)
}

/// Spawns the background thread that sweeps the registry every
/// `min_destroy_interval` and destroys anything `need_destroy` flags.
pub fn spawn(
    servers_file: std::path::PathBuf,
    providers_config: HashMap<String, ProviderConfig>,
    providers: Arc<HashMap<String, Box<dyn Provider>>>,
    interval: Duration,
) {
    thread::spawn(move || {
        info!("reaper thread starting, sweeping every {:?}", interval);
        loop {
            if let Err(e) = sweep(&servers_file, &providers_config, &providers) {
                error!("reaper sweep failed: {:?}", e);
            }
            thread::sleep(interval);
        }
    });
}

#[instrument(skip_all)]
fn sweep(
    servers_file: &Path,
    providers_config: &HashMap<String, ProviderConfig>,
    providers: &HashMap<String, Box<dyn Provider>>,
) -> anyhow::Result<()> {
    info!("reaper starting a new sweep");
    let servers = registry::load(servers_file)?;
    for meta in servers {
        let Some(provider_config) = providers_config.get(&meta.provider_name) else {
            warn!(server = %meta.server_name, provider = %meta.provider_name, "no config for provider, skipping");
            continue;
        };
        let Some(provider) = providers.get(&meta.provider_name) else {
            warn!(server = %meta.server_name, provider = %meta.provider_name, "no provider registered, skipping");
            continue;
        };

        let decision = need_destroy(provider_config, SessionTable::global(), &meta);
        info!(server = %meta.server_name, destroy = decision.destroy, reason = %decision.reason, "reap decision");
        if decision.destroy {
            if let Err(e) = destroy(provider.as_ref(), &NullProgress, servers_file, &meta) {
                error!(server = %meta.server_name, error = %e, "failed to destroy server");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::ServerMeta;

    fn provider_config(min_life_to_live: &str, bill_time_unit: &str, destroy_safe_time: &str) -> ProviderConfig {
        toml::from_str(&format!(
            r#"
            min_life_to_live = "{}"
            bill_time_unit = "{}"
            destroy_safe_time = "{}"
            "#,
            min_life_to_live, bill_time_unit, destroy_safe_time
        ))
        .unwrap()
    }

    fn meta_with_age(live_secs: u64) -> ServerMeta {
        ServerMeta {
            provider_name: "process".to_string(),
            server_name: "srv".to_string(),
            workspace: "/tmp/ws".into(),
            server_host: "127.0.0.1".to_string(),
            server_user: "root".to_string(),
            server_port: 22,
            created_timestamp: ServerMeta::now_timestamp().saturating_sub(live_secs),
            ssh_extra_args: vec![],
            manage: true,
        }
    }

    #[test]
    fn active_session_pins_server() {
        let table = SessionTable::default();
        let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        table.add("srv", addr);
        let decision = need_destroy(&provider_config("0", "1h", "0"), &table, &meta_with_age(0));
        assert!(!decision.destroy);
    }

    #[test]
    fn zero_min_life_destroys_immediately() {
        let table = SessionTable::default();
        let decision = need_destroy(&provider_config("0", "1h", "0"), &table, &meta_with_age(5));
        assert!(decision.destroy);
    }

    #[test]
    fn below_min_life_keeps_server() {
        let table = SessionTable::default();
        let decision = need_destroy(&provider_config("1h", "1h", "0"), &table, &meta_with_age(5));
        assert!(!decision.destroy);
    }

    #[test]
    fn unmanaged_server_never_destroyed() {
        let table = SessionTable::default();
        let mut meta = meta_with_age(1_000_000);
        meta.manage = false;
        let decision = need_destroy(&provider_config("0", "1h", "0"), &table, &meta);
        assert!(!decision.destroy);
    }

    #[test]
    fn billing_cycle_boundary_triggers_destroy() {
        let table = SessionTable::default();
        // one hour bill unit, already lived exactly one full hour: zero time
        // left in the cycle, so it should destroy even with a safe margin.
        let decision = need_destroy(&provider_config("1s", "3600s", "0"), &table, &meta_with_age(3600));
        assert!(decision.destroy);
    }

    #[test]
    fn malformed_min_life_to_live_keeps_server() {
        let table = SessionTable::default();
        let decision = need_destroy(&provider_config("not-a-duration", "1h", "0"), &table, &meta_with_age(5));
        assert!(!decision.destroy);
    }

    #[test]
    fn malformed_bill_time_unit_keeps_server() {
        let table = SessionTable::default();
        let decision = need_destroy(&provider_config("0", "not-a-duration", "0"), &table, &meta_with_age(5));
        assert!(!decision.destroy);
    }

    #[test]
    fn malformed_destroy_safe_time_keeps_server() {
        let table = SessionTable::default();
        let decision = need_destroy(&provider_config("0", "1h", "not-a-duration"), &table, &meta_with_age(5));
        assert!(!decision.destroy);
    }

    struct CountingProvider {
        name: String,
        config: ProviderConfig,
        destroys: std::sync::atomic::AtomicUsize,
    }

    impl Provider for CountingProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn config(&self) -> &ProviderConfig {
            &self.config
        }

        fn create_server(&self, _progress: &dyn Progress) -> anyhow::Result<ServerMeta> {
            unimplemented!("not exercised by these tests")
        }

        fn destroy_server(&self, _meta: &ServerMeta, _progress: &dyn Progress) -> anyhow::Result<bool> {
            self.destroys.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(true)
        }
    }

    #[test]
    fn destroy_is_claimed_only_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("servers.json");
        let meta = meta_with_age(0);
        registry::update(&path, vec![meta.clone()], &[])?;

        let provider =
            CountingProvider { name: "process".to_string(), config: provider_config("0", "1h", "0"), destroys: 0.into() };

        // Simulates the reaper sweep and a session's own post-logout
        // check both observing the same idle meta in the same window.
        let first = destroy(&provider, &NullProgress, &path, &meta)?;
        let second = destroy(&provider, &NullProgress, &path, &meta)?;

        assert!(first, "the first caller to claim the row should destroy it");
        assert!(!second, "the second caller should find nothing left to claim");
        assert_eq!(provider.destroys.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(registry::load(&path)?.is_empty());
        Ok(())
    }
}
