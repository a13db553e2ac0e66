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

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tracing::{info, instrument};

use crate::{config, keys, provider};

mod orchestrator;
mod prompt;
mod proxy;
mod reaper;
mod signals;

/// Loads the config, stands up the provider registry, the host key and
/// the reaper, then runs the ssh accept loop until the process is
/// killed. This is the entire lifetime of a lobbyboy process.
#[instrument(skip_all)]
pub fn run(config_path: String) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING LOBBYBOY ============================\n\n");

    let config = config::read_config(&config_path)?;
    let key_pair = keys::host_key(&config.data_dir)?;
    let providers = Arc::new(provider::build_registry(&config.data_dir, &config.provider));
    info!(count = providers.len(), "providers loaded");

    signals::spawn()?;

    reaper::spawn(
        config.servers_file_path(),
        config.provider.clone(),
        providers.clone(),
        config.min_destroy_interval(),
    );

    let shared = Arc::new(orchestrator::Shared { config_path, providers });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    rt.block_on(serve(shared, key_pair, config.listen_addr))
}

async fn serve(
    shared: Arc<orchestrator::Shared>,
    key_pair: russh_keys::key::KeyPair,
    listen_addr: String,
) -> anyhow::Result<()> {
    // russh has no GSSAPI method in its typed MethodSet (see DESIGN.md),
    // so only the two methods this crate actually implements are offered.
    let ssh_config = russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        methods: russh::MethodSet::PASSWORD | russh::MethodSet::PUBLICKEY,
        keys: vec![key_pair],
        ..Default::default()
    };

    info!(addr = %listen_addr, "listening for ssh connections");
    let mut server = orchestrator::LobbyServer { shared };
    russh::server::Server::run_on_address(&mut server, Arc::new(ssh_config), listen_addr)
        .await
        .context("running ssh server")?;
    Ok(())
}
