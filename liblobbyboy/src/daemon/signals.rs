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

//! Shutdown on SIGTERM/SIGINT. lobbyboy holds no unix socket or pid
//! file to clean up on the way out, so the only thing worth doing
//! before exiting is telling the operator how many proxy sessions (and
//! their backend ssh children) are about to be dropped.

use std::{sync::Arc, sync::atomic::AtomicBool, thread};

use anyhow::Context;
use signal_hook::{consts::TERM_SIGNALS, flag, iterator::Signals};
use tracing::{info, warn};

use crate::session_table::SessionTable;

/// Installs the term signal handlers and spawns the thread that waits
/// on them. Mashing the signal twice skips straight to a hard exit
/// instead of waiting on a graceful shutdown that never arrives.
pub fn spawn() -> anyhow::Result<()> {
    info!("spawning signal handler thread");

    let term_now = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
        flag::register(*sig, Arc::clone(&term_now))?;
    }

    let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;
    thread::spawn(move || {
        #[allow(clippy::never_loop)]
        for signal in &mut signals {
            assert!(TERM_SIGNALS.contains(&signal));
            let active = SessionTable::global().total_active();
            if active > 0 {
                warn!(signal, active, "received term signal, dropping active proxy sessions and exiting");
            } else {
                info!(signal, "received term signal, exiting");
            }
            std::process::exit(0);
        }
    });

    Ok(())
}
