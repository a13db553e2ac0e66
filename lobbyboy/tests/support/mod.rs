// This module is shared by every integration test binary under
// lobbyboy/tests/, so not every helper is used by every test.
#![allow(dead_code)]

use std::{
    env,
    net::{SocketAddr, TcpListener, TcpStream},
    path::PathBuf,
    process::Command,
    time,
};

use anyhow::{anyhow, Context};

pub mod line_matcher;

/// Locates the `lobbyboy` binary cargo already built for this test run,
/// mirroring the fallback branch of the classic `cargo_dir()` helper:
/// a test binary lives at `target/<profile>/deps/<test>-<hash>`, so its
/// grandparent directory is where cargo also placed the `lobbyboy` bin.
pub fn lobbyboy_bin() -> anyhow::Result<PathBuf> {
    let mut dir = env::current_exe().context("locating test binary")?;
    dir.pop(); // drop the test binary's own file name
    if dir.ends_with("deps") {
        dir.pop();
    }
    let bin = dir.join("lobbyboy");
    if !bin.exists() {
        return Err(anyhow!("expected to find lobbyboy binary at {:?}", bin));
    }
    Ok(bin)
}

/// Binds an ephemeral loopback port and immediately releases it so the
/// daemon under test can bind it instead. Same trick the process
/// provider itself uses to pick a port for the backend sshd it spawns.
pub fn ephemeral_addr() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).context("binding ephemeral port")?;
    listener.local_addr().context("reading ephemeral port")
}

/// Polls `addr` until a tcp connection succeeds or `timeout` elapses,
/// used to wait out the daemon's startup before a test's ssh client
/// tries to connect.
pub fn wait_for_listener(addr: SocketAddr, timeout: time::Duration) -> anyhow::Result<()> {
    let start = time::Instant::now();
    let mut sleep_dur = time::Duration::from_millis(10);
    loop {
        if TcpStream::connect(addr).is_ok() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            return Err(anyhow!("nothing ever listened on {}", addr));
        }
        std::thread::sleep(sleep_dur);
        sleep_dur = (sleep_dur * 2).min(time::Duration::from_millis(250));
    }
}

/// Whether the system binaries the process-provider end-to-end test
/// needs are installed: sshd is optional on a bare build host, and
/// there's no point failing the whole suite for its absence.
pub fn has_system_sshd() -> bool {
    PathBuf::from("/usr/sbin/sshd").exists()
}

/// `ssh-keygen -t ed25519 -f path -N "" -q`, used to mint the key pair
/// a test drives the gateway's own pubkey auth with.
pub fn generate_ssh_keypair(path: &std::path::Path) -> anyhow::Result<()> {
    let status = Command::new("ssh-keygen")
        .arg("-t")
        .arg("ed25519")
        .arg("-f")
        .arg(path)
        .arg("-N")
        .arg("")
        .arg("-q")
        .status()
        .context("running ssh-keygen")?;
    if !status.success() {
        return Err(anyhow!("ssh-keygen exited with {:?}", status.code()));
    }
    Ok(())
}
