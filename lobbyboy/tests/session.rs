//! Drives a real `ssh` client against a running lobbyboy gateway,
//! through the full create-menu / process-provider / proxy / reaper
//! flow. Needs a real `sshd` on the machine running the test (the
//! process provider execs one for its "backend server"), so the test
//! skips itself rather than failing when one isn't installed.

use std::{
    io::Write,
    os::unix::io::AsRawFd,
    process::{Command, Stdio},
    time,
};

use anyhow::Context;
use ntest::timeout;

mod support;

#[test]
#[timeout(60000)]
fn create_proxy_and_destroy_via_process_provider() -> anyhow::Result<()> {
    if !support::has_system_sshd() {
        eprintln!("skipping: no /usr/sbin/sshd on this machine");
        return Ok(());
    }

    let tmp_dir = tempfile::Builder::new().prefix("lobbyboy-test").rand_bytes(20).tempdir()?;

    let key_path = tmp_dir.path().join("client_key");
    support::generate_ssh_keypair(&key_path)?;
    let pub_key = std::fs::read_to_string(key_path.with_extension("pub")).context("reading client pubkey")?;

    let addr = support::ephemeral_addr()?;
    let data_dir = tmp_dir.path().join("data");
    let config_path = tmp_dir.path().join("lobbyboy.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
            listen_addr = "{addr}"
            data_dir = "{data_dir}"

            [user.alice]
            authorized_keys = "{pub_key}"

            [provider.process]
            min_life_to_live = "0"
            "#,
            addr = addr,
            data_dir = data_dir.display(),
            pub_key = pub_key.trim(),
        ),
    )
    .context("writing gateway config")?;

    let mut daemon = Command::new(support::lobbyboy_bin()?)
        .arg("--config-file")
        .arg(&config_path)
        .arg("-vv")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawning lobbyboy daemon")?;
    support::wait_for_listener(addr, time::Duration::from_secs(5))?;

    let mut client = Command::new("ssh")
        .arg("-tt")
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("UserKnownHostsFile=/dev/null")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-i")
        .arg(&key_path)
        .arg("-p")
        .arg(addr.port().to_string())
        .arg("-l")
        .arg("alice")
        .arg("127.0.0.1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawning ssh client")?;

    let result = (|| -> anyhow::Result<()> {
        nix::fcntl::fcntl(
            client.stdout.as_ref().unwrap().as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )
        .context("setting client stdout nonblocking")?;
        let mut out = support::line_matcher::LineMatcher::new(client.stdout.take().unwrap());

        out.scan_until_re("Welcome to lobbyboy")?;
        out.scan_until_re("provisioning a new server")?;
        out.scan_until_re("New server .* created!")?;
        out.scan_until_re("Redirect you to process server")?;

        let stdin = client.stdin.as_mut().context("missing client stdin")?;
        stdin.write_all(b"echo LOBBYBOY_TEST_OK\n").context("writing echo command")?;
        stdin.flush()?;
        out.scan_until_re("LOBBYBOY_TEST_OK")?;

        stdin.write_all(b"exit\n").context("writing exit command")?;
        stdin.flush()?;

        out.scan_until_re("ssh to remote server .* closed")?;
        out.scan_until_re("this server min_life_to_live set to 0")?;
        out.scan_until_re("i will destroy")?;
        out.scan_until_re("has been destroyed")?;
        Ok(())
    })();

    let _ = client.kill();
    let _ = client.wait();
    let _ = daemon.kill();
    let _ = daemon.wait();

    result
}
