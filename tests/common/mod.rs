#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use execd::config::SessionConfig;
use execd::session::SessionRegistry;

/// Output the fake dev server prints once it is up.
pub const DEV_SERVER_BANNER: &str = "dev server ready";

/// Write an executable `npm` into `dir/bin` that prints a banner and then
/// stays alive like a dev server. Returns the bin directory.
pub fn install_fake_npm(dir: &Path) -> PathBuf {
    install_npm_script(
        dir,
        &format!("#!/bin/sh\necho \"{DEV_SERVER_BANNER} ($*)\"\nexec sleep 30\n"),
    )
}

/// Like [`install_fake_npm`], but the process ignores SIGTERM. The ignored
/// disposition survives the `exec`, so only SIGKILL ends it.
pub fn install_stubborn_npm(dir: &Path) -> PathBuf {
    install_npm_script(
        dir,
        &format!("#!/bin/sh\ntrap '' TERM\necho \"{DEV_SERVER_BANNER} ($*)\"\nexec sleep 30\n"),
    )
}

fn install_npm_script(dir: &Path, body: &str) -> PathBuf {
    let bin = dir.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let script = bin.join("npm");
    std::fs::write(&script, body).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    bin
}

/// Default session config with `bin` first on the PATH of spawned processes.
pub fn config_with_bin(bin: &Path) -> SessionConfig {
    let mut config = SessionConfig::default();
    let path = std::env::var("PATH").unwrap_or_default();
    config
        .env
        .insert("PATH".into(), format!("{}:{}", bin.display(), path));
    config
}

/// Registry whose processes see `bin` first on their PATH.
pub fn registry_with_bin(bin: &Path) -> SessionRegistry {
    SessionRegistry::with_config(config_with_bin(bin))
}

/// Poll `f` every 10ms until it returns true, panicking after 5s.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut f: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Whether a process with `pid` still exists.
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
