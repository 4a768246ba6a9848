//! Container helpers shared by integration tests.

pub mod postgres;

use anyhow::{bail, Result};
use std::{
    env,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
};

/// Ensure a Docker-compatible socket is reachable for testcontainers.
///
/// # Errors
/// Returns an error naming what was checked when no runtime answers.
pub fn ensure_container_runtime() -> Result<()> {
    if let Ok(docker_host) = env::var("DOCKER_HOST") {
        let Some(path) = docker_host
            .strip_prefix("unix://")
            .or_else(|| docker_host.starts_with('/').then_some(docker_host.as_str()))
        else {
            // tcp:// and friends are left to testcontainers.
            return Ok(());
        };
        if socket_connectable(Path::new(path)) {
            return Ok(());
        }
        bail!("`DOCKER_HOST` points to `{docker_host}`, but the socket is not accepting connections");
    }

    let mut candidates = vec![PathBuf::from("/var/run/docker.sock")];
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        candidates.push(PathBuf::from(runtime_dir).join("podman/podman.sock"));
    }
    if candidates.iter().any(|path| socket_connectable(path)) {
        return Ok(());
    }
    bail!("No container runtime socket found; start Docker or set `DOCKER_HOST`")
}

fn socket_connectable(path: &Path) -> bool {
    path.exists() && UnixStream::connect(path).is_ok()
}
