//! The immutable configuration produced by the CLI and consumed by the supervisor.
//!
//! Mirrors `spec.md` §3's `SandboxOptions` data model. `FsMode::Rootfs` carries
//! its directory inline instead of a side `rootfs_path` field, which collapses
//! the spec's "fs_mode == Rootfs implies rootfs_path non-empty" invariant into
//! the type itself.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::MicroboxError;

/// How the sandbox's root filesystem is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsMode {
    /// The sandbox shares the host filesystem; no mount namespace work is done.
    Host,
    /// An ephemeral tmpfs becomes the new root.
    Tmpfs,
    /// An overlayfs is built over the given directory as the read-only lower layer.
    Rootfs(PathBuf),
}

/// The sandbox's network topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetMode {
    /// A private netns with no interfaces beyond a down loopback.
    None,
    /// The sandbox shares the host's netns; no `NEWNET` is requested.
    Host,
    /// A private netns, same as `None` (kept distinct per spec naming).
    Private,
    /// Bridged networking: veth pair, bridge, NAT.
    Bridge,
}

/// Whether a bind mount is writable from inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    Ro,
    Rw,
}

/// A single user-requested bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host: PathBuf,
    pub dest: PathBuf,
    pub mode: MountMode,
}

/// The fully parsed, validated input to `Supervisor::spawn`.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub fs_mode: FsMode,
    pub net_mode: NetMode,
    pub hostname: String,
    pub cpus: f64,
    pub memory: u64,
    pub mounts: Vec<MountSpec>,
    pub mount_proc: bool,
    pub mount_dev: bool,
    pub env: BTreeMap<String, String>,
    pub syscalls_allow: Vec<String>,
    pub syscalls_deny: Vec<String>,
    pub cmd: Vec<String>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            fs_mode: FsMode::Tmpfs,
            net_mode: NetMode::None,
            hostname: "microbox".to_string(),
            cpus: 0.0,
            memory: 0,
            mounts: Vec::new(),
            mount_proc: false,
            mount_dev: false,
            env: BTreeMap::new(),
            syscalls_allow: Vec::new(),
            syscalls_deny: Vec::new(),
            cmd: Vec::new(),
        }
    }
}

impl SandboxOptions {
    /// Cross-option invariants from `spec.md` §3. Called once after parsing,
    /// before `Supervisor::spawn`.
    pub fn validate(&self) -> Result<(), MicroboxError> {
        if self.cmd.is_empty() {
            return Err(MicroboxError::Config(
                "missing command to execute".to_string(),
            ));
        }

        if self.fs_mode == FsMode::Host && !self.mounts.is_empty() {
            return Err(MicroboxError::Config(
                "--fs host conflicts with --mount-ro/--mount-rw (requires a private mount namespace)"
                    .to_string(),
            ));
        }

        if self.fs_mode == FsMode::Host && self.net_mode == NetMode::Private {
            tracing::warn!(
                "--net private has no effect with --fs host unless mounts are also isolated"
            );
        }

        Ok(())
    }
}
