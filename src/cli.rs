//! Command-line surface: `microbox [options] -- <cmd> [args...]`.
//!
//! Grounded on the teacher's `cli/args.rs` idiom (`#[derive(Parser)]`,
//! `#[arg(long, ...)]`). Unlike the teacher's many subcommands, `microbox`
//! has one mode of invocation, so this is a single flat struct with
//! `trailing_var_arg` capturing the payload command after a required `--`.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{FsMode, MountMode, MountSpec, NetMode, SandboxOptions};
use crate::error::MicroboxError;

/// `spec.md` §6: `--mount-ro`/`--mount-rw` are each "repeatable up to 128".
const MAX_MOUNTS: usize = 128;

#[derive(Parser, Debug)]
#[command(name = "microbox")]
#[command(about = "Launch a command inside a minimal Linux container")]
#[command(version)]
pub struct Cli {
    /// Host filesystem, "tmpfs", or a rootfs directory
    #[arg(long, default_value = "tmpfs")]
    pub fs: String,

    /// Network mode: none|host|private|bridge
    #[arg(long, default_value = "none")]
    pub net: String,

    /// Mount /proc inside the sandbox
    #[arg(long)]
    pub proc: bool,

    /// Mount /dev inside the sandbox
    #[arg(long)]
    pub dev: bool,

    /// Read-only bind mount, HOST:DEST (repeatable, up to 128)
    #[arg(long = "mount-ro", value_name = "HOST:DEST")]
    pub mount_ro: Vec<String>,

    /// Read-write bind mount, HOST:DEST (repeatable, up to 128)
    #[arg(long = "mount-rw", value_name = "HOST:DEST")]
    pub mount_rw: Vec<String>,

    /// Set an environment variable, KEY=VALUE (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Allow a syscall even if it is in the default denylist (repeatable)
    #[arg(long = "allow-syscall", value_name = "NAME")]
    pub allow_syscall: Vec<String>,

    /// Deny a syscall in addition to the default denylist (repeatable)
    #[arg(long = "deny-syscall", value_name = "NAME")]
    pub deny_syscall: Vec<String>,

    /// Container hostname
    #[arg(long, default_value = "microbox")]
    pub hostname: String,

    /// CPU limit in cores, e.g. 0.5 or 2 (0 = unlimited)
    #[arg(long, default_value_t = 0.0)]
    pub cpus: f64,

    /// Memory limit, e.g. 10M or 2G (0/empty = unlimited)
    #[arg(long, default_value = "0")]
    pub memory: String,

    /// Suppress the non-normative parameter dump before spawn
    #[arg(long)]
    pub quiet: bool,

    /// The command to run inside the sandbox, after `--`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub cmd: Vec<String>,
}

impl Cli {
    /// Find the first bare `--` in the raw argv, mirroring `find_first_double_dash`
    /// in the distilled original. `clap`'s own `--` handling already strips it
    /// from `trailing_var_arg`, but we re-check its presence explicitly because
    /// `spec.md` §8 calls out "missing `--`" as its own boundary case (exit 1
    /// with a usage message), distinct from "missing command".
    pub fn require_delimiter(raw_args: &[String]) -> Result<(), MicroboxError> {
        if raw_args.iter().any(|a| a == "--") {
            Ok(())
        } else {
            Err(MicroboxError::Config(
                "missing \"--\" to specify a command to execute".to_string(),
            ))
        }
    }

    /// Convert parsed CLI flags into validated `SandboxOptions`.
    pub fn into_options(self) -> Result<SandboxOptions, MicroboxError> {
        let fs_mode = parse_fs_mode(&self.fs);
        let net_mode = parse_net_mode(&self.net)?;
        let memory = parse_memory(&self.memory)?;

        if self.mount_ro.len() > MAX_MOUNTS || self.mount_rw.len() > MAX_MOUNTS {
            return Err(MicroboxError::Config(format!(
                "too many --mount-ro/--mount-rw entries (max {MAX_MOUNTS} each)"
            )));
        }

        let mut mounts = Vec::with_capacity(self.mount_ro.len() + self.mount_rw.len());
        for spec in &self.mount_ro {
            mounts.push(parse_mount_spec(spec, MountMode::Ro)?);
        }
        for spec in &self.mount_rw {
            let mount = parse_mount_spec(spec, MountMode::Rw)?;
            if !mount.dest.is_absolute() {
                return Err(MicroboxError::Config(format!(
                    "bad --mount-rw: {spec}, dest must be an absolute path"
                )));
            }
            mounts.push(mount);
        }

        let mut env = std::collections::BTreeMap::new();
        for spec in &self.env {
            let (key, value) = parse_env_var(spec)?;
            if env.insert(key.clone(), value).is_some() {
                return Err(MicroboxError::Config(format!(
                    "duplicate --env key: {key}"
                )));
            }
        }

        if self.cmd.is_empty() {
            return Err(MicroboxError::Config("missing command".to_string()));
        }

        let opts = SandboxOptions {
            fs_mode,
            net_mode,
            hostname: self.hostname,
            cpus: self.cpus,
            memory,
            mounts,
            mount_proc: self.proc,
            mount_dev: self.dev,
            env,
            syscalls_allow: self.allow_syscall,
            syscalls_deny: self.deny_syscall,
            cmd: self.cmd,
        };

        opts.validate()?;
        Ok(opts)
    }
}

fn parse_fs_mode(s: &str) -> FsMode {
    match s {
        "host" => FsMode::Host,
        "tmpfs" => FsMode::Tmpfs,
        dir => FsMode::Rootfs(PathBuf::from(dir)),
    }
}

fn parse_net_mode(s: &str) -> Result<NetMode, MicroboxError> {
    match s {
        "none" | "" => Ok(NetMode::None),
        "host" => Ok(NetMode::Host),
        "private" => Ok(NetMode::Private),
        "bridge" => Ok(NetMode::Bridge),
        other => Err(MicroboxError::Config(format!(
            "invalid --net value '{other}' (use: none|host|private|bridge)"
        ))),
    }
}

/// Parses the `k/K/m/M/g/G/b/B` suffix grammar from `spec.md` §6. An empty
/// suffix means bytes. Overflow or an unknown suffix is an error.
fn parse_memory(s: &str) -> Result<u64, MicroboxError> {
    if s.is_empty() || s == "0" {
        return Ok(0);
    }

    let (digits, suffix) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, ""),
    };

    let base: u64 = digits
        .parse()
        .map_err(|_| MicroboxError::Config(format!("invalid --memory value '{s}'")))?;

    let multiplier: u64 = match suffix {
        "" | "b" | "B" => 1,
        "k" | "K" => 1024,
        "m" | "M" => 1024 * 1024,
        "g" | "G" => 1024 * 1024 * 1024,
        _ => {
            return Err(MicroboxError::Config(format!(
                "invalid --memory suffix in '{s}'"
            )))
        }
    };

    base.checked_mul(multiplier)
        .ok_or_else(|| MicroboxError::Config(format!("--memory value '{s}' overflows")))
}

fn parse_mount_spec(spec: &str, mode: MountMode) -> Result<MountSpec, MicroboxError> {
    let (host, dest) = spec
        .split_once(':')
        .filter(|(h, d)| !h.is_empty() && !d.is_empty())
        .ok_or_else(|| MicroboxError::Config(format!("bad mount spec: {spec}")))?;

    Ok(MountSpec {
        host: PathBuf::from(host),
        dest: PathBuf::from(dest),
        mode,
    })
}

fn parse_env_var(spec: &str) -> Result<(String, String), MicroboxError> {
    let (key, value) = spec
        .split_once('=')
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| MicroboxError::Config(format!("bad --env: {spec}")))?;
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_suffixes() {
        assert_eq!(parse_memory("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("10M").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_memory("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_memory("128").unwrap(), 128);
        assert_eq!(parse_memory("").unwrap(), 0);
        assert_eq!(parse_memory("0").unwrap(), 0);
    }

    #[test]
    fn memory_rejects_unknown_suffix() {
        assert!(parse_memory("5X").is_err());
    }

    #[test]
    fn memory_rejects_overflow() {
        assert!(parse_memory("99999999999999999999G").is_err());
    }

    #[test]
    fn net_mode_parsing() {
        assert_eq!(parse_net_mode("none").unwrap(), NetMode::None);
        assert_eq!(parse_net_mode("bridge").unwrap(), NetMode::Bridge);
        assert!(parse_net_mode("bogus").is_err());
    }

    #[test]
    fn fs_mode_falls_back_to_rootfs_dir() {
        match parse_fs_mode("/srv/rootfs") {
            FsMode::Rootfs(p) => assert_eq!(p, PathBuf::from("/srv/rootfs")),
            other => panic!("expected Rootfs, got {other:?}"),
        }
    }

    #[test]
    fn mount_spec_requires_colon() {
        assert!(parse_mount_spec("nodelim", MountMode::Ro).is_err());
        let spec = parse_mount_spec("/host:/dest", MountMode::Rw).unwrap();
        assert_eq!(spec.host, PathBuf::from("/host"));
        assert_eq!(spec.dest, PathBuf::from("/dest"));
    }

    #[test]
    fn env_var_requires_equals_and_nonempty_key() {
        assert!(parse_env_var("NOEQUALS").is_err());
        assert!(parse_env_var("=value").is_err());
        let (k, v) = parse_env_var("KEY=value").unwrap();
        assert_eq!(k, "KEY");
        assert_eq!(v, "value");
    }
}
