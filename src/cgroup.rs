//! Cgroup Controller: per-container cgroup v2 CPU/memory limits.
//!
//! Grounded on the distilled original's `setup_cgroup_limits` in `sandbox.c`,
//! with the open-write-close-per-file shape of the teacher's
//! `sandbox/linux_advanced.rs::setup_cgroups`. Unlike the teacher (which
//! writes to a shared `super-mcp` cgroup and uses `max_cpu_percent`/
//! `max_memory_mb`), the path and value formatting here follow the
//! authoritative original: `/sys/fs/cgroup/microbox-<pid>/`, `cpu.max` as
//! `"<floor(cpus*100000)> 100000"`, `memory.max`/`memory.swap.max=0` only
//! when `memory>0`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use nix::unistd::Pid;

use crate::error::MicroboxError;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const CPU_PERIOD_US: u64 = 100_000;

/// A handle to the per-container cgroup directory. Not explicitly removed;
/// the kernel reclaims it once it is empty and the sandboxed PID has exited.
#[derive(Debug, Clone)]
pub struct CgroupHandle {
    pub path: PathBuf,
}

impl CgroupHandle {
    pub fn for_pid(pid: Pid) -> Self {
        Self {
            path: PathBuf::from(format!("{CGROUP_ROOT}/microbox-{pid}")),
        }
    }
}

/// Enables the `cpu`/`memory` controllers on the parent cgroup, creates the
/// per-container directory, writes the requested limits, and moves `pid`
/// into the new cgroup via `cgroup.procs`.
///
/// `cpus=0` means unlimited and `cpu.max` is not written; `memory=0` means
/// unlimited and neither `memory.max` nor `memory.swap.max` is written.
pub fn setup(pid: Pid, cpus: f64, memory: u64) -> Result<CgroupHandle, MicroboxError> {
    enable_controllers()?;

    let handle = CgroupHandle::for_pid(pid);
    std::fs::create_dir_all(&handle.path).map_err(|e| MicroboxError::io("mkdir cgroup", e))?;

    if cpus > 0.0 {
        let quota = (cpus * CPU_PERIOD_US as f64).floor() as u64;
        write_value(&handle.path.join("cpu.max"), &format!("{quota} {CPU_PERIOD_US}"))?;
    }

    if memory > 0 {
        write_value(&handle.path.join("memory.max"), &memory.to_string())?;
        write_value(&handle.path.join("memory.swap.max"), "0")?;
    }

    write_value(&handle.path.join("cgroup.procs"), &pid.to_string())?;

    tracing::debug!(path = %handle.path.display(), cpus, memory, "cgroup limits applied");
    Ok(handle)
}

/// Appends `+memory`/`+cpu` to the root `cgroup.subtree_control`, tolerating
/// `EBUSY` (already enabled by a prior sandbox).
fn enable_controllers() -> Result<(), MicroboxError> {
    let path = format!("{CGROUP_ROOT}/cgroup.subtree_control");
    let mut f = match OpenOptions::new().write(true).open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(MicroboxError::io("open subtree_control", e)),
    };

    for controller in ["+memory", "+cpu"] {
        if let Err(e) = f.write_all(controller.as_bytes()) {
            if e.raw_os_error() != Some(libc::EBUSY) {
                return Err(MicroboxError::io("write subtree_control", e));
            }
        }
    }

    Ok(())
}

fn write_value(path: &std::path::Path, value: &str) -> Result<(), MicroboxError> {
    let mut f = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| MicroboxError::io("open cgroup file", e))?;
    f.write_all(value.as_bytes())
        .map_err(|e| MicroboxError::io("write cgroup file", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quota_formatting() {
        let quota = (0.5_f64 * CPU_PERIOD_US as f64).floor() as u64;
        assert_eq!(format!("{quota} {CPU_PERIOD_US}"), "50000 100000");
    }

    #[test]
    fn cgroup_path_includes_pid() {
        let handle = CgroupHandle::for_pid(Pid::from_raw(4242));
        assert_eq!(
            handle.path,
            PathBuf::from("/sys/fs/cgroup/microbox-4242")
        );
    }
}
