//! Identity Mapper: writes `setgroups`/`uid_map`/`gid_map` for the child.
//!
//! Grounded on the distilled original's `setup_uid_gid_map` in `sandbox.c`.
//! Maps the single outside (real) UID/GID to child UID 0 / GID 0. Must run
//! from the parent after `clone3`, before the child's barrier read returns.
//! `setgroups` is disabled before `gid_map` is written, as required on recent
//! kernels (user_namespaces(7)).

use std::io::Write;

use nix::unistd::{Gid, Pid, Uid};

use crate::error::MicroboxError;

/// Writes the three `/proc/<pid>/{setgroups,uid_map,gid_map}` files that map
/// the child's user namespace UID 0 / GID 0 onto `real_uid`/`real_gid`. Each
/// write is single-shot (`write_all`); a short write is a failure.
pub fn write_id_maps(pid: Pid, real_uid: Uid, real_gid: Gid) -> Result<(), MicroboxError> {
    write_file(&format!("/proc/{pid}/setgroups"), "deny")?;
    write_file(&format!("/proc/{pid}/uid_map"), &format!("0 {real_uid} 1\n"))?;
    write_file(&format!("/proc/{pid}/gid_map"), &format!("0 {real_gid} 1\n"))?;
    Ok(())
}

fn write_file(path: &str, contents: &str) -> Result<(), MicroboxError> {
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| MicroboxError::io("open", e))?;
    f.write_all(contents.as_bytes())
        .map_err(|e| MicroboxError::io("write", e))
}
