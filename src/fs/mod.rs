//! Filesystem Builder: private-mount propagation, tmpfs, overlayfs, bind
//! mounts, `/proc` and `/dev`, pivot_root.
//!
//! Grounded on `examples/original_source/fs.c`
//! (`microsandbox_setup_{tmpfs,rootfs,fs}`, `microbox_bind_mount{,_proc,_dev}`,
//! `microsandbox_create_{tmpfs,overlayfs}`). Must run after the child has
//! entered its (new) mount namespace; `pivot_root` is always the last
//! operation, per `spec.md` §3's ordering invariant.

pub mod paths;

use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::config::{FsMode, MountMode, MountSpec, SandboxOptions};
use crate::error::MicroboxError;

const BOX_ROOT: &str = "/box";
const DEV_ALLOWLIST: &[&str] = &["/dev/null", "/dev/zero", "/dev/random", "/dev/urandom", "/dev/tty"];

/// Describes the three directories an overlayfs mount is built from, plus
/// the merged mountpoint the sandbox actually pivots into. Owned by the
/// Filesystem Builder; per `spec.md` §9's "cyclic ownership" note, this
/// value is consumed and dropped before `pivot_root`, never retained across
/// the root switch (its paths would dangle once the old root is detached).
#[derive(Debug, Clone)]
pub struct OverlayLayout {
    pub lower: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
}

/// Builds the sandbox's root filesystem according to `opts.fs_mode`,
/// entering `FsMode::Host` as a no-op and everything else via a fresh mount
/// namespace, ending in `pivot_root`.
pub fn setup(opts: &SandboxOptions) -> Result<(), MicroboxError> {
    match &opts.fs_mode {
        FsMode::Host => Ok(()),
        FsMode::Tmpfs => setup_tmpfs(opts),
        FsMode::Rootfs(rootfs) => setup_rootfs(opts, rootfs),
    }
}

/// `mount("/", MS_PRIVATE|MS_REC)`: prevents any mount events made inside
/// the sandbox's mount namespace from propagating back to the host, and
/// vice versa. Always the first filesystem operation, per `spec.md` §4.4.
fn make_root_private() -> Result<(), MicroboxError> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| MicroboxError::system("mount(/, MS_PRIVATE|MS_REC)", e))
}

fn setup_tmpfs(opts: &SandboxOptions) -> Result<(), MicroboxError> {
    make_root_private()?;
    create_tmpfs(BOX_ROOT)?;

    if opts.mount_proc {
        bind_mount_proc(BOX_ROOT)?;
    }
    if opts.mount_dev {
        bind_mount_dev(BOX_ROOT)?;
    }
    for spec in &opts.mounts {
        bind_mount(BOX_ROOT, spec)?;
    }

    pivot_into(BOX_ROOT)
}

fn setup_rootfs(opts: &SandboxOptions, rootfs: &Path) -> Result<(), MicroboxError> {
    make_root_private()?;

    if !paths::is_directory(rootfs) {
        return Err(MicroboxError::Config(format!(
            "--fs {}: not a directory",
            rootfs.display()
        )));
    }

    create_tmpfs(BOX_ROOT)?;

    let overlay_mount = format!("{BOX_ROOT}/overlay");
    paths::mkdir_safe(&overlay_mount)?;

    let layout = create_overlayfs(rootfs, Path::new(&overlay_mount))?;

    for spec in &opts.mounts {
        bind_mount(layout.merged.to_str().unwrap(), spec)?;
    }
    if opts.mount_proc {
        bind_mount_proc(layout.merged.to_str().unwrap())?;
    }
    if opts.mount_dev {
        bind_mount_dev(layout.merged.to_str().unwrap())?;
    }

    let merged = layout.merged.clone();
    drop(layout);

    pivot_into(merged.to_str().unwrap())
}

/// Creates `path` and mounts a `tmpfs` of `mode=700,size=512m` there
/// (`microsandbox_create_tmpfs`).
fn create_tmpfs(path: &str) -> Result<(), MicroboxError> {
    paths::mkdir_safe(path)?;
    mount(
        Some("tmpfs"),
        path,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=700,size=512m"),
    )
    .map_err(|e| MicroboxError::system("mount tmpfs", e))
}

/// Builds `lowerdir=<src>,upperdir=<mountpoint>/upper,workdir=<mountpoint>/work`
/// and mounts the result at `<mountpoint>/merged` (`microsandbox_create_overlayfs`).
fn create_overlayfs(src: &Path, mountpoint: &Path) -> Result<OverlayLayout, MicroboxError> {
    let upper = mountpoint.join("upper");
    let work = mountpoint.join("work");
    let merged = mountpoint.join("merged");

    paths::mkdir_safe(&upper)?;
    paths::mkdir_safe(&work)?;
    paths::mkdir_safe(&merged)?;

    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        src.display(),
        upper.display(),
        work.display()
    );

    mount(
        Some("overlay"),
        &merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| MicroboxError::system("mount overlay", e))?;

    Ok(OverlayLayout {
        lower: src.to_path_buf(),
        upper,
        work,
        merged,
    })
}

/// Recursive bind mount of `spec.host` onto `base + spec.dest`
/// (`microbox_bind_mount`). Directories get their target created
/// recursively; regular/char/block files get an empty target file touched
/// into existence; anything else is rejected.
pub fn bind_mount(base: &str, spec: &MountSpec) -> Result<(), MicroboxError> {
    let target = join_under(base, &spec.dest);

    let meta = std::fs::symlink_metadata(&spec.host)
        .map_err(|e| MicroboxError::io("stat mount source", e))?;
    let file_type = meta.file_type();

    if file_type.is_dir() {
        paths::mkdirp(&target)?;
    } else if file_type.is_file() || is_char_or_block_device(&file_type) {
        paths::touch(&target)?;
    } else {
        return Err(MicroboxError::Config(format!(
            "cannot bind mount {}: not a directory, regular file, or device node",
            spec.host.display()
        )));
    }

    mount(
        Some(&spec.host),
        &target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| MicroboxError::system("bind mount", e))?;

    if spec.mode == MountMode::Ro {
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID,
            None::<&str>,
        )
        .map_err(|e| MicroboxError::system("remount bind mount read-only", e))?;
    }

    Ok(())
}

#[cfg(unix)]
fn is_char_or_block_device(ft: &std::fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    ft.is_char_device() || ft.is_block_device()
}

fn join_under(base: &str, dest: &Path) -> PathBuf {
    let dest = dest.strip_prefix("/").unwrap_or(dest);
    Path::new(base).join(dest)
}

/// Mounts `proc` at `<base>/proc` with `MS_NOSUID|MS_NOEXEC|MS_NODEV`
/// (`microbox_bind_mount_proc`).
fn bind_mount_proc(base: &str) -> Result<(), MicroboxError> {
    let target = format!("{base}/proc");
    paths::mkdirp(&target)?;
    mount(
        Some("proc"),
        target.as_str(),
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| MicroboxError::system("mount proc", e))
}

/// Mounts the minimal device tree: a `tmpfs` at `<base>/dev`, `devpts` at
/// `dev/pts`, a `ptmx` symlink, a `tmpfs` at `dev/shm`, and bind mounts the
/// host device allowlist in RW (`microbox_bind_mount_dev`). `EINVAL` on the
/// `devpts` mount (already mounted with incompatible options on the host,
/// e.g. inside another container) is absorbed, matching the original.
fn bind_mount_dev(base: &str) -> Result<(), MicroboxError> {
    let dev = format!("{base}/dev");
    paths::mkdirp(&dev)?;
    mount(
        Some("tmpfs"),
        dev.as_str(),
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("mode=755,size=2m"),
    )
    .map_err(|e| MicroboxError::system("mount /dev tmpfs", e))?;

    let pts = format!("{dev}/pts");
    paths::mkdirp(&pts)?;
    match mount(
        Some("devpts"),
        pts.as_str(),
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=620"),
    ) {
        Ok(()) => {}
        Err(nix::Error::EINVAL) => tracing::debug!("devpts remount with EINVAL, absorbed"),
        Err(e) => return Err(MicroboxError::system("mount devpts", e)),
    }

    let ptmx = format!("{dev}/ptmx");
    let _ = std::fs::remove_file(&ptmx);
    std::os::unix::fs::symlink("pts/ptmx", &ptmx).map_err(|e| MicroboxError::io("symlink ptmx", e))?;

    let shm = format!("{dev}/shm");
    paths::mkdirp(&shm)?;
    mount(
        Some("tmpfs"),
        shm.as_str(),
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("mode=1777,size=64m"),
    )
    .map_err(|e| MicroboxError::system("mount /dev/shm tmpfs", e))?;

    for host_path in DEV_ALLOWLIST {
        let spec = MountSpec {
            host: PathBuf::from(host_path),
            dest: PathBuf::from(host_path),
            mode: MountMode::Rw,
        };
        // Best-effort: a missing host device node (e.g. no /dev/random on a
        // minimal host) should not abort the whole sandbox.
        if let Err(e) = bind_mount(base, &spec) {
            tracing::debug!(device = host_path, error = %e, "device allowlist entry unavailable, skipping");
        }
    }

    Ok(())
}

/// `chdir(new_root)`, create `.old_root`, `pivot_root(".", "./.old_root")`,
/// `chdir("/")`, detach-unmount and remove the old root. Always the final
/// filesystem operation (`spec.md` §3, §4.4).
fn pivot_into(new_root: &str) -> Result<(), MicroboxError> {
    nix::unistd::chdir(new_root).map_err(|e| MicroboxError::system("chdir new root", e))?;

    paths::mkdir_safe(".old_root")?;
    raw_pivot_root(".", "./.old_root")?;

    nix::unistd::chdir("/").map_err(|e| MicroboxError::system("chdir /", e))?;
    umount2("/.old_root", MntFlags::MNT_DETACH)
        .map_err(|e| MicroboxError::system("umount2 old root", e))?;
    std::fs::remove_dir("/.old_root").map_err(|e| MicroboxError::io("rmdir old root", e))?;

    Ok(())
}

/// Neither `nix` nor `libc` expose a safe `pivot_root(2)` wrapper; this is
/// the one raw `libc::syscall` in the Filesystem Builder, mirroring how the
/// teacher's Linux-only modules already reach for raw `libc` constants
/// alongside `nix` for syscalls the ecosystem hasn't wrapped (e.g. `prctl`
/// in `linux_seccomp.rs`).
fn raw_pivot_root(new_root: &str, put_old: &str) -> Result<(), MicroboxError> {
    let new_root = std::ffi::CString::new(new_root).unwrap();
    let put_old = std::ffi::CString::new(put_old).unwrap();

    let ret = unsafe { libc::syscall(libc::SYS_pivot_root, new_root.as_ptr(), put_old.as_ptr()) };
    if ret < 0 {
        return Err(MicroboxError::io("pivot_root", std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_under_strips_leading_slash() {
        assert_eq!(join_under("/box", Path::new("/etc/passwd")), PathBuf::from("/box/etc/passwd"));
    }
}
