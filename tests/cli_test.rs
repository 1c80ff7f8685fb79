//! CLI parsing tests

use clap::Parser;
use microbox::cli::Cli;
use microbox::config::{FsMode, NetMode};

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).expect("expected successful parse")
}

#[test]
fn minimal_invocation_defaults_to_tmpfs_and_no_network() {
    let cli = parse(&["microbox", "--", "/bin/true"]);
    let opts = cli.into_options().unwrap();

    assert_eq!(opts.fs_mode, FsMode::Tmpfs);
    assert_eq!(opts.net_mode, NetMode::None);
    assert_eq!(opts.cmd, vec!["/bin/true".to_string()]);
}

#[test]
fn rootfs_fs_flag_carries_its_directory() {
    let cli = parse(&["microbox", "--fs", "/srv/rootfs", "--", "/bin/true"]);
    let opts = cli.into_options().unwrap();

    match opts.fs_mode {
        FsMode::Rootfs(dir) => assert_eq!(dir.to_str().unwrap(), "/srv/rootfs"),
        other => panic!("expected Rootfs, got {other:?}"),
    }
}

#[test]
fn mount_flags_are_repeatable() {
    let cli = parse(&[
        "microbox",
        "--mount-ro",
        "/host/a:/a",
        "--mount-rw",
        "/host/b:/b",
        "--",
        "/bin/true",
    ]);
    let opts = cli.into_options().unwrap();

    assert_eq!(opts.mounts.len(), 2);
}

#[test]
fn missing_command_after_flags_is_rejected() {
    let cli = parse(&["microbox", "--net", "bridge"]);
    assert!(cli.into_options().is_err());
}

#[test]
fn bad_net_mode_is_rejected() {
    let cli = parse(&["microbox", "--net", "bogus", "--", "/bin/true"]);
    assert!(cli.into_options().is_err());
}

#[test]
fn missing_double_dash_is_rejected_before_parsing() {
    let raw: Vec<String> = ["microbox", "--net", "none", "/bin/true"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert!(Cli::require_delimiter(&raw).is_err());
}

#[test]
fn more_than_128_mount_ro_entries_is_rejected() {
    let mut args = vec!["microbox".to_string()];
    for i in 0..129 {
        args.push("--mount-ro".to_string());
        args.push(format!("/host/{i}:/dest/{i}"));
    }
    args.push("--".to_string());
    args.push("/bin/true".to_string());

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let cli = parse(&arg_refs);
    assert!(cli.into_options().is_err());
}

#[test]
fn cpus_and_memory_flags_parse() {
    let cli = parse(&["microbox", "--cpus", "1.5", "--memory", "256M", "--", "/bin/true"]);
    let opts = cli.into_options().unwrap();

    assert_eq!(opts.cpus, 1.5);
    assert_eq!(opts.memory, 256 * 1024 * 1024);
}
