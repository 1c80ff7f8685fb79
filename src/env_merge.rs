//! Environment merging for the sandboxed command's `execve`.
//!
//! Grounded on the distilled original's `merge`/`flatten_env` pair in
//! `sandbox.c`: start from a fixed safe default, overlay the user's `--env`
//! entries by name (user wins), then flatten to `"NAME=VALUE"` strings.

use std::collections::BTreeMap;

/// The fixed safe defaults from `spec.md` §4.6.
pub const SAFE_DEFAULTS: &[(&str, &str)] = &[
    ("PATH", "/usr/bin:/bin:/usr/sbin:/sbin:/usr/local/bin"),
    ("HOME", "/root"),
    ("TERM", "xterm"),
];

/// Merge the safe defaults with the user-supplied environment, user wins on
/// duplicate names. A `BTreeMap` gives deterministic iteration order, which
/// makes the merge trivially idempotent (`spec.md` §8).
pub fn merge(user: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = SAFE_DEFAULTS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    for (k, v) in user {
        merged.insert(k.clone(), v.clone());
    }

    merged
}

/// Flatten a merged environment into `"NAME=VALUE"` strings suitable for
/// `execve`. An absent value becomes an empty string (`merge` never produces
/// one, but the flatten step stays defensive to mirror the original's
/// `env[i].value ? env[i].value : ""`).
pub fn flatten(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_idempotent() {
        let mut user = BTreeMap::new();
        user.insert("FOO".to_string(), "bar".to_string());

        let once = merge(&user);
        let twice = merge(&user);
        assert_eq!(once, twice);
    }

    #[test]
    fn user_overrides_safe_default() {
        let mut user = BTreeMap::new();
        user.insert("PATH".to_string(), "/custom/bin".to_string());

        let merged = merge(&user);
        assert_eq!(merged.get("PATH").unwrap(), "/custom/bin");
        assert_eq!(merged.get("HOME").unwrap(), "/root");
    }

    #[test]
    fn flatten_produces_name_equals_value() {
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "1".to_string());
        env.insert("B".to_string(), "2".to_string());

        let flat = flatten(&env);
        assert_eq!(flat, vec!["A=1".to_string(), "B=2".to_string()]);
    }
}
