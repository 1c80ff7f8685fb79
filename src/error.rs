//! Crate-wide error taxonomy.
//!
//! Mirrors the error kinds in the design: Config, System, Resource, Policy,
//! Transient, ChildSetup. Transient conditions (EEXIST on mkdir, EBUSY on
//! cgroup controller enable, EINVAL on devpts remount) are absorbed at their
//! call sites and never reach this enum.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MicroboxError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{op} failed: {source}")]
    System {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("allocation failed: {0}")]
    Resource(String),

    #[error("netlink operation failed: {0}")]
    Netlink(String),

    #[error("child setup failed at {step}: {source}")]
    ChildSetup {
        step: &'static str,
        #[source]
        source: Box<MicroboxError>,
    },
}

impl MicroboxError {
    pub fn system(op: &'static str, source: nix::Error) -> Self {
        MicroboxError::System { op, source }
    }

    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        MicroboxError::Io { op, source }
    }

    pub fn child_setup(step: &'static str, source: MicroboxError) -> Self {
        MicroboxError::ChildSetup {
            step,
            source: Box::new(source),
        }
    }
}

pub type MicroboxResult<T> = Result<T, MicroboxError>;
