//! Hoist CLI - build and publish container images without a daemon.

pub mod commands;
