//! Docker volume plugin managing loopback ext4 image volumes with
//! scheduled restic backups, retention pruning and restore-on-mount.

pub mod api;
pub mod config;
pub mod engine;
pub mod registry;
pub mod schedule;
pub mod tooling;
pub mod ui;
pub mod utils;
pub mod volume;
