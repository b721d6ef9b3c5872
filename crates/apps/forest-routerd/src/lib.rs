//! Daemon-side collaborators for `forest-router`: table-file config
//! parsing and the CLI driving the cooperative main loop. Kept as a thin
//! library so the config format has its own integration tests.

pub mod config;
