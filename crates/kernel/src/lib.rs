//! WordPoints installer library
//!
//! The install/update/uninstall engine, the host abstraction it runs against
//! and the points component built on top of it. The `wordpoints` binary is a
//! thin CLI over [`cli`].

pub mod cli;
pub mod config;
pub mod db;
pub mod host;
pub mod installable;
pub mod points;
