//! Centralized constants for the svcgate project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod iptables;
pub mod network;
pub mod paths;
