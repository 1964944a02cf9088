//! Filesystem path constants.

/// Default config file path for the proxy daemon.
pub const DEFAULT_PROXY_CONFIG: &str = "/etc/svcgate/config.yaml";

/// Default path of the service/endpoint snapshot written by the state source.
pub const DEFAULT_STATE_FILE: &str = "/var/lib/svcgate/state.yaml";
