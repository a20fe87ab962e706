use std::path::PathBuf;

/// Default config file: `~/.config/vmctl/vmctl.toml`
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vmctl")
        .join("vmctl.toml")
}

/// Persistent state directory: `~/.local/share/vmctl/`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vmctl")
}

/// Flat inventory cache: `~/.local/share/vmctl/inventory.cache`
pub fn inventory_path() -> PathBuf {
    data_dir().join("inventory.cache")
}

/// Controller and worker logs: `~/.local/share/vmctl/logs/`
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Session sockets: `$XDG_RUNTIME_DIR/vmctl/`, falling back to `/tmp/vmctl-<uid>/`.
pub fn socket_dir() -> PathBuf {
    match dirs::runtime_dir() {
        Some(dir) => dir.join("vmctl"),
        None => PathBuf::from(format!("/tmp/vmctl-{}", nix::unistd::getuid())),
    }
}

/// `vmctl-worker` installed next to the running executable.
pub fn default_worker_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("vmctl-worker")))
        .unwrap_or_else(|| PathBuf::from("vmctl-worker"))
}
