// ABOUTME: Decides whether worker containers need host networking.
// ABOUTME: Native Linux hosts use host networking and the bridge gateway as control host.

/// Network mode used when the manager cannot reach containers on loopback.
pub const HOST_NETWORK_MODE: &str = "host";

/// True on native Linux. WSL kernels report "microsoft" in their release and
/// keep default bridge networking with published ports.
pub fn needs_host_network(os: &str, kernel_release: &str) -> bool {
    os == "linux" && !kernel_release.to_lowercase().contains("microsoft")
}

/// [`needs_host_network`] for the running host.
pub fn host_needs_host_network() -> bool {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").unwrap_or_default();
    needs_host_network(std::env::consts::OS, release.trim())
}
