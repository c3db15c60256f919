// Compiled-in bootstrap list for the relay
//
// Build-time customization:
// - Set ORGRELAY_BOOTSTRAP_NODES while building
// - Format: comma-separated multiaddrs, each ending in /p2p/<peer id>
// - Example: export ORGRELAY_BOOTSTRAP_NODES="/dns4/relay.example.org/tcp/4818/p2p/12D3Koo..."
//
// At run time --bootstrap / BOOTSTRAP_NODES replace this list entirely.

/// Default bootstrap nodes.
///
/// Empty: a relay built without an override is a network root and waits
/// for other relays to dial it.
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[];

/// Compiled-in bootstrap list, honouring the build-time override.
pub fn default_bootstrap_nodes() -> Vec<String> {
    parse_override(option_env!("ORGRELAY_BOOTSTRAP_NODES"))
}

fn parse_override(build_time_nodes: Option<&str>) -> Vec<String> {
    match build_time_nodes.map(str::trim) {
        // empty override counts as unset
        Some(nodes) if !nodes.is_empty() => split_list(nodes),
        _ => DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
