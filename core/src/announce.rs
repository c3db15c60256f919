//! The relay's advertised address.
//!
//! Captured once, right after the overlay node reports its addresses, and
//! read by the HTTP layer from then on. This is the string operators paste
//! into other nodes' bootstrap lists.

use crate::transport::addresses::tcp_port;
use libp2p::Multiaddr;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

/// Which of the node's reported addresses to announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressSelection {
    #[default]
    First,
    Last,
    /// First address on this TCP port, else the first address.
    PreferPort(u16),
}

impl AddressSelection {
    pub fn select<'a>(&self, addrs: &'a [Multiaddr]) -> Option<&'a Multiaddr> {
        match self {
            Self::First => addrs.first(),
            Self::Last => addrs.last(),
            Self::PreferPort(port) => addrs
                .iter()
                .find(|addr| tcp_port(addr) == Some(*port))
                .or_else(|| addrs.first()),
        }
    }
}

impl FromStr for AddressSelection {
    type Err = String;

    /// `first`, `last` or `port:<n>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            other => other
                .strip_prefix("port:")
                .and_then(|p| p.parse().ok())
                .map(Self::PreferPort)
                .ok_or_else(|| format!("unknown address selection: {s}")),
        }
    }
}

/// Set-once holder for the announced address, cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct AddressAnnouncer {
    selection: AddressSelection,
    current: Arc<OnceLock<String>>,
}

impl AddressAnnouncer {
    pub fn new(selection: AddressSelection) -> Self {
        Self {
            selection,
            current: Arc::new(OnceLock::new()),
        }
    }

    /// Record the announced address from the node's reported addresses.
    ///
    /// Only the first successful capture counts. Returns the address now
    /// being announced, if any.
    pub fn capture(&self, addrs: &[Multiaddr]) -> Option<String> {
        let selected = self.selection.select(addrs)?.to_string();

        if self.current.set(selected.clone()).is_err() {
            tracing::debug!(ignored = %selected, "Announced address already set");
        } else {
            tracing::info!(address = %selected, "Announcing address");
        }
        self.current.get().cloned()
    }

    /// The announced address, or `""` until the overlay node is up.
    pub fn current_address(&self) -> &str {
        self.current.get().map(String::as_str).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> Vec<Multiaddr> {
        vec![
            "/ip4/127.0.0.1/tcp/4818".parse().unwrap(),
            "/ip4/192.168.1.20/tcp/4818".parse().unwrap(),
            "/dns4/relay.example.org/tcp/443".parse().unwrap(),
        ]
    }

    #[test]
    fn test_empty_before_capture() {
        let announcer = AddressAnnouncer::new(AddressSelection::First);
        assert_eq!(announcer.current_address(), "");
    }

    #[test]
    fn test_selection_policies() {
        let addrs = addrs();
        assert_eq!(AddressSelection::First.select(&addrs), Some(&addrs[0]));
        assert_eq!(AddressSelection::Last.select(&addrs), Some(&addrs[2]));
        assert_eq!(AddressSelection::PreferPort(443).select(&addrs), Some(&addrs[2]));
        assert_eq!(AddressSelection::PreferPort(9999).select(&addrs), Some(&addrs[0]));
        assert_eq!(AddressSelection::Last.select(&[]), None);
    }

    #[test]
    fn test_capture_is_set_once() {
        let announcer = AddressAnnouncer::new(AddressSelection::First);
        let addrs = addrs();

        assert_eq!(
            announcer.capture(&addrs).as_deref(),
            Some("/ip4/127.0.0.1/tcp/4818")
        );
        // a later capture does not move the address
        announcer.capture(&addrs[2..]);
        assert_eq!(announcer.current_address(), "/ip4/127.0.0.1/tcp/4818");
    }

    #[test]
    fn test_capture_of_nothing_leaves_empty() {
        let announcer = AddressAnnouncer::default();
        assert!(announcer.capture(&[]).is_none());
        assert_eq!(announcer.current_address(), "");
    }

    #[test]
    fn test_clones_share_state() {
        let announcer = AddressAnnouncer::new(AddressSelection::Last);
        let reader = announcer.clone();

        announcer.capture(&addrs());
        assert_eq!(reader.current_address(), "/dns4/relay.example.org/tcp/443");
    }

    #[test]
    fn test_parse_selection() {
        assert_eq!("first".parse::<AddressSelection>(), Ok(AddressSelection::First));
        assert_eq!("LAST".parse::<AddressSelection>(), Ok(AddressSelection::Last));
        assert_eq!(
            "port:443".parse::<AddressSelection>(),
            Ok(AddressSelection::PreferPort(443))
        );
        assert!("port:x".parse::<AddressSelection>().is_err());
        assert!("middle".parse::<AddressSelection>().is_err());
    }
}
