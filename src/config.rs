//! Client configuration: cluster id and replica addresses.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use crate::constants::{ClusterId, REPLICAS_MAX};
use crate::error::{Error, Result};

/// Port assumed for an address given without one.
pub const DEFAULT_PORT: u16 = 3001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub cluster: ClusterId,
    /// Replica addresses, indexed by replica number.
    pub addresses: Vec<SocketAddr>,
}

impl Config {
    pub fn new(cluster: ClusterId, addresses: Vec<SocketAddr>) -> Result<Self> {
        if addresses.is_empty() {
            return Err(Error::NoAddresses);
        }
        if addresses.len() > REPLICAS_MAX {
            return Err(Error::AddressLimitExceeded {
                count: addresses.len(),
            });
        }
        Ok(Self { cluster, addresses })
    }

    /// Parses a comma-separated address list.
    ///
    /// Each element is `host:port`, a bare port (on localhost), or a bare IP address (on
    /// [`DEFAULT_PORT`]).
    ///
    /// ```
    /// use ledger_client::Config;
    ///
    /// let config = Config::parse(0, "3001,127.0.0.1:3002,10.0.0.3").unwrap();
    /// assert_eq!(config.addresses[0].to_string(), "127.0.0.1:3001");
    /// assert_eq!(config.addresses[2].to_string(), "10.0.0.3:3001");
    /// ```
    pub fn parse(cluster: ClusterId, addresses: &str) -> Result<Self> {
        let parsed = addresses
            .split(',')
            .map(str::trim)
            .filter(|element| !element.is_empty())
            .map(parse_address)
            .collect::<Result<Vec<_>>>()?;
        Self::new(cluster, parsed)
    }

    #[inline]
    pub fn replica_count(&self) -> u8 {
        self.addresses.len() as u8
    }
}

fn parse_address(element: &str) -> Result<SocketAddr> {
    if let Ok(address) = element.parse::<SocketAddr>() {
        return Ok(address);
    }
    if let Ok(port) = element.parse::<u16>() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    if let Ok(ip) = element.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    // Host names resolve once, here.
    element
        .to_socket_addrs()
        .ok()
        .and_then(|mut resolved| resolved.next())
        .ok_or_else(|| Error::InvalidAddress(element.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::proptest_cases;
    use proptest::prelude::*;

    #[test]
    fn parses_every_element_form() {
        let config = Config::parse(3, "3001, 127.0.0.2:4000,[::1]:5000,10.1.2.3,::1").expect("parse");
        let rendered: Vec<String> = config.addresses.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "127.0.0.1:3001",
                "127.0.0.2:4000",
                "[::1]:5000",
                "10.1.2.3:3001",
                "[::1]:3001",
            ]
        );
        assert_eq!(config.cluster, 3);
        assert_eq!(config.replica_count(), 5);
    }

    #[test]
    fn rejects_empty_and_oversized_lists() {
        assert!(matches!(Config::parse(0, ""), Err(Error::NoAddresses)));
        assert!(matches!(Config::parse(0, " , "), Err(Error::NoAddresses)));
        assert!(matches!(
            Config::parse(0, "1,2,3,4,5,6,7"),
            Err(Error::AddressLimitExceeded { count: 7 })
        ));
    }

    #[test]
    fn rejects_garbage() {
        match Config::parse(0, "3001,not an address") {
            Err(Error::InvalidAddress(element)) => assert_eq!(element, "not an address"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            Config::parse(0, "70000"),
            Err(Error::InvalidAddress(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(proptest_cases(128)))]

        #[test]
        fn prop_bare_ports_map_to_localhost(ports in prop::collection::vec(1u16.., 1..=REPLICAS_MAX)) {
            let list = ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",");
            let config = Config::parse(0, &list).expect("parse");
            prop_assert_eq!(config.addresses.len(), ports.len());
            for (address, port) in config.addresses.iter().zip(&ports) {
                prop_assert_eq!(address.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
                prop_assert_eq!(address.port(), *port);
            }
        }
    }
}
