use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use super::{City, Club, EchoClub, Port, WarpClub};
use crate::protocol::{H1InboundHandler, InboundHandler};
use crate::types::{Error, PortConfig, Result, WarpConfig};

/// City that routes by longest matching URI prefix.
#[derive(Debug)]
pub struct RouteCity {
    name: String,
    routes: Vec<(String, Arc<dyn Club>)>,
}

impl RouteCity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
        }
    }

    pub fn route(mut self, prefix: impl Into<String>, club: Arc<dyn Club>) -> Self {
        self.routes.push((prefix.into(), club));
        // longest prefix first
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    /// Echo everywhere, except the warp prefix when a warp route is set.
    pub fn from_config(warp: Option<&WarpConfig>) -> Self {
        let city = RouteCity::new("*");
        match warp {
            Some(warp) if warp.prefix == "/" => city.route("/", Arc::new(WarpClub::from_config(warp))),
            Some(warp) => city
                .route("/", Arc::new(EchoClub))
                .route(warp.prefix.clone(), Arc::new(WarpClub::from_config(warp))),
            None => city.route("/", Arc::new(EchoClub)),
        }
    }
}

impl City for RouteCity {
    fn name(&self) -> &str {
        &self.name
    }

    fn find_club(&self, uri: &str) -> Option<Arc<dyn Club>> {
        self.routes
            .iter()
            .find(|(prefix, _)| uri.starts_with(prefix.as_str()))
            .map(|(_, club)| Arc::clone(club))
    }
}

/// Port built from configuration. Every host lands in the same city.
#[derive(Debug)]
pub struct ConfiguredPort {
    addr: SocketAddr,
    protocol: String,
    secure: bool,
    lenient: bool,
    permit: Vec<Permit>,
    city: Arc<dyn City>,
}

/// One admitted network: the leading `bits` of `net` must match the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Permit {
    net: IpAddr,
    bits: u8,
}

impl Permit {
    /// Accepts `10.0.0.0/8`, `10.0.0.1`, `::1` and whole-octet prefixes
    /// like `10.0.` or `192.168`.
    fn parse(entry: &str) -> Result<Self> {
        let bad = || Error::config(format!("invalid permit entry {:?}", entry));
        if let Some((addr, bits)) = entry.split_once('/') {
            let net: IpAddr = addr.parse().map_err(|_| bad())?;
            let bits: u8 = bits.parse().map_err(|_| bad())?;
            if bits > width(net) {
                return Err(bad());
            }
            return Ok(Self { net, bits });
        }
        if let Ok(net) = entry.parse::<IpAddr>() {
            return Ok(Self { net, bits: width(net) });
        }
        let octets = entry
            .trim_end_matches('.')
            .split('.')
            .map(str::parse::<u8>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| bad())?;
        if octets.len() > 4 {
            return Err(bad());
        }
        let mut full = [0u8; 4];
        full[..octets.len()].copy_from_slice(&octets);
        Ok(Self {
            net: IpAddr::V4(Ipv4Addr::from(full)),
            bits: 8 * octets.len() as u8,
        })
    }

    fn admits(&self, ip: IpAddr) -> bool {
        let (net, ip, width) = match (self.net, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => (u128::from(u32::from(net)), u128::from(u32::from(ip)), 32),
            (IpAddr::V6(net), IpAddr::V6(ip)) => (u128::from(net), u128::from(ip), 128),
            _ => return false,
        };
        if self.bits == 0 {
            return true;
        }
        let shift = width - u32::from(self.bits);
        net >> shift == ip >> shift
    }
}

fn width(ip: IpAddr) -> u8 {
    if ip.is_ipv4() {
        32
    } else {
        128
    }
}

impl ConfiguredPort {
    pub fn new(config: &PortConfig, city: Arc<dyn City>) -> Result<Self> {
        Ok(Self {
            addr: config.socket_addr()?,
            protocol: config.protocol.clone(),
            secure: config.secure,
            lenient: config.lenient,
            permit: config
                .permit
                .iter()
                .map(|entry| Permit::parse(entry))
                .collect::<Result<_>>()?,
            city,
        })
    }

    /// One port per configured entry, sharing the configured route table.
    pub fn from_config(ports: &[PortConfig], warp: Option<&WarpConfig>) -> Result<Vec<Arc<dyn Port>>> {
        let city: Arc<dyn City> = Arc::new(RouteCity::from_config(warp));
        ports
            .iter()
            .map(|p| Ok(Arc::new(ConfiguredPort::new(p, Arc::clone(&city))?) as Arc<dyn Port>))
            .collect()
    }
}

impl Port for ConfiguredPort {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn secure(&self) -> bool {
        self.secure
    }

    fn check_admitted(&self, peer: Option<SocketAddr>) -> bool {
        if self.permit.is_empty() {
            return true;
        }
        let Some(peer) = peer else {
            return false;
        };
        self.permit.iter().any(|permit| permit.admits(peer.ip()))
    }

    fn find_city(&self, _host: &str) -> Option<Arc<dyn City>> {
        Some(Arc::clone(&self.city))
    }

    fn new_handler(&self) -> Box<dyn InboundHandler> {
        if self.lenient {
            Box::new(H1InboundHandler::new_lenient())
        } else {
            Box::new(H1InboundHandler::default())
        }
    }

    fn reload_cert(&self) -> Result<()> {
        if self.secure {
            tracing::info!(port = %self.addr, "certificate reload requested");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(permit: &[&str]) -> ConfiguredPort {
        let config = PortConfig {
            addr: "127.0.0.1:0".into(),
            protocol: "h1".into(),
            secure: false,
            permit: permit.iter().map(|s| s.to_string()).collect(),
            lenient: false,
        };
        ConfiguredPort::new(&config, Arc::new(RouteCity::from_config(None))).unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let warp = WarpConfig {
            upstream: "127.0.0.1:9".into(),
            prefix: "/api".into(),
            timeout_secs: 5,
        };
        let city = RouteCity::from_config(Some(&warp));
        assert_eq!(city.find_club("/api/users").unwrap().name(), "warp");
        assert_eq!(city.find_club("/index.html").unwrap().name(), "echo");
    }

    #[test]
    fn permit_filters_peers() {
        let open = port(&[]);
        assert!(open.check_admitted(None));

        let local = port(&["127."]);
        assert!(local.check_admitted(Some("127.0.0.1:5000".parse().unwrap())));
        assert!(!local.check_admitted(Some("10.0.0.1:5000".parse().unwrap())));
        assert!(!local.check_admitted(None));
    }

    #[test]
    fn permit_matches_whole_octets() {
        let peer = |ip: &str| Some(SocketAddr::new(ip.parse().unwrap(), 5000));

        let single = port(&["10.0.0.1"]);
        assert!(single.check_admitted(peer("10.0.0.1")));
        assert!(!single.check_admitted(peer("10.0.0.15")));
        assert!(!single.check_admitted(peer("10.0.0.100")));

        let prefix = port(&["10.0.0"]);
        assert!(prefix.check_admitted(peer("10.0.0.15")));
        assert!(!prefix.check_admitted(peer("10.0.1.1")));

        let block = port(&["192.168.4.0/22"]);
        assert!(block.check_admitted(peer("192.168.7.255")));
        assert!(!block.check_admitted(peer("192.168.8.1")));

        let mapped = port(&["127.0.0.1"]);
        assert!(mapped.check_admitted(peer("::ffff:127.0.0.1")));
        assert!(!mapped.check_admitted(peer("::1")));
    }

    #[test]
    fn bad_permit_entry_is_a_config_error() {
        for entry in ["", "10.0.0.256", "10.0.0.0/33", "host.example"] {
            let config = PortConfig {
                addr: "127.0.0.1:0".into(),
                protocol: "h1".into(),
                secure: false,
                permit: vec![entry.to_string()],
                lenient: false,
            };
            let city = Arc::new(RouteCity::from_config(None));
            assert!(
                matches!(ConfiguredPort::new(&config, city), Err(Error::Config(_))),
                "{:?}",
                entry
            );
        }
    }

    #[test]
    fn lenient_port_hands_out_lenient_handlers() {
        let strict = port(&[]);
        assert!(!strict.new_handler().lenient());

        let config = PortConfig {
            addr: "127.0.0.1:0".into(),
            protocol: "h1".into(),
            secure: false,
            permit: Vec::new(),
            lenient: true,
        };
        let lenient = ConfiguredPort::new(&config, Arc::new(RouteCity::from_config(None))).unwrap();
        assert!(lenient.new_handler().lenient());
    }
}
