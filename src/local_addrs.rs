//! Local address lookup
//!
//! Decides whether a datagram's destination is this host, in which case it is
//! delivered locally instead of being tunnelled.

use std::collections::HashSet;
use std::io;
use std::net::IpAddr;

pub trait LocalAddrs: Send + Sync {
    fn is_local(&self, ip: IpAddr) -> io::Result<bool>;
}

/// Queries the host's interfaces on every lookup, so address changes are
/// picked up without a restart
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAddrs;

impl LocalAddrs for SystemAddrs {
    fn is_local(&self, ip: IpAddr) -> io::Result<bool> {
        let ip = ip.to_canonical();
        let interfaces = get_if_addrs::get_if_addrs()?;
        if interfaces.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no local IP addresses",
            ));
        }
        Ok(interfaces.iter().any(|iface| iface.ip() == ip))
    }
}

/// Fixed address set
#[derive(Debug, Default, Clone)]
pub struct StaticAddrs {
    addrs: HashSet<IpAddr>,
}

impl StaticAddrs {
    pub fn new(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addrs: addrs.into_iter().collect(),
        }
    }
}

impl LocalAddrs for StaticAddrs {
    fn is_local(&self, ip: IpAddr) -> io::Result<bool> {
        Ok(self.addrs.contains(&ip.to_canonical()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_membership() {
        let addrs = StaticAddrs::new([IpAddr::from([10, 0, 0, 1])]);
        assert!(addrs.is_local(IpAddr::from([10, 0, 0, 1])).unwrap());
        assert!(addrs.is_local("::ffff:10.0.0.1".parse().unwrap()).unwrap());
        assert!(!addrs.is_local(IpAddr::from([10, 0, 0, 2])).unwrap());
    }

    #[test]
    fn test_loopback_is_local() {
        assert!(SystemAddrs.is_local(IpAddr::from([127, 0, 0, 1])).unwrap());
    }
}
