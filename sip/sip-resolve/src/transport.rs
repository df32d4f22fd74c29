use std::fmt;

/// A SIP transport, address family included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Udp6,
    Tcp6,
    Tls6,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "UDP",
            Transport::Tcp => "TCP",
            Transport::Tls => "TLS",
            Transport::Udp6 => "UDP6",
            Transport::Tcp6 => "TCP6",
            Transport::Tls6 => "TLS6",
        }
    }

    /// The port assumed when an address omits one.
    pub fn default_port(&self) -> u16 {
        match self {
            Transport::Tls | Transport::Tls6 => 5061,
            _ => 5060,
        }
    }

    /// The IPv6 variant of the transport.
    pub fn ipv6(self) -> Self {
        match self {
            Transport::Udp => Transport::Udp6,
            Transport::Tcp => Transport::Tcp6,
            Transport::Tls => Transport::Tls6,
            v6 => v6,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Transport::Udp6 | Transport::Tcp6 | Transport::Tls6)
    }

    /// The NAPTR service steering SIP onto this transport (RFC 3263).
    pub(crate) fn naptr_service(self) -> Option<&'static str> {
        match self {
            Transport::Udp => Some("sip+d2u"),
            Transport::Tcp => Some("sip+d2t"),
            Transport::Tls => Some("sips+d2t"),
            _ => None,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which transports the embedding SIP stack can actually send on.
///
/// Filled in once at startup; the resolver never emits an address for a
/// transport that is not available.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvailableTransports {
    udp: bool,
    tcp: bool,
    tls: bool,
    udp6: bool,
    tcp6: bool,
    tls6: bool,
}

impl AvailableTransports {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            udp: true,
            tcp: true,
            tls: true,
            udp6: true,
            tcp6: true,
            tls6: true,
        }
    }

    pub fn with(mut self, transport: Transport) -> Self {
        self.enable(transport);
        self
    }

    pub fn enable(&mut self, transport: Transport) {
        match transport {
            Transport::Udp => self.udp = true,
            Transport::Tcp => self.tcp = true,
            Transport::Tls => self.tls = true,
            Transport::Udp6 => self.udp6 = true,
            Transport::Tcp6 => self.tcp6 = true,
            Transport::Tls6 => self.tls6 = true,
        }
    }

    pub fn is_available(&self, transport: Transport) -> bool {
        match transport {
            Transport::Udp => self.udp,
            Transport::Tcp => self.tcp,
            Transport::Tls => self.tls,
            Transport::Udp6 => self.udp6,
            Transport::Tcp6 => self.tcp6,
            Transport::Tls6 => self.tls6,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_ports() {
        assert_eq!(Transport::Udp.default_port(), 5060);
        assert_eq!(Transport::Tcp.default_port(), 5060);
        assert_eq!(Transport::Tls.default_port(), 5061);
        assert_eq!(Transport::Tls6.default_port(), 5061);
    }

    #[test]
    fn ipv6_promotion() {
        assert_eq!(Transport::Udp.ipv6(), Transport::Udp6);
        assert_eq!(Transport::Tls.ipv6(), Transport::Tls6);
        assert_eq!(Transport::Tcp6.ipv6(), Transport::Tcp6);
    }

    #[test]
    fn availability_table() {
        let available = AvailableTransports::none()
            .with(Transport::Udp)
            .with(Transport::Tls6);

        assert!(available.is_available(Transport::Udp));
        assert!(available.is_available(Transport::Tls6));
        assert!(!available.is_available(Transport::Tcp));
        assert!(!available.is_available(Transport::Udp6));
    }
}
