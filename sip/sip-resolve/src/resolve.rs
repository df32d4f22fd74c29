//! The RFC 3263 server location state machine.
//!
//! Resolution runs in passes. Every pass resolves one query set in
//! parallel, then walks the answers in the order the queries were added,
//! which is what establishes preference. Records may produce follow-up
//! queries (NAPTR steers onto SRV, SRV drills down to A/AAAA) which form
//! the next pass; addresses gathered by a later pass supersede those of
//! earlier ones, exactly as drilling down dictates.

use crate::task::TaskQueue;
use crate::transport::{AvailableTransports, Transport};
use crate::{Error, MAX_ADDRESSES, ResolveCallback, ServerAddress, SipTarget};
use dns_core::{Dns, NaptrRecord, QuerySet, rr};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

/// Transport and port a query's answers will be combined with.
#[derive(Debug, Clone, Copy)]
struct QueryTarget {
    /// `None` when the caller did not pin a transport, in which case NAPTR
    /// answers decide.
    transport: Option<Transport>,
    port: u16,
}

/// Query set and targets assembled for the next pass.
#[derive(Default)]
struct Pending {
    set: Option<QuerySet>,
    targets: Vec<QueryTarget>,
}

struct ResolveJob {
    dns: Dns,
    transports: AvailableTransports,
    queue: TaskQueue,
    /// Targets paired 1:1 with the queries of the in-flight set.
    targets: Mutex<Vec<QueryTarget>>,
    pending: Mutex<Pending>,
    addresses: Mutex<Vec<ServerAddress>>,
    callback: Mutex<Option<ResolveCallback>>,
}

fn parse_literal(host: &str) -> Option<IpAddr> {
    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        return Some(IpAddr::V4(v4));
    }

    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<Ipv6Addr>()
        .ok()
        .map(IpAddr::V6)
}

pub(crate) fn start(
    dns: Dns,
    transports: AvailableTransports,
    queue: TaskQueue,
    target: SipTarget,
    callback: ResolveCallback,
) {
    log::debug!("Performing SIP DNS resolution of target '{}'", target.host);

    let literal = parse_literal(&target.host);

    // Determine the transport to use if none has been explicitly specified
    let mut transport = target.transport;
    if transport.is_none() {
        if target.secure {
            transport = Some(Transport::Tls);
        } else if target.reliable {
            transport = Some(Transport::Tcp);
        } else if literal.is_some() || target.port.is_some() {
            // RFC 3263: an explicit IP address or an explicit port means UDP
            transport = Some(Transport::Udp);
        }

        if matches!(literal, Some(IpAddr::V6(_))) {
            transport = transport.map(Transport::ipv6);
        }
    }

    match transport {
        Some(transport) => {
            log::debug!(
                "Transport type for target '{}' is '{transport}'",
                target.host
            )
        }
        None => log::debug!("Transport type for target '{}' is unspecified", target.host),
    }

    // A literal address needs no resolution at all
    if let Some(ip) = literal {
        let transport = transport.unwrap_or(Transport::Udp);
        let port = target.port.unwrap_or_else(|| transport.default_port());

        let address = ServerAddress {
            transport,
            address: SocketAddr::new(ip, port),
        };

        log::debug!(
            "Target '{}' is an IP address, skipping resolution",
            target.host
        );

        queue.post(move || callback(Ok(vec![address])));
        return;
    }

    let job = Arc::new(ResolveJob {
        dns,
        transports,
        queue,
        targets: Mutex::new(Vec::new()),
        pending: Mutex::new(Pending::default()),
        addresses: Mutex::new(Vec::new()),
        callback: Mutex::new(Some(callback)),
    });

    let host = &target.host;
    let port = target.port.unwrap_or(0);

    // Without an explicit port NAPTR and SRV records get a say
    if target.port.is_none() {
        job.add(host, rr::NAPTR, transport, 0);

        if matches!(transport, None | Some(Transport::Tls))
            && (job.available(Transport::Tls) || job.available(Transport::Tls6))
        {
            job.add(
                &format!("_sips._tcp.{host}"),
                rr::SRV,
                Some(Transport::Tls),
                0,
            );
        }

        if matches!(transport, None | Some(Transport::Tcp))
            && (job.available(Transport::Tcp) || job.available(Transport::Tcp6))
        {
            job.add(
                &format!("_sip._tcp.{host}"),
                rr::SRV,
                Some(Transport::Tcp),
                0,
            );
        }

        if matches!(transport, None | Some(Transport::Udp))
            && (job.available(Transport::Udp) || job.available(Transport::Udp6))
        {
            job.add(
                &format!("_sip._udp.{host}"),
                rr::SRV,
                Some(Transport::Udp),
                0,
            );
        }
    }

    // The host itself resolves to addresses, respecting availability
    let aaaa_allowed = match transport {
        None => job.available(Transport::Udp6),
        Some(t) => job.available(t.ipv6()),
    };
    if aaaa_allowed {
        let t = transport.map_or(Transport::Udp6, Transport::ipv6);
        job.add(host, rr::AAAA, Some(t), port);
    }

    let a_allowed = match transport {
        None => job.available(Transport::Udp),
        Some(t) => job.available(t),
    };
    if a_allowed {
        job.add(host, rr::A, Some(transport.unwrap_or(Transport::Udp)), port);
    }

    if !job.launch() {
        log::debug!(
            "No queries could be composed for target '{}'",
            target.host
        );
        job.finish();
    }
}

impl ResolveJob {
    fn available(&self, transport: Transport) -> bool {
        self.transports.is_available(transport)
    }

    /// Queue a question for the next pass, paired with the transport and
    /// port its answers inherit.
    fn add(&self, name: &str, rr_type: u16, transport: Option<Transport>, port: u16) {
        let mut pending = self.pending.lock();
        let Pending { set, targets } = &mut *pending;

        let set = set.get_or_insert_with(|| self.dns.query_set());

        let port = if port != 0 {
            port
        } else {
            transport.map_or(5060, |t| t.default_port())
        };

        if let Err(e) = set.add(name, rr_type, rr::class::IN) {
            log::error!("Failed to add DNS query for '{name}': {e}");
            return;
        }

        targets.push(QueryTarget { transport, port });

        log::debug!(
            "Added target '{name}' with record type '{rr_type}', transport '{}', and port '{port}'",
            transport.map_or("unspecified", |t| t.as_str()),
        );
    }

    /// Start resolving the pending pass. Returns false when there is none.
    fn launch(self: &Arc<Self>) -> bool {
        let Pending { set, targets } = std::mem::take(&mut *self.pending.lock());

        let Some(set) = set else {
            return false;
        };

        *self.targets.lock() = targets;

        let job = self.clone();
        let result = set.resolve_async(Box::new(move |set| job.pass_completed(set)), Arc::new(()));

        if let Err(e) = result {
            log::error!("Failed to start parallel SIP resolution: {e}");
            self.finish();
        }

        true
    }

    /// Walk one completed pass, fold its answers into the address list and
    /// collect follow-up queries.
    fn pass_completed(self: &Arc<Self>, set: &QuerySet) {
        log::debug!("All parallel queries completed");

        let targets = std::mem::take(&mut *self.targets.lock());

        let mut addresses: Vec<ServerAddress> = Vec::new();
        let mut have_naptr = false;
        let mut have_srv = false;
        let mut strict_order: Option<u16> = None;

        // The order queries were added in defines the preference of the
        // records within this pass
        for (idx, target) in targets.iter().enumerate() {
            let Some(query) = set.query(idx) else {
                continue;
            };

            let Some(result) = query.result() else {
                log::debug!(
                    "No result information for target '{}' of type '{}'",
                    query.name(),
                    query.rr_type()
                );
                continue;
            };

            for record in result.records() {
                match record.rr_type() {
                    rr::A | rr::AAAA => {
                        // Anything discovered through NAPTR or SRV takes
                        // preference over plain host addresses
                        if have_naptr || have_srv {
                            log::debug!(
                                "Address record being skipped on target '{}' because NAPTR or SRV record exists",
                                query.name()
                            );
                            continue;
                        }

                        if addresses.len() == MAX_ADDRESSES {
                            continue;
                        }

                        let ip: IpAddr = if record.rr_type() == rr::A {
                            let Ok(octets) = <[u8; 4]>::try_from(record.data()) else {
                                continue;
                            };
                            Ipv4Addr::from(octets).into()
                        } else {
                            let Ok(octets) = <[u8; 16]>::try_from(record.data()) else {
                                continue;
                            };
                            Ipv6Addr::from(octets).into()
                        };

                        addresses.push(ServerAddress {
                            transport: target.transport.unwrap_or(Transport::Udp),
                            address: SocketAddr::new(ip, target.port),
                        });
                    }
                    rr::SRV => {
                        if have_naptr {
                            log::debug!(
                                "SRV record being skipped on target '{}' because NAPTR record exists",
                                query.name()
                            );
                            continue;
                        }

                        let Some(srv) = record.srv() else { continue };
                        let transport = target.transport.unwrap_or(Transport::Udp);

                        // SRV records just create new queries for AAAA+A
                        if self.available(transport.ipv6()) {
                            self.add(srv.host(), rr::AAAA, Some(transport.ipv6()), srv.port());
                            have_srv = true;
                        }

                        if self.available(transport) {
                            self.add(srv.host(), rr::A, Some(transport), srv.port());
                            have_srv = true;
                        }
                    }
                    rr::NAPTR => {
                        let Some(naptr) = record.naptr() else { continue };

                        if let Some(order) = strict_order
                            && naptr.order() != order
                        {
                            log::debug!(
                                "NAPTR record skipped because order '{}' does not match strict order '{order}'",
                                naptr.order()
                            );
                            continue;
                        }

                        let mut added = false;

                        if matches!(target.transport, None | Some(Transport::Udp)) {
                            added |= self.handle_naptr(naptr, Transport::Udp);
                        }
                        if matches!(target.transport, None | Some(Transport::Tcp)) {
                            added |= self.handle_naptr(naptr, Transport::Tcp);
                        }
                        if matches!(target.transport, None | Some(Transport::Tls)) {
                            added |= self.handle_naptr(naptr, Transport::Tls);
                        }

                        // Once a record is accepted, later records must
                        // share its order
                        if added {
                            have_naptr = true;
                            strict_order = Some(naptr.order());
                        }
                    }
                    _ => {}
                }
            }
        }

        *self.addresses.lock() = addresses;

        if self.pending.lock().set.is_some() {
            log::debug!("New queries added, performing parallel resolution again");
            self.launch();
            return;
        }

        log::debug!(
            "Resolution completed - {} viable targets",
            self.addresses.lock().len()
        );

        self.finish();
    }

    /// Steer one NAPTR record onto `transport` (RFC 3263). Returns whether
    /// a follow-up SRV query was added.
    fn handle_naptr(&self, naptr: &NaptrRecord, transport: Transport) -> bool {
        let Some(service) = transport.naptr_service() else {
            return false;
        };

        if !naptr.service().eq_ignore_ascii_case(service) {
            return false;
        }

        if !self.available(transport) && !self.available(transport.ipv6()) {
            return false;
        }

        if !naptr.flags().eq_ignore_ascii_case("s") {
            log::debug!(
                "NAPTR service {service} received with unsupported flags '{}'",
                naptr.flags()
            );
            return false;
        }

        if naptr.replacement().is_empty() {
            return false;
        }

        self.add(naptr.replacement(), rr::SRV, Some(transport), 0);

        true
    }

    /// Post the final outcome onto the SIP layer's task queue.
    fn finish(&self) {
        let addresses = std::mem::take(&mut *self.addresses.lock());

        let Some(callback) = self.callback.lock().take() else {
            return;
        };

        for (idx, address) in addresses.iter().enumerate() {
            log::debug!(
                "Address '{idx}' is {} with transport '{}'",
                address.address,
                address.transport
            );
        }

        self.queue.post(move || {
            if addresses.is_empty() {
                callback(Err(Error::NoAnswer));
            } else {
                callback(Ok(addresses));
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ServerAddresses, SipResolver};
    use dns_core::rcode;
    use dns_core::test_helpers::{StaticAnswer, StaticResolver, TestString, naptr_rdata};
    use std::sync::mpsc;
    use std::time::Duration;

    fn naptr_record(order: u16, flags: &'static str, service: &'static str, replacement: &str) -> Vec<u8> {
        naptr_rdata(
            order,
            10,
            &TestString::new(flags.len() as u8, flags),
            &TestString::new(service.len() as u8, service),
            &TestString::new(0, ""),
            replacement,
        )
    }

    fn sip_resolver(
        seed: impl FnOnce(&StaticResolver),
        transports: AvailableTransports,
    ) -> SipResolver {
        let backend = StaticResolver::new(0);
        seed(&backend);

        let dns = Dns::new();
        dns.register(backend).unwrap();

        SipResolver::new(dns, transports).unwrap()
    }

    fn resolve(resolver: &SipResolver, target: SipTarget) -> Result<ServerAddresses, Error> {
        let (tx, rx) = mpsc::channel();

        resolver.resolve(target, Box::new(move |result| tx.send(result).unwrap()));

        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn literal_ipv4_short_circuits() {
        let resolver = sip_resolver(|_| {}, AvailableTransports::all());

        let addresses = resolve(&resolver, SipTarget::host("127.0.0.1")).unwrap();

        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].transport, Transport::Udp);
        assert_eq!(addresses[0].address, "127.0.0.1:5060".parse().unwrap());
    }

    #[test]
    fn literal_ipv4_keeps_explicit_port() {
        let resolver = sip_resolver(|_| {}, AvailableTransports::all());

        let target = SipTarget {
            port: Some(5080),
            ..SipTarget::host("127.0.0.1")
        };

        let addresses = resolve(&resolver, target).unwrap();

        assert_eq!(addresses[0].address, "127.0.0.1:5080".parse().unwrap());
    }

    #[test]
    fn literal_secure_gets_tls_and_its_port() {
        let resolver = sip_resolver(|_| {}, AvailableTransports::all());

        let target = SipTarget {
            secure: true,
            ..SipTarget::host("127.0.0.1")
        };

        let addresses = resolve(&resolver, target).unwrap();

        assert_eq!(addresses[0].transport, Transport::Tls);
        assert_eq!(addresses[0].address, "127.0.0.1:5061".parse().unwrap());
    }

    #[test]
    fn literal_ipv6_upgrades_the_transport() {
        let resolver = sip_resolver(|_| {}, AvailableTransports::all());

        let addresses = resolve(&resolver, SipTarget::host("::1")).unwrap();

        assert_eq!(addresses[0].transport, Transport::Udp6);
        assert_eq!(addresses[0].address, "[::1]:5060".parse().unwrap());
    }

    #[test]
    fn plain_host_falls_through_to_addresses() {
        let resolver = sip_resolver(
            |backend| {
                let mut a = StaticAnswer::new(rcode::NOERROR);
                a.a(Ipv4Addr::new(192, 0, 2, 10), 60);
                backend.insert("plain.test", rr::A, a);

                let mut aaaa = StaticAnswer::new(rcode::NOERROR);
                aaaa.aaaa("2001:db8::10".parse().unwrap(), 60);
                backend.insert("plain.test", rr::AAAA, aaaa);
            },
            AvailableTransports::all(),
        );

        let addresses = resolve(&resolver, SipTarget::host("plain.test")).unwrap();

        // AAAA was queried before A, its addresses are preferred
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].transport, Transport::Udp6);
        assert_eq!(addresses[0].address, "[2001:db8::10]:5060".parse().unwrap());
        assert_eq!(addresses[1].transport, Transport::Udp);
        assert_eq!(addresses[1].address, "192.0.2.10:5060".parse().unwrap());
    }

    #[test]
    fn srv_records_override_host_addresses() {
        let resolver = sip_resolver(
            |backend| {
                let mut srv = StaticAnswer::new(rcode::NOERROR);
                srv.srv(10, 10, 5090, "node.srv.test", 60);
                backend.insert("_sip._udp.srv.test", rr::SRV, srv);

                let mut node = StaticAnswer::new(rcode::NOERROR);
                node.a(Ipv4Addr::new(192, 0, 2, 20), 60);
                backend.insert("node.srv.test", rr::A, node);

                // Must not surface, the SRV drill-down wins
                let mut direct = StaticAnswer::new(rcode::NOERROR);
                direct.a(Ipv4Addr::new(192, 0, 2, 99), 60);
                backend.insert("srv.test", rr::A, direct);
            },
            AvailableTransports::all(),
        );

        let addresses = resolve(&resolver, SipTarget::host("srv.test")).unwrap();

        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].transport, Transport::Udp);
        assert_eq!(addresses[0].address, "192.0.2.20:5090".parse().unwrap());
    }

    #[test]
    fn naptr_steers_transport_and_latches_order() {
        let resolver = sip_resolver(
            |backend| {
                let mut naptr = StaticAnswer::new(rcode::NOERROR);
                naptr.record(
                    rr::NAPTR,
                    rr::class::IN,
                    60,
                    naptr_record(10, "s", "SIP+D2T", "_sip._tcp.naptr.test"),
                );
                // Different order, must be rejected by the strict order rule
                naptr.record(
                    rr::NAPTR,
                    rr::class::IN,
                    60,
                    naptr_record(20, "s", "SIP+D2U", "_sip._udp.naptr.test"),
                );
                backend.insert("naptr.test", rr::NAPTR, naptr);

                let mut tcp_srv = StaticAnswer::new(rcode::NOERROR);
                tcp_srv.srv(10, 10, 5070, "tcp.naptr.test", 60);
                backend.insert("_sip._tcp.naptr.test", rr::SRV, tcp_srv);

                let mut udp_srv = StaticAnswer::new(rcode::NOERROR);
                udp_srv.srv(10, 10, 5071, "udp.naptr.test", 60);
                backend.insert("_sip._udp.naptr.test", rr::SRV, udp_srv);

                let mut tcp_node = StaticAnswer::new(rcode::NOERROR);
                tcp_node.a(Ipv4Addr::new(192, 0, 2, 30), 60);
                backend.insert("tcp.naptr.test", rr::A, tcp_node);

                let mut udp_node = StaticAnswer::new(rcode::NOERROR);
                udp_node.a(Ipv4Addr::new(192, 0, 2, 31), 60);
                backend.insert("udp.naptr.test", rr::A, udp_node);
            },
            AvailableTransports::all(),
        );

        let addresses = resolve(&resolver, SipTarget::host("naptr.test")).unwrap();

        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].transport, Transport::Tcp);
        assert_eq!(addresses[0].address, "192.0.2.30:5070".parse().unwrap());
    }

    #[test]
    fn unusable_naptr_flags_are_ignored() {
        let resolver = sip_resolver(
            |backend| {
                let mut naptr = StaticAnswer::new(rcode::NOERROR);
                naptr.record(
                    rr::NAPTR,
                    rr::class::IN,
                    60,
                    naptr_record(10, "a", "SIP+D2U", "replacement.test"),
                );
                backend.insert("flags.test", rr::NAPTR, naptr);

                let mut a = StaticAnswer::new(rcode::NOERROR);
                a.a(Ipv4Addr::new(192, 0, 2, 40), 60);
                backend.insert("flags.test", rr::A, a);
            },
            AvailableTransports::all(),
        );

        // The NAPTR record is not usable ("a" flag unsupported), plain
        // addresses fall through
        let addresses = resolve(&resolver, SipTarget::host("flags.test")).unwrap();

        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].address, "192.0.2.40:5060".parse().unwrap());
    }

    #[test]
    fn nothing_resolvable_is_no_answer() {
        let resolver = sip_resolver(|_| {}, AvailableTransports::all());

        let result = resolve(&resolver, SipTarget::host("ghost.test"));

        assert!(matches!(result, Err(Error::NoAnswer)));
    }

    #[test]
    fn unavailable_transports_compose_no_queries() {
        let resolver = sip_resolver(
            |backend| {
                let mut a = StaticAnswer::new(rcode::NOERROR);
                a.a(Ipv4Addr::new(192, 0, 2, 50), 60);
                backend.insert("tcponly.test", rr::A, a);
            },
            AvailableTransports::none().with(Transport::Tcp),
        );

        // An explicit port pins the transport to UDP, which is unavailable
        let target = SipTarget {
            port: Some(5060),
            ..SipTarget::host("tcponly.test")
        };

        assert!(matches!(resolve(&resolver, target), Err(Error::NoAnswer)));

        // Asking for a reliable transport matches the available TCP
        let target = SipTarget {
            reliable: true,
            ..SipTarget::host("tcponly.test")
        };

        let addresses = resolve(&resolver, target).unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].transport, Transport::Tcp);
        assert_eq!(addresses[0].address, "192.0.2.50:5060".parse().unwrap());
    }
}
