//! hickory-resolver backend for the trunkline DNS engine.
//!
//! The backend owns a [`TokioResolver`] together with a dedicated
//! single-worker runtime: all lookups run and complete on that runtime's
//! thread, never on the caller's. Results are translated record by record
//! into the engine's typed representation.

mod config;

pub use config::{ConfigError, HickoryConfig, PathOrSystem};

use dns_core::{Error, Query, Resolver, Result, rcode, rr};
use hickory_resolver::TokioResolver;
use hickory_resolver::config::{NameServerConfig, ResolverConfig};
use hickory_resolver::lookup::Lookup;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::proto::op::Message;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::proto::serialize::binary::{BinEncodable, BinEncoder};
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{ResolveError, system_conf};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::runtime;
use tokio_util::sync::CancellationToken;

/// Registered name of the backend.
pub const NAME: &str = "hickory";

/// Registered priority of the backend.
pub const PRIORITY: u16 = 100;

const PHASE_PENDING: u8 = 0;
const PHASE_DONE: u8 = 1;
const PHASE_CANCELLED: u8 = 2;

/// Per query data stored on the engine's query object.
struct QueryData {
    token: CancellationToken,
    phase: Arc<AtomicU8>,
}

/// The resolver context plus the runtime whose worker thread drives it.
/// Swapped wholesale on reload.
struct Backend {
    runtime: runtime::Runtime,
    resolver: TokioResolver,
}

/// A [`Resolver`] backend performing real lookups through hickory.
pub struct HickoryResolver {
    backend: RwLock<Arc<Backend>>,
}

impl HickoryResolver {
    /// Create the backend with default configuration (system resolv.conf
    /// and hosts).
    pub fn new() -> std::result::Result<Self, ConfigError> {
        Self::with_config(HickoryConfig::default())
    }

    /// Create the backend from a configuration file.
    pub fn from_config_file(path: &Path) -> std::result::Result<Self, ConfigError> {
        Self::with_config(HickoryConfig::load(path)?)
    }

    /// Create the backend from an already parsed configuration.
    pub fn with_config(config: HickoryConfig) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            backend: RwLock::new(Arc::new(Backend::build(config)?)),
        })
    }

    /// Apply a new configuration.
    ///
    /// Queries already in flight finish on the previous resolver context,
    /// new queries use the new one.
    pub fn reload(&self, config: HickoryConfig) -> std::result::Result<(), ConfigError> {
        let backend = Arc::new(Backend::build(config)?);
        *self.backend.write() = backend;

        Ok(())
    }
}

impl Backend {
    fn build(config: HickoryConfig) -> std::result::Result<Self, ConfigError> {
        if config.debug > 0 {
            log::debug!("Building hickory resolver from {config:?}");
        }

        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("dns-hickory")
            .enable_all()
            .build()?;

        // Entering the runtime lets the resolver grab its spawn handle
        let resolver = {
            let _guard = runtime.enter();
            build_resolver(&config)?
        };

        Ok(Self { runtime, resolver })
    }
}

fn build_resolver(config: &HickoryConfig) -> std::result::Result<TokioResolver, ConfigError> {
    if let Some(PathOrSystem::Path(path)) = &config.hosts {
        // hickory reads the system hosts file on its own, an alternate
        // location is not supported through its resolver API
        log::warn!(
            "Alternate hosts file '{}' is not supported by the hickory backend, using the system hosts file",
            path.display()
        );
    }

    let uses_system_resolv = matches!(config.resolv, Some(PathOrSystem::System));

    #[cfg_attr(not(feature = "dnssec"), allow(unused_mut))]
    let mut builder = if config.nameservers.is_empty() && uses_system_resolv {
        TokioResolver::builder_tokio().map_err(|e| ConfigError::Io(std::io::Error::other(e)))?
    } else {
        let mut resolver_config = ResolverConfig::new();

        // Explicit nameservers first, they take preference
        for nameserver in &config.nameservers {
            let addr = parse_nameserver(nameserver)?;
            resolver_config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
        }

        match &config.resolv {
            Some(PathOrSystem::System) => {
                let (system, _) = system_conf::read_system_conf()
                    .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;

                for nameserver in system.name_servers() {
                    resolver_config.add_name_server(nameserver.clone());
                }
            }
            Some(PathOrSystem::Path(path)) => {
                for addr in parse_resolv_conf(path)? {
                    resolver_config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
                }
            }
            None => {}
        }

        TokioResolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
    };

    if let Some(ta_file) = &config.ta_file {
        #[cfg(feature = "dnssec")]
        {
            log::info!(
                "Enabling DNSSEC validation (trust anchors: '{}')",
                ta_file.display()
            );
            builder.options_mut().validate = true;
        }

        #[cfg(not(feature = "dnssec"))]
        log::warn!(
            "Trust anchor file '{}' configured but the backend was built without the 'dnssec' feature",
            ta_file.display()
        );
    }

    Ok(builder.build())
}

/// Accept `ip` or `ip:port` with 53 as the default port.
fn parse_nameserver(nameserver: &str) -> std::result::Result<SocketAddr, ConfigError> {
    if let Ok(addr) = nameserver.parse::<SocketAddr>() {
        return Ok(addr);
    }

    nameserver
        .parse()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| ConfigError::InvalidNameserver(nameserver.to_owned()))
}

/// Pull the `nameserver` entries out of a resolv.conf style file.
fn parse_resolv_conf(path: &Path) -> std::result::Result<Vec<SocketAddr>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut nameservers = Vec::new();

    for line in content.lines() {
        let line = line.trim();

        if let Some(addr) = line.strip_prefix("nameserver") {
            nameservers.push(parse_nameserver(addr.trim())?);
        }
    }

    Ok(nameservers)
}

impl Resolver for HickoryResolver {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> u16 {
        PRIORITY
    }

    #[tracing::instrument(err, skip(self, query), fields(name = query.name()))]
    fn resolve(&self, query: &Arc<Query>) -> Result<()> {
        let backend = self.backend.read().clone();

        let token = CancellationToken::new();
        let phase = Arc::new(AtomicU8::new(PHASE_PENDING));

        query.set_resolver_data(QueryData {
            token: token.clone(),
            phase: phase.clone(),
        })?;

        let query = query.clone();
        let resolver = backend.resolver.clone();

        backend.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    // Dropping the lookup future is all there is to it, the
                    // engine was promised no callback
                }
                _ = run_lookup(resolver, &query, &phase) => {}
            }
        });

        Ok(())
    }

    fn cancel(&self, query: &Query) -> Result<()> {
        let Some(data) = query.resolver_data::<QueryData>() else {
            return Err(Error::Backend("query carries no backend data".into()));
        };

        if data
            .phase
            .compare_exchange(
                PHASE_PENDING,
                PHASE_CANCELLED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            data.token.cancel();
            Ok(())
        } else {
            Err(Error::Backend("query has already completed".into()))
        }
    }
}

async fn run_lookup(resolver: TokioResolver, query: &Arc<Query>, phase: &AtomicU8) {
    log::debug!(
        "Resolving '{}' type '{}' class '{}'",
        query.name(),
        query.rr_type(),
        query.rr_class()
    );

    // The hickory resolver API only speaks the internet class, anything
    // else completes with a refused answer
    let outcome = if query.rr_class() == rr::class::IN {
        Some(
            resolver
                .lookup(query.name(), RecordType::from(query.rr_type()))
                .await,
        )
    } else {
        None
    };

    // Completion and cancellation race for the phase, the loser backs off
    if phase
        .compare_exchange(PHASE_PENDING, PHASE_DONE, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    match outcome {
        Some(Ok(lookup)) => deliver_lookup(query, &lookup),
        Some(Err(e)) => deliver_empty(query, resolve_error_rcode(&e)),
        None => deliver_empty(query, rcode::REFUSED),
    }

    query.completed();
}

fn deliver_lookup(query: &Query, lookup: &Lookup) {
    // The engine stores the answer wire bytes alongside the records, the
    // record RDATA is emitted uncompressed so no name ever points past it
    let mut message = Message::new();
    message.add_answers(lookup.records().iter().cloned());

    let answer = match message.to_vec() {
        Ok(answer) => answer,
        Err(e) => {
            log::error!("Failed to serialize answer for '{}': {e}", query.name());
            deliver_empty(query, rcode::SERVFAIL);
            return;
        }
    };

    if let Err(e) = query.set_result(false, false, rcode::NOERROR, query.name(), &answer) {
        log::error!("Failed to attach result for '{}': {e}", query.name());
        return;
    }

    for record in lookup.records() {
        let mut rdata = Vec::new();
        let mut encoder = BinEncoder::new(&mut rdata);

        if let Err(e) = record.data().emit(&mut encoder) {
            log::warn!("Failed to re-encode record for '{}': {e}", query.name());
            continue;
        }

        let added = query.add_record(
            u16::from(record.record_type()),
            u16::from(record.dns_class()),
            record.ttl(),
            &rdata,
        );

        // A malformed record is dropped, the query carries on with the rest
        if let Err(e) = added {
            log::debug!("Dropping record of '{}': {e}", query.name());
        }
    }
}

fn deliver_empty(query: &Query, rcode: u16) {
    // No records to carry, a bare header is answer enough
    let answer = Message::new().to_vec().unwrap_or_else(|_| vec![0]);

    if let Err(e) = query.set_result(false, false, rcode, query.name(), &answer) {
        log::error!("Failed to attach result for '{}': {e}", query.name());
    }
}

fn resolve_error_rcode(e: &ResolveError) -> u16 {
    if let Some(proto) = e.proto()
        && let ProtoErrorKind::NoRecordsFound { response_code, .. } = proto.kind()
    {
        return u16::from(response_code.low());
    }

    rcode::SERVFAIL
}

#[cfg(test)]
mod test {
    use super::*;
    use dns_core::Dns;

    /// A backend pointed at a local socket nobody answers on, so lookups
    /// hang until they time out or get cancelled. Keeps the tests off the
    /// host system's resolver configuration too.
    fn silent_backend() -> (HickoryResolver, std::net::UdpSocket) {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();

        let backend = HickoryResolver::with_config(HickoryConfig {
            nameservers: vec![addr.to_string()],
            resolv: None,
            ..HickoryConfig::default()
        })
        .unwrap();

        (backend, socket)
    }

    #[test]
    fn chaos_class_is_refused() {
        let (backend, _socket) = silent_backend();

        let dns = Dns::new();
        dns.register(Arc::new(backend)).unwrap();

        let result = dns
            .resolve("example.test", rr::A, rr::class::CH)
            .unwrap();

        assert_eq!(result.rcode(), rcode::REFUSED);
        assert_eq!(result.records().count(), 0);
    }

    #[test]
    fn cancelled_lookup_never_invokes_the_callback() {
        use std::sync::atomic::AtomicUsize;

        static INVOKED: AtomicUsize = AtomicUsize::new(0);

        let (backend, _socket) = silent_backend();

        let dns = Dns::new();
        dns.register(Arc::new(backend)).unwrap();

        // The nameserver never answers, the lookup sits in its timeout
        // long enough for the cancellation to land first
        let active = dns
            .resolve_async(
                "slow.example.test",
                rr::A,
                rr::class::IN,
                Box::new(|_| {
                    INVOKED.fetch_add(1, Ordering::SeqCst);
                }),
                Arc::new(()),
            )
            .unwrap();

        active.cancel().unwrap();
        assert!(active.cancel().is_err());

        std::thread::sleep(std::time::Duration::from_millis(200));
        assert_eq!(INVOKED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn nameserver_parsing() {
        assert_eq!(
            parse_nameserver("127.0.0.53").unwrap(),
            "127.0.0.53:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_nameserver("192.0.2.1:5353").unwrap(),
            "192.0.2.1:5353".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_nameserver("not-an-ip").is_err());
    }
}
