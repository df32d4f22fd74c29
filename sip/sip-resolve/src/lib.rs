//! SIP server location per RFC 3263.
//!
//! Given a SIP target (host, optional port, optional transport and the
//! secure/reliable hints of the URI) the resolver composes NAPTR, SRV and
//! A/AAAA lookups through the DNS engine and delivers an ordered list of
//! `(transport, address)` pairs to try.
//!
//! Callbacks always run on a thread owned by this crate's task queue,
//! never on a DNS backend thread.

mod resolve;
mod task;
mod transport;

pub use transport::{AvailableTransports, Transport};

use dns_core::Dns;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use task::TaskQueue;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resolution produced no viable addresses")]
    NoAnswer,
    #[error(transparent)]
    Dns(#[from] dns_core::Error),
}

/// Upper bound of addresses delivered per resolution.
pub const MAX_ADDRESSES: usize = 16;

/// One resolved place to reach the target at, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerAddress {
    pub transport: Transport,
    pub address: SocketAddr,
}

pub type ServerAddresses = Vec<ServerAddress>;

/// Callback delivering the outcome of a resolution, invoked exactly once.
pub type ResolveCallback = Box<dyn FnOnce(Result<ServerAddresses>) + Send>;

/// What to resolve.
#[derive(Debug, Clone)]
pub struct SipTarget {
    /// Hostname or literal IP address.
    pub host: String,
    /// Explicit port of the URI, if any. Suppresses NAPTR/SRV lookups.
    pub port: Option<u16>,
    /// Explicitly requested transport, if any.
    pub transport: Option<Transport>,
    /// The target must be reached securely (sips).
    pub secure: bool,
    /// The target asked for a reliable transport.
    pub reliable: bool,
}

impl SipTarget {
    /// A target consisting of just a host, everything else unspecified.
    pub fn host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            transport: None,
            secure: false,
            reliable: false,
        }
    }
}

/// The RFC 3263 resolver.
///
/// Cheap to clone; all clones share the DNS engine handle, the transport
/// availability table and the callback task queue.
#[derive(Clone)]
pub struct SipResolver {
    inner: Arc<Inner>,
}

struct Inner {
    dns: Dns,
    transports: AvailableTransports,
    queue: TaskQueue,
}

impl SipResolver {
    /// Create a resolver issuing queries through `dns` and restricted to
    /// the given available transports.
    pub fn new(dns: Dns, transports: AvailableTransports) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                dns,
                transports,
                queue: TaskQueue::spawn()?,
            }),
        })
    }

    /// Resolve `target` into an ordered list of server addresses.
    ///
    /// The callback is invoked exactly once, with the addresses in
    /// preference order or [`Error::NoAnswer`] when nothing viable was
    /// found.
    #[tracing::instrument(skip(self, target, callback), fields(host = %target.host))]
    pub fn resolve(&self, target: SipTarget, callback: ResolveCallback) {
        resolve::start(
            self.inner.dns.clone(),
            self.inner.transports,
            self.inner.queue.clone(),
            target,
            callback,
        );
    }
}
