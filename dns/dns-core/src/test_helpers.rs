//! Fixture builders and mock resolvers for DNS tests.
//!
//! Enabled for this crate's own tests and, through the `test-helpers`
//! feature, for the test suites of crates building on the engine.

use crate::query::Query;
use crate::resolver::Resolver;
use crate::{Error, Result, rcode, rr};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// A length prefixed character string whose declared length may deliberately
/// disagree with the actual value, for off-nominal fixtures.
#[derive(Debug, Clone, Copy)]
pub struct TestString {
    pub len: u8,
    pub val: &'static str,
}

impl TestString {
    pub fn new(len: u8, val: &'static str) -> Self {
        Self { len, val }
    }
}

/// Append `string` to `buf`: the declared length byte followed by the
/// actual bytes of the value.
pub fn write_string(string: &TestString, buf: &mut Vec<u8>) {
    buf.push(string.len);
    buf.extend_from_slice(string.val.as_bytes());
}

/// Append `name` to `buf` as uncompressed DNS labels.
pub fn write_domain(name: &str, buf: &mut Vec<u8>) {
    for label in name.split('.').filter(|label| !label.is_empty()) {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }

    buf.push(0);
}

/// Build the RDATA of an SRV record.
pub fn srv_rdata(priority: u16, weight: u16, port: u16, host: &str) -> Vec<u8> {
    let mut buf = Vec::new();

    buf.extend_from_slice(&priority.to_be_bytes());
    buf.extend_from_slice(&weight.to_be_bytes());
    buf.extend_from_slice(&port.to_be_bytes());
    write_domain(host, &mut buf);

    buf
}

/// Build the RDATA of a NAPTR record.
pub fn naptr_rdata(
    order: u16,
    preference: u16,
    flags: &TestString,
    services: &TestString,
    regexp: &TestString,
    replacement: &str,
) -> Vec<u8> {
    let mut buf = Vec::new();

    buf.extend_from_slice(&order.to_be_bytes());
    buf.extend_from_slice(&preference.to_be_bytes());
    write_string(flags, &mut buf);
    write_string(services, &mut buf);
    write_string(regexp, &mut buf);
    write_domain(replacement, &mut buf);

    buf
}

/// One canned answer of a [`StaticResolver`].
#[derive(Debug, Clone, Default)]
pub struct StaticAnswer {
    rcode: u16,
    records: Vec<(u16, u16, u32, Vec<u8>)>,
}

impl StaticAnswer {
    pub fn new(rcode: u16) -> Self {
        Self {
            rcode,
            records: Vec::new(),
        }
    }

    /// Append a record with explicit type, class, TTL and RDATA.
    pub fn record(&mut self, rr_type: u16, rr_class: u16, ttl: u32, rdata: Vec<u8>) -> &mut Self {
        self.records.push((rr_type, rr_class, ttl, rdata));
        self
    }

    pub fn a(&mut self, addr: Ipv4Addr, ttl: u32) -> &mut Self {
        self.record(rr::A, rr::class::IN, ttl, addr.octets().to_vec())
    }

    pub fn aaaa(&mut self, addr: Ipv6Addr, ttl: u32) -> &mut Self {
        self.record(rr::AAAA, rr::class::IN, ttl, addr.octets().to_vec())
    }

    pub fn srv(&mut self, priority: u16, weight: u16, port: u16, host: &str, ttl: u32) -> &mut Self {
        self.record(rr::SRV, rr::class::IN, ttl, srv_rdata(priority, weight, port, host))
    }
}

/// A resolver answering from a table of canned answers.
///
/// Unknown questions complete with an empty NXDOMAIN answer. Resolutions
/// run on a short lived thread of their own, like a real backend would.
/// Cancellation always fails, by the time it is attempted the answer is
/// already on its way.
pub struct StaticResolver {
    priority: u16,
    zones: Mutex<HashMap<(String, u16), StaticAnswer>>,
}

impl StaticResolver {
    pub fn new(priority: u16) -> Arc<Self> {
        Arc::new(Self {
            priority,
            zones: Mutex::new(HashMap::new()),
        })
    }

    /// Seed the answer for a `(name, rr_type)` question.
    pub fn insert(&self, name: &str, rr_type: u16, answer: StaticAnswer) {
        self.zones.lock().insert((name.to_owned(), rr_type), answer);
    }
}

impl Resolver for StaticResolver {
    fn name(&self) -> &str {
        "static"
    }

    fn priority(&self) -> u16 {
        self.priority
    }

    fn resolve(&self, query: &Arc<Query>) -> Result<()> {
        let answer = self
            .zones
            .lock()
            .get(&(query.name().to_owned(), query.rr_type()))
            .cloned();

        let query = query.clone();

        std::thread::spawn(move || {
            let answer = answer.unwrap_or_else(|| StaticAnswer::new(rcode::NXDOMAIN));

            let raw: Vec<u8> = answer
                .records
                .iter()
                .flat_map(|(_, _, _, rdata)| rdata.iter().copied())
                .collect();
            let raw = if raw.is_empty() { b"empty".to_vec() } else { raw };

            if query
                .set_result(false, false, answer.rcode, query.name(), &raw)
                .is_err()
            {
                query.completed();
                return;
            }

            for (rr_type, rr_class, ttl, rdata) in &answer.records {
                if let Err(e) = query.add_record(*rr_type, *rr_class, *ttl, rdata) {
                    log::debug!("Dropping record of static answer: {e}");
                }
            }

            query.completed();
        });

        Ok(())
    }

    fn cancel(&self, _query: &Query) -> Result<()> {
        Err(Error::Backend("resolution already finished".into()))
    }
}

/// A resolver which never completes a query on its own.
///
/// Queries pile up until [`complete_all`](ManualResolver::complete_all)
/// finishes them with an empty answer. Cancellation succeeds and removes
/// the query, its callback will never run.
pub struct ManualResolver {
    priority: u16,
    pending: Mutex<Vec<Arc<Query>>>,
}

impl ManualResolver {
    pub fn new(priority: u16) -> Arc<Self> {
        Arc::new(Self {
            priority,
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Number of queries currently held.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Complete every held query with an empty NXDOMAIN answer.
    pub fn complete_all(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());

        for query in pending {
            let _ = query.set_result(false, false, rcode::NXDOMAIN, query.name(), b"empty");
            query.completed();
        }
    }
}

impl Resolver for ManualResolver {
    fn name(&self) -> &str {
        "manual"
    }

    fn priority(&self) -> u16 {
        self.priority
    }

    fn resolve(&self, query: &Arc<Query>) -> Result<()> {
        self.pending.lock().push(query.clone());
        Ok(())
    }

    fn cancel(&self, query: &Query) -> Result<()> {
        let mut pending = self.pending.lock();

        let pos = pending
            .iter()
            .position(|held| std::ptr::eq(Arc::as_ptr(held), query));

        match pos {
            Some(pos) => {
                pending.remove(pos);
                Ok(())
            }
            None => Err(Error::Backend("query is not pending".into())),
        }
    }
}
