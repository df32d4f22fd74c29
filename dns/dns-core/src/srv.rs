//! SRV record parsing and RFC 2782 ordering.

use crate::record::Record;
use crate::{Error, Result, wire};
use rand::Rng;

/// A service locator record (RFC 2782).
#[derive(Debug, Clone)]
pub struct SrvRecord {
    host: String,
    priority: u16,
    weight: u16,
    port: u16,
    /// Running weight sum within the record's priority group, maintained by
    /// the sorter.
    pub(crate) weight_sum: u32,
}

impl SrvRecord {
    pub(crate) fn parse(answer: &[u8], rdata: &[u8]) -> Result<Self> {
        let priority = wire::read_u16(rdata, 0)?;
        let weight = wire::read_u16(rdata, 2)?;
        let port = wire::read_u16(rdata, 4)?;

        let (host, _) = wire::expand_name(answer, rdata, 6)?;

        // RFC 2782: a target of "." means the service is decidedly not
        // available at this domain
        if host.is_empty() {
            return Err(Error::Malformed("SRV target is the root domain"));
        }

        Ok(Self {
            host,
            priority,
            weight,
            port,
            weight_sum: 0,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn weight(&self) -> u16 {
        self.weight
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Order SRV records as RFC 2782 requires.
///
/// Records are grouped by ascending priority. Within a group, zero weight
/// records move to the head of the working list, then records are drawn by
/// weighted random selection: the first record whose running weight sum
/// reaches a uniform pick in `[1, total]` is appended to the output and the
/// selection repeats over the remainder. A remainder whose total weight is
/// zero is appended as-is.
pub(crate) fn sort(records: &mut Vec<Record>) {
    let (mut srvs, rest): (Vec<_>, Vec<_>) = std::mem::take(records)
        .into_iter()
        .partition(|record| record.srv().is_some());

    let mut sorted = Vec::with_capacity(srvs.len());

    while !srvs.is_empty() {
        let cur_priority = srvs
            .iter()
            .map(|record| record.srv().unwrap().priority)
            .min()
            .unwrap();

        let mut group = Vec::new();
        let mut remaining = Vec::with_capacity(srvs.len());
        let mut nonzero = Vec::new();

        for record in srvs {
            let srv = record.srv().unwrap();

            if srv.priority != cur_priority {
                remaining.push(record);
            } else if srv.weight == 0 {
                group.push(record);
            } else {
                nonzero.push(record);
            }
        }

        group.append(&mut nonzero);
        srvs = remaining;

        while !group.is_empty() {
            let mut total = 0u32;
            for record in &mut group {
                let srv = record.srv_mut().unwrap();
                total += u32::from(srv.weight);
                srv.weight_sum = total;
            }

            // Only zero weight records remain, append them in their
            // current order and move on to the next priority
            if total == 0 {
                sorted.append(&mut group);
                break;
            }

            let pick = rand::rng().random_range(1..=total);
            let idx = group
                .iter()
                .position(|record| record.srv().unwrap().weight_sum >= pick)
                .unwrap();

            sorted.push(group.remove(idx));
        }
    }

    sorted.extend(rest);
    *records = sorted;
}
