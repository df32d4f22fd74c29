use crate::record::Record;
use crate::{Error, Result, rcode};
use bytes::Bytes;

/// The outcome of a completed DNS query.
///
/// Results are built up by the backend through
/// [`Query::set_result`](crate::Query::set_result) and
/// [`Query::add_record`](crate::Query::add_record) and become immutable once
/// the query signals completion.
#[derive(Debug)]
pub struct DnsResult {
    secure: bool,
    bogus: bool,
    rcode: u16,
    canonical: String,
    answer: Bytes,
    records: Vec<Record>,
}

impl DnsResult {
    pub(crate) fn new(
        secure: bool,
        bogus: bool,
        rcode: u16,
        canonical: &str,
        answer: &[u8],
    ) -> Result<Self> {
        if secure && bogus {
            return Err(Error::InvalidArgument(
                "a result can not be both secure and bogus",
            ));
        }

        if canonical.is_empty() {
            return Err(Error::InvalidArgument("no canonical name was provided"));
        }

        if answer.is_empty() {
            return Err(Error::InvalidArgument("no DNS answer was provided"));
        }

        Ok(Self {
            secure,
            bogus,
            rcode,
            canonical: canonical.to_owned(),
            answer: Bytes::copy_from_slice(answer),
            records: Vec::new(),
        })
    }

    /// Whether the answer was validated (DNSSEC).
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// Whether the answer failed validation (DNSSEC).
    pub fn bogus(&self) -> bool {
        self.bogus
    }

    /// The DNS response code of the answer.
    pub fn rcode(&self) -> u16 {
        self.rcode
    }

    /// Canonical name of what was resolved.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// The raw answer exactly as the backend received it over the wire.
    pub fn answer(&self) -> &[u8] {
        &self.answer
    }

    pub(crate) fn answer_bytes(&self) -> Bytes {
        self.answer.clone()
    }

    /// The records of the answer, in sorted order for record types the
    /// engine sorts (SRV, NAPTR) and in insertion order for all others.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub(crate) fn push_record(&mut self, record: Record) {
        self.records.push(record);
    }

    pub(crate) fn records_mut(&mut self) -> &mut Vec<Record> {
        &mut self.records
    }

    /// The smallest non-zero TTL across all records, or 0 when there are no
    /// records or the answer is NXDOMAIN.
    pub fn lowest_ttl(&self) -> u32 {
        if self.rcode == rcode::NXDOMAIN {
            return 0;
        }

        self.records
            .iter()
            .map(Record::ttl)
            .filter(|ttl| *ttl > 0)
            .min()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rr;

    #[test]
    fn secure_and_bogus_rejected() {
        assert!(DnsResult::new(true, true, 0, "example.test", b"x").is_err());
        assert!(DnsResult::new(true, false, 0, "example.test", b"x").is_ok());
        assert!(DnsResult::new(false, true, 0, "example.test", b"x").is_ok());
    }

    #[test]
    fn empty_fields_rejected() {
        assert!(DnsResult::new(false, false, 0, "", b"x").is_err());
        assert!(DnsResult::new(false, false, 0, "example.test", b"").is_err());
    }

    #[test]
    fn lowest_ttl_ignores_zero() {
        let mut result = DnsResult::new(false, false, 0, "example.test", b"x").unwrap();

        assert_eq!(result.lowest_ttl(), 0);

        for ttl in [0, 45, 10] {
            let record = Record::parse(b"", rr::A, rr::class::IN, ttl, &[127, 0, 0, 1]).unwrap();
            result.push_record(record);
        }

        assert_eq!(result.lowest_ttl(), 10);
    }

    #[test]
    fn lowest_ttl_is_zero_for_nxdomain() {
        let mut result =
            DnsResult::new(false, false, rcode::NXDOMAIN, "example.test", b"x").unwrap();
        let record = Record::parse(b"", rr::A, rr::class::IN, 300, &[127, 0, 0, 1]).unwrap();
        result.push_record(record);

        assert_eq!(result.lowest_ttl(), 0);
    }
}
