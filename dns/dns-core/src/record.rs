use crate::naptr::NaptrRecord;
use crate::srv::SrvRecord;
use crate::txt::TxtRecord;
use crate::{Result, rr};
use bytes::Bytes;

/// A single resource record of a [`DnsResult`](crate::DnsResult).
///
/// Every record carries its raw RDATA. Types the engine understands (SRV,
/// NAPTR, TXT) are additionally parsed into a typed view at the time the
/// record is added; records which fail that parse are dropped by the backend
/// and never surface in a result.
#[derive(Debug, Clone)]
pub struct Record {
    rr_type: u16,
    rr_class: u16,
    ttl: u32,
    data: Bytes,
    kind: RecordKind,
}

/// Typed view of a [`Record`].
#[derive(Debug, Clone)]
pub enum RecordKind {
    Generic,
    Srv(SrvRecord),
    Naptr(NaptrRecord),
    Txt(TxtRecord),
}

impl Record {
    /// Parse a record from its RDATA in the context of the full DNS answer,
    /// which is needed to expand compressed domain names.
    pub(crate) fn parse(
        answer: &[u8],
        rr_type: u16,
        rr_class: u16,
        ttl: u32,
        rdata: &[u8],
    ) -> Result<Self> {
        let kind = match rr_type {
            rr::SRV => RecordKind::Srv(SrvRecord::parse(answer, rdata)?),
            rr::NAPTR => RecordKind::Naptr(NaptrRecord::parse(answer, rdata)?),
            rr::TXT => RecordKind::Txt(TxtRecord::parse(rdata)?),
            _ => RecordKind::Generic,
        };

        Ok(Self {
            rr_type,
            rr_class,
            ttl,
            data: Bytes::copy_from_slice(rdata),
            kind,
        })
    }

    pub fn rr_type(&self) -> u16 {
        self.rr_type
    }

    pub fn rr_class(&self) -> u16 {
        self.rr_class
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// The raw RDATA of the record.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    /// Typed view of an SRV record.
    pub fn srv(&self) -> Option<&SrvRecord> {
        match &self.kind {
            RecordKind::Srv(srv) => Some(srv),
            _ => None,
        }
    }

    pub(crate) fn srv_mut(&mut self) -> Option<&mut SrvRecord> {
        match &mut self.kind {
            RecordKind::Srv(srv) => Some(srv),
            _ => None,
        }
    }

    /// Typed view of a NAPTR record.
    pub fn naptr(&self) -> Option<&NaptrRecord> {
        match &self.kind {
            RecordKind::Naptr(naptr) => Some(naptr),
            _ => None,
        }
    }

    /// Typed view of a TXT record.
    pub fn txt(&self) -> Option<&TxtRecord> {
        match &self.kind {
            RecordKind::Txt(txt) => Some(txt),
            _ => None,
        }
    }
}
