//! NAPTR record parsing, validation and ordering (RFC 2915 / RFC 3403).
//!
//! Validation here is deliberately strict. A record which cannot be used
//! safely (broken flags, unparsable service field, bogus substitution
//! expression) is rejected wholesale instead of being passed through to
//! consumers half-trusted.

use crate::record::Record;
use crate::{Error, Result, wire};

/// Terminal flags which are mutually exclusive within a single record.
const TERMINAL_FLAGS: [char; 4] = ['s', 'a', 'u', 'p'];

/// Longest accepted protocol / resolution service token (RFC 3958 keeps
/// these short).
const MAX_SERVICE_TOKEN: usize = 32;

/// A naming authority pointer record.
#[derive(Debug, Clone)]
pub struct NaptrRecord {
    order: u16,
    preference: u16,
    flags: String,
    service: String,
    regexp: String,
    replacement: String,
}

impl NaptrRecord {
    pub(crate) fn parse(answer: &[u8], rdata: &[u8]) -> Result<Self> {
        let order = wire::read_u16(rdata, 0)?;
        let preference = wire::read_u16(rdata, 2)?;

        let mut pos = 4;
        let flags = read_string(rdata, &mut pos)?;
        let service = read_string(rdata, &mut pos)?;
        let regexp = read_string(rdata, &mut pos)?;

        let (replacement, _) = wire::expand_name(answer, rdata, pos)?;

        validate_flags(&flags)?;
        validate_service(&service)?;
        validate_regexp(&regexp)?;

        if !regexp.is_empty() && !replacement.is_empty() {
            return Err(Error::Malformed(
                "NAPTR record has both a regexp and a replacement",
            ));
        }

        Ok(Self {
            order,
            preference,
            flags,
            service,
            regexp,
            replacement,
        })
    }

    pub fn order(&self) -> u16 {
        self.order
    }

    pub fn preference(&self) -> u16 {
        self.preference
    }

    pub fn flags(&self) -> &str {
        &self.flags
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn regexp(&self) -> &str {
        &self.regexp
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }
}

/// Read one length prefixed character string from the RDATA.
fn read_string(rdata: &[u8], pos: &mut usize) -> Result<String> {
    let len = *rdata
        .get(*pos)
        .ok_or(Error::Malformed("NAPTR record data too short"))? as usize;

    let bytes = rdata
        .get(*pos + 1..*pos + 1 + len)
        .ok_or(Error::Malformed("NAPTR string overruns record"))?;

    *pos += 1 + len;

    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn validate_flags(flags: &str) -> Result<()> {
    if !flags.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::Malformed("NAPTR flags contain non-alphanumerics"));
    }

    let terminal = flags
        .chars()
        .filter(|c| TERMINAL_FLAGS.contains(&c.to_ascii_lowercase()))
        .count();

    if terminal > 1 {
        return Err(Error::Malformed("NAPTR flags clash"));
    }

    Ok(())
}

/// `service` is empty or "protocol" optionally followed by "+rs" resolution
/// services. Every token starts with a letter and holds only alphanumerics.
fn validate_service(service: &str) -> Result<()> {
    if service.is_empty() {
        return Ok(());
    }

    for token in service.split('+') {
        let mut chars = token.chars();

        let leading_alpha = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
        if !leading_alpha
            || token.len() > MAX_SERVICE_TOKEN
            || !chars.all(|c| c.is_ascii_alphanumeric())
        {
            return Err(Error::Malformed("NAPTR service is not well formed"));
        }
    }

    Ok(())
}

/// `regexp` is empty or a `delim pattern delim replacement delim flags`
/// substitution expression.
fn validate_regexp(regexp: &str) -> Result<()> {
    if regexp.is_empty() {
        return Ok(());
    }

    let mut chars = regexp.chars();
    let delim = chars.next().unwrap();

    if !delim.is_ascii_graphic() || delim.is_ascii_alphanumeric() || delim == '\\' {
        return Err(Error::Malformed("NAPTR regexp delimiter is not usable"));
    }

    // Split on unescaped delimiters only, "\!" does not end a part
    let mut parts = vec![String::new()];
    let mut escaped = false;
    for c in chars {
        if escaped {
            escaped = false;
            parts.last_mut().unwrap().push('\\');
            parts.last_mut().unwrap().push(c);
        } else if c == '\\' {
            escaped = true;
        } else if c == delim {
            parts.push(String::new());
        } else {
            parts.last_mut().unwrap().push(c);
        }
    }

    if escaped {
        return Err(Error::Malformed("NAPTR regexp ends mid-escape"));
    }

    // delim pattern delim replacement delim flags => three parts
    let [pattern, replacement, flags] = parts.as_slice() else {
        return Err(Error::Malformed("NAPTR regexp has a bad delimiter count"));
    };

    // Case insensitive matching is the only substitution flag in use
    if !flags.chars().all(|c| c.eq_ignore_ascii_case(&'i')) {
        return Err(Error::Malformed("NAPTR regexp carries unknown flags"));
    }

    if pattern.contains("\\0") || replacement.contains("\\0") {
        return Err(Error::Malformed("NAPTR regexp uses the \\0 backreference"));
    }

    if regex::Regex::new(pattern).is_err() {
        return Err(Error::Malformed("NAPTR regexp pattern does not compile"));
    }

    Ok(())
}

/// Order NAPTR records by `(order, preference)`, both ascending. The sort is
/// stable, equal records keep their arrival order.
pub(crate) fn sort(records: &mut Vec<Record>) {
    let (mut naptrs, rest): (Vec<_>, Vec<_>) = std::mem::take(records)
        .into_iter()
        .partition(|record| record.naptr().is_some());

    naptrs.sort_by_key(|record| {
        let naptr = record.naptr().unwrap();
        (naptr.order, naptr.preference)
    });

    naptrs.extend(rest);
    *records = naptrs;
}
