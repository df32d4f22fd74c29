//! Wire format helpers shared by the record parsers.
//!
//! Record data never stands alone. Compressed domain names inside RDATA
//! reference offsets anywhere in the answer the record arrived in, so every
//! helper here takes both the full answer buffer and the RDATA slice.

use crate::{Error, Result};

/// Longest name accepted when expanding, in presentation format.
const MAX_NAME_LEN: usize = 255;

/// Upper bound of compression pointers followed per name.
const MAX_POINTER_JUMPS: usize = 64;

pub(crate) fn read_u16(data: &[u8], pos: usize) -> Result<u16> {
    let bytes = data
        .get(pos..pos + 2)
        .ok_or(Error::Malformed("record data too short"))?;

    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Expand a possibly compressed domain name starting at `start` in `rdata`.
///
/// Returns the name in dotted presentation format (the root name expands to
/// an empty string) and the number of RDATA bytes the encoded name occupied.
pub(crate) fn expand_name(answer: &[u8], rdata: &[u8], start: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut buf = rdata;
    let mut pos = start;
    let mut consumed = None;
    let mut jumps = 0;

    loop {
        let len = *buf.get(pos).ok_or(Error::Malformed("truncated domain name"))? as usize;

        match len {
            0 => {
                let consumed = consumed.unwrap_or(pos + 1 - start);
                return Ok((name, consumed));
            }
            1..=63 => {
                let label = buf
                    .get(pos + 1..pos + 1 + len)
                    .ok_or(Error::Malformed("domain name label overruns record"))?;

                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(&String::from_utf8_lossy(label));

                if name.len() > MAX_NAME_LEN {
                    return Err(Error::Malformed("domain name exceeds maximum length"));
                }

                pos += len + 1;
            }
            _ if len & 0xC0 == 0xC0 => {
                let low = *buf
                    .get(pos + 1)
                    .ok_or(Error::Malformed("truncated compression pointer"))?
                    as usize;

                if consumed.is_none() {
                    consumed = Some(pos + 2 - start);
                }

                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(Error::Malformed("compression pointer loop"));
                }

                pos = ((len & 0x3F) << 8) | low;
                buf = answer;
            }
            _ => return Err(Error::Malformed("unsupported domain name label type")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn encode(name: &str) -> Vec<u8> {
        let mut buf = vec![];
        for label in name.split('.').filter(|l| !l.is_empty()) {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf
    }

    #[test]
    fn plain_name() {
        let rdata = encode("goose.feathers");
        let (name, consumed) = expand_name(&[], &rdata, 0).unwrap();

        assert_eq!(name, "goose.feathers");
        assert_eq!(consumed, rdata.len());
    }

    #[test]
    fn root_name() {
        let (name, consumed) = expand_name(&[], &[0], 0).unwrap();

        assert_eq!(name, "");
        assert_eq!(consumed, 1);
    }

    #[test]
    fn compressed_name() {
        // "feathers" lives at offset 4 of the answer, the rdata holds
        // "goose" plus a pointer back into the answer
        let mut answer = vec![0, 0, 0, 0];
        answer.extend_from_slice(&encode("feathers"));

        let mut rdata = vec![5];
        rdata.extend_from_slice(b"goose");
        rdata.extend_from_slice(&[0xC0, 4]);

        let (name, consumed) = expand_name(&answer, &rdata, 0).unwrap();

        assert_eq!(name, "goose.feathers");
        assert_eq!(consumed, rdata.len());
    }

    #[test]
    fn pointer_loop_rejected() {
        // A pointer at offset 0 referencing itself
        let answer = vec![0xC0, 0];

        assert!(expand_name(&answer, &answer, 0).is_err());
    }

    #[test]
    fn truncated_label_rejected() {
        assert!(expand_name(&[], &[5, b'a'], 0).is_err());
        assert!(expand_name(&[], &[], 0).is_err());
    }
}
