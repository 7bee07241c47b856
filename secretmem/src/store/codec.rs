//! Record framing for the shared buffer: records stored back to back as
//! `[id_len][secret_len][id bytes][secret bytes]` until end-of-buffer,
//! with no terminator. Length fields are eight little-endian bytes, a
//! deliberate fixed-width choice so processes of differing word sizes
//! agree on the framing (the historical format used the host's native
//! integer width).

use crate::errors::StoreError;

pub(crate) const LEN_BYTES: usize = 8;
pub(crate) const HEADER_BYTES: usize = 2 * LEN_BYTES;

struct RawRecord<'a> {
    id: &'a [u8],
    secret: &'a [u8],
    /// Encoded size of this record including its header.
    total: usize,
}

fn field(value: u64) -> Result<usize, StoreError> {
    usize::try_from(value)
        .map_err(|_| StoreError::Corrupted("declared length exceeds address space".into()))
}

/// Decodes the record at the start of `buf`, validating every declared
/// length against the bytes actually present. Buffers that fail these
/// checks are treated as store corruption, never read past.
fn parse_record(buf: &[u8]) -> Result<RawRecord<'_>, StoreError> {
    if buf.len() < HEADER_BYTES {
        return Err(StoreError::Corrupted(format!(
            "truncated record header: {} bytes remaining",
            buf.len()
        )));
    }
    let id_len = field(u64::from_le_bytes(buf[..LEN_BYTES].try_into().unwrap()))?;
    let secret_len = field(u64::from_le_bytes(
        buf[LEN_BYTES..HEADER_BYTES].try_into().unwrap(),
    ))?;

    let total = id_len
        .checked_add(secret_len)
        .and_then(|n| n.checked_add(HEADER_BYTES))
        .filter(|&n| n <= buf.len())
        .ok_or_else(|| {
            StoreError::Corrupted(format!(
                "record declares {} + {} bytes but only {} remain",
                id_len,
                secret_len,
                buf.len() - HEADER_BYTES
            ))
        })?;

    Ok(RawRecord {
        id: &buf[HEADER_BYTES..HEADER_BYTES + id_len],
        secret: &buf[HEADER_BYTES + id_len..total],
        total,
    })
}

/// Linear scan for `id`. First match wins; a well-formed buffer never
/// contains duplicates (the rewrite path enforces that), a malformed one
/// is at worst read leniently here.
pub(crate) fn lookup<'a>(mut buf: &'a [u8], id: &[u8]) -> Result<Option<&'a [u8]>, StoreError> {
    while !buf.is_empty() {
        let record = parse_record(buf)?;
        if record.id == id {
            return Ok(Some(record.secret));
        }
        buf = &buf[record.total..];
    }
    Ok(None)
}

/// Builds the buffer that replaces `buf` after writing `secret` under
/// `id`: every record except the target is copied in its original order,
/// then the replacement is appended iff the new secret is non-empty. An
/// absent or empty secret is exactly a delete; a record with an empty
/// secret is never persisted.
pub(crate) fn rewrite(
    mut buf: &[u8],
    id: &[u8],
    secret: Option<&[u8]>,
) -> Result<Vec<u8>, StoreError> {
    let appended = secret.map_or(0, |s| HEADER_BYTES + id.len() + s.len());
    let mut out = Vec::new();
    out.try_reserve(buf.len() + appended)
        .map_err(|_| StoreError::Allocation)?;

    while !buf.is_empty() {
        let record = parse_record(buf)?;
        if record.id != id {
            out.extend_from_slice(&buf[..record.total]);
        }
        buf = &buf[record.total..];
    }

    if let Some(secret) = secret {
        if !secret.is_empty() {
            append_record(&mut out, id, secret);
        }
    }
    Ok(out)
}

fn append_record(out: &mut Vec<u8>, id: &[u8], secret: &[u8]) {
    out.extend_from_slice(&(id.len() as u64).to_le_bytes());
    out.extend_from_slice(&(secret.len() as u64).to_le_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(secret);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(mut buf: &[u8]) -> Vec<Vec<u8>> {
        let mut found = Vec::new();
        while !buf.is_empty() {
            let record = parse_record(buf).unwrap();
            found.push(record.id.to_vec());
            buf = &buf[record.total..];
        }
        found
    }

    #[test]
    fn round_trip() {
        let buf = rewrite(&[], b"alice", Some(b"s3cr3t")).unwrap();
        assert_eq!(lookup(&buf, b"alice").unwrap(), Some(&b"s3cr3t"[..]));
        assert_eq!(lookup(&buf, b"bob").unwrap(), None);
    }

    #[test]
    fn empty_secret_deletes() {
        let buf = rewrite(&[], b"alice", Some(b"s3cr3t")).unwrap();
        let buf = rewrite(&buf, b"alice", None).unwrap();
        assert!(buf.is_empty());
        assert_eq!(lookup(&buf, b"alice").unwrap(), None);

        let buf = rewrite(&[], b"alice", Some(b"s3cr3t")).unwrap();
        let buf = rewrite(&buf, b"alice", Some(b"")).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn records_are_independent() {
        let buf = rewrite(&[], b"a", Some(b"1")).unwrap();
        let buf = rewrite(&buf, b"b", Some(b"22")).unwrap();
        assert_eq!(lookup(&buf, b"a").unwrap(), Some(&b"1"[..]));
        assert_eq!(lookup(&buf, b"b").unwrap(), Some(&b"22"[..]));
        assert_eq!(ids(&buf), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn overwrite_replaces_without_duplicating() {
        let buf = rewrite(&[], b"a", Some(b"1")).unwrap();
        let buf = rewrite(&buf, b"b", Some(b"x")).unwrap();
        let buf = rewrite(&buf, b"a", Some(b"2")).unwrap();
        assert_eq!(lookup(&buf, b"a").unwrap(), Some(&b"2"[..]));
        // The overwritten id appears exactly once, re-appended at the end.
        assert_eq!(ids(&buf), vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn oversized_id_length_is_corruption() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1000u64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(b"short");
        match lookup(&buf, b"anything") {
            Err(StoreError::Corrupted(_)) => {}
            other => panic!("expected Corrupted, got {:?}", other),
        }
        match rewrite(&buf, b"anything", Some(b"v")) {
            Err(StoreError::Corrupted(_)) => {}
            other => panic!("expected Corrupted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn truncated_header_is_corruption() {
        let good = rewrite(&[], b"alice", Some(b"s3cr3t")).unwrap();
        let mut bad = good.clone();
        bad.extend_from_slice(&[0u8; 7]);
        match lookup(&bad, b"bob") {
            Err(StoreError::Corrupted(_)) => {}
            other => panic!("expected Corrupted, got {:?}", other),
        }
    }

    #[test]
    fn length_overflow_is_corruption() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u64::MAX.to_le_bytes());
        buf.extend_from_slice(&u64::MAX.to_le_bytes());
        match lookup(&buf, b"x") {
            Err(StoreError::Corrupted(_)) => {}
            other => panic!("expected Corrupted, got {:?}", other),
        }
    }

    #[test]
    fn first_match_wins_on_malformed_duplicates() {
        let mut buf = Vec::new();
        append_record(&mut buf, b"dup", b"first");
        append_record(&mut buf, b"dup", b"second");
        assert_eq!(lookup(&buf, b"dup").unwrap(), Some(&b"first"[..]));
    }
}
