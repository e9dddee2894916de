//! RESP3 decoder (§4.1): a two-phase scan-then-build pipeline.
//!
//! `frame_len` scans a borrowed `&[u8]` to find the end of the next
//! complete top-level frame without allocating; once a full frame is
//! present, [`decode`] splits exactly that many bytes off the accumulation
//! buffer, freezes them into a `Bytes`, and `parse_frame` walks the frozen
//! copy to build the token tree. Nested aggregates slice the same `Bytes`
//! (an `Arc` bump, not a copy), so decoding never copies payload bytes.

use bytes::{Bytes, BytesMut};

use crate::error::{ParseError, ParseErrorKind};
use crate::resp::token::{Aggregate, RespToken};

const MAX_DEPTH: usize = 999;

#[derive(Clone, Copy)]
enum AggKind {
    Array,
    Map,
    Set,
    Attribute,
    Push,
}

/// Attempts to decode one complete top-level token from `buf`, advancing it
/// past the consumed bytes. Returns `Ok(None)` when `buf` holds an
/// incomplete frame; does not mutate `buf` in that case.
pub fn decode(buf: &mut BytesMut) -> Result<Option<RespToken>, ParseError> {
    match frame_len(buf, 0, 0)? {
        None => Ok(None),
        Some(end) => {
            let frame = buf.split_to(end).freeze();
            let (token, _) = parse_frame(&frame, 0, 0)?;
            Ok(Some(token))
        }
    }
}

fn find_crlf(buf: &[u8], start: usize) -> Option<usize> {
    if start >= buf.len() {
        return None;
    }
    let mut i = start;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn parse_i64_checked(bytes: &[u8], err_at: std::ops::Range<usize>) -> Result<i64, ParseError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ParseError::new(ParseErrorKind::CannotParseInteger, err_at))
}

fn parse_f64_checked(bytes: &[u8], err_at: std::ops::Range<usize>) -> Result<f64, ParseError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| ParseError::new(ParseErrorKind::CannotParseDouble, err_at))
}

fn validate_big_number(bytes: &[u8], err_at: std::ops::Range<usize>) -> Result<(), ParseError> {
    let digits = match bytes.first() {
        Some(b'+') | Some(b'-') => &bytes[1..],
        _ => bytes,
    };
    if !digits.is_empty() && digits.iter().all(u8::is_ascii_digit) {
        Ok(())
    } else {
        Err(ParseError::new(ParseErrorKind::CannotParseBigNumber, err_at))
    }
}

// --- scan phase: validates structure and computes the end offset ---

fn frame_len(buf: &[u8], pos: usize, depth: usize) -> Result<Option<usize>, ParseError> {
    if pos >= buf.len() {
        return Ok(None);
    }
    match buf[pos] {
        b'+' | b'-' => Ok(find_crlf(buf, pos + 1).map(|cr| cr + 2)),
        b':' => line_len_validated(buf, pos, |b, r| parse_i64_checked(b, r).map(|_| ())),
        b'_' => null_len(buf, pos),
        b',' => line_len_validated(buf, pos, |b, r| parse_f64_checked(b, r).map(|_| ())),
        b'#' => boolean_len(buf, pos),
        b'(' => line_len_validated(buf, pos, validate_big_number),
        b'$' => bulk_len(buf, pos, false),
        b'!' => bulk_len(buf, pos, true),
        b'=' => verbatim_len(buf, pos),
        b'*' => aggregate_len(buf, pos, depth, AggKind::Array),
        b'%' => aggregate_len(buf, pos, depth, AggKind::Map),
        b'~' => aggregate_len(buf, pos, depth, AggKind::Set),
        b'>' => aggregate_len(buf, pos, depth, AggKind::Push),
        b'|' => aggregate_len(buf, pos, depth, AggKind::Attribute),
        _ => Err(ParseError::new(ParseErrorKind::InvalidLeadingByte, pos..pos + 1)),
    }
}

fn line_len_validated(
    buf: &[u8],
    pos: usize,
    validate: impl FnOnce(&[u8], std::ops::Range<usize>) -> Result<(), ParseError>,
) -> Result<Option<usize>, ParseError> {
    let cr = match find_crlf(buf, pos + 1) {
        Some(cr) => cr,
        None => return Ok(None),
    };
    validate(&buf[pos + 1..cr], pos..cr + 2)?;
    Ok(Some(cr + 2))
}

fn null_len(buf: &[u8], pos: usize) -> Result<Option<usize>, ParseError> {
    if pos + 3 > buf.len() {
        return Ok(None);
    }
    if buf[pos + 1] == b'\r' && buf[pos + 2] == b'\n' {
        Ok(Some(pos + 3))
    } else {
        Err(ParseError::new(ParseErrorKind::InvalidData, pos..pos + 3))
    }
}

fn boolean_len(buf: &[u8], pos: usize) -> Result<Option<usize>, ParseError> {
    let cr = match find_crlf(buf, pos + 1) {
        Some(cr) => cr,
        None => return Ok(None),
    };
    let content = &buf[pos + 1..cr];
    if content.len() == 1 && (content[0] == b't' || content[0] == b'f') {
        Ok(Some(cr + 2))
    } else {
        Err(ParseError::new(ParseErrorKind::InvalidData, pos..cr + 2))
    }
}

fn read_bulk_header(buf: &[u8], pos: usize) -> Result<Option<(i64, usize)>, ParseError> {
    let cr = match find_crlf(buf, pos + 1) {
        Some(cr) => cr,
        None => return Ok(None),
    };
    let len = parse_i64_checked(&buf[pos + 1..cr], pos..cr + 2)
        .map_err(|_| ParseError::new(ParseErrorKind::InvalidElementCount, pos..cr + 2))?;
    Ok(Some((len, cr + 2)))
}

fn bulk_len(buf: &[u8], pos: usize, is_error: bool) -> Result<Option<usize>, ParseError> {
    let (len, content_start) = match read_bulk_header(buf, pos)? {
        Some(v) => v,
        None => return Ok(None),
    };
    if len == -1 && !is_error {
        return Ok(Some(content_start));
    }
    if len < 0 {
        return Err(ParseError::new(ParseErrorKind::InvalidElementCount, pos..content_start));
    }
    let content_end = content_start + len as usize;
    if buf.len() < content_end + 2 {
        return Ok(None);
    }
    if buf[content_end] != b'\r' || buf[content_end + 1] != b'\n' {
        return Err(ParseError::new(ParseErrorKind::InvalidData, content_start..content_end + 2));
    }
    Ok(Some(content_end + 2))
}

fn verbatim_len(buf: &[u8], pos: usize) -> Result<Option<usize>, ParseError> {
    let (len, content_start) = match read_bulk_header(buf, pos)? {
        Some(v) => v,
        None => return Ok(None),
    };
    if len < 0 {
        return Err(ParseError::new(ParseErrorKind::InvalidElementCount, pos..content_start));
    }
    let content_end = content_start + len as usize;
    if buf.len() < content_end + 2 {
        return Ok(None);
    }
    if len < 4 || buf[content_start + 3] != b':' {
        return Err(ParseError::new(
            ParseErrorKind::MissingColonInVerbatim,
            content_start..content_end,
        ));
    }
    if buf[content_end] != b'\r' || buf[content_end + 1] != b'\n' {
        return Err(ParseError::new(ParseErrorKind::InvalidData, content_start..content_end + 2));
    }
    Ok(Some(content_end + 2))
}

fn aggregate_len(
    buf: &[u8],
    pos: usize,
    depth: usize,
    kind: AggKind,
) -> Result<Option<usize>, ParseError> {
    let cr = match find_crlf(buf, pos + 1) {
        Some(cr) => cr,
        None => return Ok(None),
    };
    let count = parse_i64_checked(&buf[pos + 1..cr], pos..cr + 2)
        .map_err(|_| ParseError::new(ParseErrorKind::InvalidElementCount, pos..cr + 2))?;
    let start = cr + 2;
    if count == -1 {
        return if matches!(kind, AggKind::Array) {
            Ok(Some(start))
        } else {
            Err(ParseError::new(ParseErrorKind::InvalidElementCount, pos..start))
        };
    }
    if count < -1 {
        return Err(ParseError::new(ParseErrorKind::InvalidElementCount, pos..start));
    }
    if depth + 1 > MAX_DEPTH {
        return Err(ParseError::new(ParseErrorKind::TooDeeplyNested, pos..start));
    }
    let children = match kind {
        AggKind::Map | AggKind::Attribute => count as usize * 2,
        _ => count as usize,
    };
    let mut cursor = start;
    for _ in 0..children {
        match frame_len(buf, cursor, depth + 1)? {
            Some(end) => cursor = end,
            None => return Ok(None),
        }
    }
    Ok(Some(cursor))
}

// --- build phase: assumes `frame` was already validated by frame_len ---

pub(crate) fn parse_frame(
    frame: &Bytes,
    pos: usize,
    depth: usize,
) -> Result<(RespToken, usize), ParseError> {
    match frame[pos] {
        b'+' => {
            let (content, end) = read_line(frame, pos);
            Ok((RespToken::SimpleString(content), end))
        }
        b'-' => {
            let (content, end) = read_line(frame, pos);
            Ok((RespToken::SimpleError(content), end))
        }
        b':' => {
            let (content, end) = read_line(frame, pos);
            let value = parse_i64_checked(&content, pos..end).unwrap_or(0);
            Ok((RespToken::Integer(value), end))
        }
        b'_' => Ok((RespToken::Null, pos + 3)),
        b',' => {
            let (content, end) = read_line(frame, pos);
            let value = parse_f64_checked(&content, pos..end).unwrap_or(0.0);
            Ok((RespToken::Double(value), end))
        }
        b'#' => {
            let (content, end) = read_line(frame, pos);
            Ok((RespToken::Boolean(content.first() == Some(&b't')), end))
        }
        b'(' => {
            let (content, end) = read_line(frame, pos);
            Ok((RespToken::BigNumber(content), end))
        }
        b'$' => parse_bulk(frame, pos, false),
        b'!' => parse_bulk(frame, pos, true),
        b'=' => parse_verbatim(frame, pos),
        b'*' => parse_aggregate(frame, pos, depth, AggKind::Array),
        b'%' => parse_aggregate(frame, pos, depth, AggKind::Map),
        b'~' => parse_aggregate(frame, pos, depth, AggKind::Set),
        b'>' => parse_aggregate(frame, pos, depth, AggKind::Push),
        b'|' => parse_aggregate(frame, pos, depth, AggKind::Attribute),
        other => unreachable!("leading byte {other:#x} already validated by frame_len"),
    }
}

fn read_line(frame: &Bytes, pos: usize) -> (Bytes, usize) {
    let cr = find_crlf(frame, pos + 1).expect("frame_len validated this line");
    (frame.slice(pos + 1..cr), cr + 2)
}

fn read_bulk_header_built(frame: &Bytes, pos: usize) -> (i64, usize) {
    let cr = find_crlf(frame, pos + 1).expect("frame_len validated this header");
    let len = parse_i64_checked(&frame[pos + 1..cr], pos..cr + 2).expect("frame_len validated this length");
    (len, cr + 2)
}

fn parse_bulk(frame: &Bytes, pos: usize, is_error: bool) -> Result<(RespToken, usize), ParseError> {
    let (len, content_start) = read_bulk_header_built(frame, pos);
    if len == -1 {
        return Ok((RespToken::Null, content_start));
    }
    let content_end = content_start + len as usize;
    let content = frame.slice(content_start..content_end);
    let token = if is_error {
        RespToken::BulkError(content)
    } else {
        RespToken::BulkString(content)
    };
    Ok((token, content_end + 2))
}

fn parse_verbatim(frame: &Bytes, pos: usize) -> Result<(RespToken, usize), ParseError> {
    let (len, content_start) = read_bulk_header_built(frame, pos);
    let content_end = content_start + len as usize;
    let full = frame.slice(content_start..content_end);
    let mut format = [0u8; 3];
    format.copy_from_slice(&full[0..3]);
    let content = full.slice(4..);
    Ok((RespToken::VerbatimString { format, content }, content_end + 2))
}

fn parse_aggregate(
    frame: &Bytes,
    pos: usize,
    depth: usize,
    kind: AggKind,
) -> Result<(RespToken, usize), ParseError> {
    let cr = find_crlf(frame, pos + 1).expect("frame_len validated this header");
    let count = parse_i64_checked(&frame[pos + 1..cr], pos..cr + 2).expect("frame_len validated this count");
    let start = cr + 2;
    if count == -1 {
        return Ok((RespToken::Null, start));
    }
    let n = count as usize;
    let child_tokens = match kind {
        AggKind::Map | AggKind::Attribute => n * 2,
        _ => n,
    };
    let mut cursor = start;
    for _ in 0..child_tokens {
        let (_, end) = parse_frame(frame, cursor, depth + 1)?;
        cursor = end;
    }
    let payload = frame.slice(start..cursor);
    let agg = Aggregate::new(n, child_tokens, payload);
    let token = match kind {
        AggKind::Array => RespToken::Array(agg),
        AggKind::Map => RespToken::Map(agg),
        AggKind::Set => RespToken::Set(agg),
        AggKind::Attribute => RespToken::Attribute(agg),
        AggKind::Push => RespToken::Push(agg),
    };
    Ok((token, cursor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> RespToken {
        let mut buf = BytesMut::from(input);
        decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn decodes_bulk_string() {
        let tok = decode_all(b"$3\r\nBar\r\n");
        assert_eq!(tok, RespToken::BulkString(Bytes::from_static(b"Bar")));
    }

    #[test]
    fn decodes_null_variants() {
        assert_eq!(decode_all(b"$-1\r\n"), RespToken::Null);
        assert_eq!(decode_all(b"*-1\r\n"), RespToken::Null);
        assert_eq!(decode_all(b"_\r\n"), RespToken::Null);
    }

    #[test]
    fn decodes_doubles_including_special_values() {
        assert_eq!(decode_all(b",inf\r\n"), RespToken::Double(f64::INFINITY));
        assert_eq!(decode_all(b",-inf\r\n"), RespToken::Double(f64::NEG_INFINITY));
        assert!(matches!(decode_all(b",nan\r\n"), RespToken::Double(v) if v.is_nan()));
    }

    #[test]
    fn integer_overflow_is_rejected() {
        let mut buf = BytesMut::from(&b":92233720368547758071\r\n"[..]);
        let err = decode(&mut buf).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::CannotParseInteger);
    }

    #[test]
    fn integer_max_parses() {
        let mut buf = BytesMut::from(&b":9223372036854775807\r\n"[..]);
        assert_eq!(decode(&mut buf).unwrap(), Some(RespToken::Integer(i64::MAX)));
    }

    #[test]
    fn incomplete_frame_returns_none_without_consuming() {
        let mut buf = BytesMut::from(&b"$5\r\nBa"[..]);
        assert_eq!(decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn deeply_nested_array_within_limit_parses() {
        let mut bytes = Vec::new();
        for _ in 0..999 {
            bytes.extend_from_slice(b"*1\r\n");
        }
        bytes.extend_from_slice(b":1\r\n");
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn nesting_past_limit_fails() {
        let mut bytes = Vec::new();
        for _ in 0..1000 {
            bytes.extend_from_slice(b"*1\r\n");
        }
        bytes.extend_from_slice(b":1\r\n");
        let mut buf = BytesMut::from(&bytes[..]);
        let err = decode(&mut buf).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TooDeeplyNested);
    }

    #[test]
    fn map_elements_flatten_to_key_value_pairs() {
        let mut buf = BytesMut::from(&b"%2\r\n+a\r\n:1\r\n+b\r\n:2\r\n"[..]);
        let tok = decode(&mut buf).unwrap().unwrap();
        if let RespToken::Map(agg) = tok {
            assert_eq!(agg.len(), 2);
            let elements = agg.elements().unwrap();
            assert_eq!(elements.len(), 4);
        } else {
            panic!("expected map token");
        }
    }

    #[test]
    fn push_frame_is_recognized() {
        let mut buf = BytesMut::from(&b">2\r\n$7\r\nmessage\r\n$5\r\nhello\r\n"[..]);
        let tok = decode(&mut buf).unwrap().unwrap();
        assert!(tok.is_push());
    }
}
