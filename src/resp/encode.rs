//! RESP3 command encoder (§4.1): builds a bulk-string-array frame for an
//! outbound command, tracking the element count and rewriting the `*`
//! header in place once arguments are appended.

use bytes::{BufMut, Bytes, BytesMut};

fn decimal_digits(n: usize) -> usize {
    let mut digits = 1;
    let mut threshold: usize = 10;
    while n >= threshold {
        digits += 1;
        match threshold.checked_mul(10) {
            Some(next) => threshold = next,
            None => break,
        }
    }
    digits
}

/// Incrementally builds one RESP3 command frame.
pub struct CommandEncoder {
    buf: BytesMut,
    count: usize,
    header_digits: usize,
}

impl Default for CommandEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandEncoder {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.extend_from_slice(b"*0\r\n");
        CommandEncoder { buf, count: 0, header_digits: 1 }
    }

    pub fn with_capacity(cap: usize) -> Self {
        let mut enc = Self::new();
        enc.buf.reserve(cap);
        enc
    }

    /// Appends a raw byte-string argument.
    pub fn push_bytes(&mut self, arg: &[u8]) -> &mut Self {
        self.bump_count();
        self.buf.put_slice(b"$");
        self.buf.extend_from_slice(arg.len().to_string().as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(arg);
        self.buf.extend_from_slice(b"\r\n");
        self
    }

    /// Appends a key. Keys are just byte strings at the wire level; the
    /// distinct method exists so callers and the cluster router can see at
    /// a glance which arguments are key-bearing.
    pub fn push_key(&mut self, key: &[u8]) -> &mut Self {
        self.push_bytes(key)
    }

    /// Appends a signed integer, rendered in decimal.
    pub fn push_int(&mut self, value: i64) -> &mut Self {
        self.push_bytes(value.to_string().as_bytes())
    }

    /// Appends a double in the form the server parses (`inf`/`-inf`/`nan`
    /// for the special values, plain decimal otherwise).
    pub fn push_double(&mut self, value: f64) -> &mut Self {
        let rendered = if value.is_infinite() && value.is_sign_positive() {
            "inf".to_string()
        } else if value.is_infinite() {
            "-inf".to_string()
        } else if value.is_nan() {
            "nan".to_string()
        } else {
            value.to_string()
        };
        self.push_bytes(rendered.as_bytes())
    }

    /// Appends a literal token (e.g. `WITHSCORES`) only when `enabled`.
    pub fn push_pure_token(&mut self, token: &str, enabled: bool) -> &mut Self {
        if enabled {
            self.push_bytes(token.as_bytes());
        }
        self
    }

    fn bump_count(&mut self) {
        self.count += 1;
        let new_digits = decimal_digits(self.count);
        if new_digits != self.header_digits {
            self.rewrite_header(new_digits);
        } else {
            let digits = self.count.to_string();
            self.buf[1..1 + self.header_digits].copy_from_slice(digits.as_bytes());
        }
    }

    fn rewrite_header(&mut self, new_digits: usize) {
        let old_header_len = 1 + self.header_digits + 2;
        let rest = self.buf.split_off(old_header_len);
        self.buf.clear();
        self.buf.extend_from_slice(b"*");
        self.buf.extend_from_slice(self.count.to_string().as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self.buf.unsplit(rest);
        self.header_digits = new_digits;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Builds the standard command frame for a name plus raw argument bytes;
/// the common case used throughout the connection and cluster layers.
pub fn encode_command(name: &str, args: &[&[u8]]) -> Bytes {
    let mut enc = CommandEncoder::with_capacity(32 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    enc.push_bytes(name.as_bytes());
    for arg in args {
        enc.push_bytes(arg);
    }
    enc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_simple_command() {
        let bytes = encode_command("GET", &[b"foo"]);
        assert_eq!(bytes.as_ref(), b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
    }

    #[test]
    fn header_grows_across_digit_boundary() {
        let mut enc = CommandEncoder::new();
        for i in 0..11 {
            enc.push_bytes(format!("arg{i}").as_bytes());
        }
        let bytes = enc.finish();
        assert!(bytes.starts_with(b"*11\r\n"));
    }

    #[test]
    fn pure_token_only_rendered_when_enabled() {
        let mut enc = CommandEncoder::new();
        enc.push_bytes(b"ZRANGE");
        enc.push_pure_token("WITHSCORES", false);
        enc.push_pure_token("WITHSCORES", true);
        assert_eq!(enc.len(), 2);
    }
}
