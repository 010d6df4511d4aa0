use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

const UTF8_BOM: &[u8; 3] = b"\xEF\xBB\xBF";

/// Single-byte stand-in for every invalid input byte, so output never grows.
pub const PLACEHOLDER: u8 = b'?';

/// Streaming UTF-8 repair.
///
/// Drops a leading BOM, passes valid UTF-8 through untouched and replaces each
/// invalid byte with [`PLACEHOLDER`]. A multi-byte sequence cut by a read
/// boundary is held back until the next read, so output does not depend on how
/// the input was chunked.
#[derive(Debug, Default)]
pub struct Utf8Sanitizer {
    bom_checked: bool,
}

impl Utf8Sanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn strip_bom(&mut self, src: &mut BytesMut) {
        self.bom_checked = true;
        if src.starts_with(UTF8_BOM) {
            src.advance(UTF8_BOM.len());
        }
    }
}

impl Decoder for Utf8Sanitizer {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.bom_checked {
            if src.len() < UTF8_BOM.len() {
                return Ok(None);
            }
            self.strip_bom(src);
        }
        if src.is_empty() {
            return Ok(None);
        }

        if src.is_ascii() {
            return Ok(Some(src.split()));
        }

        let complete = sanitize_in_place(&mut src[..], false);
        if complete == 0 {
            return Ok(None);
        }
        Ok(Some(src.split_to(complete)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.bom_checked {
            self.strip_bom(buf);
        }
        if buf.is_empty() {
            return Ok(None);
        }
        sanitize_in_place(&mut buf[..], true);
        Ok(Some(buf.split()))
    }
}

/// Expected sequence length for a lead byte, `None` for bytes that can never
/// start a sequence (stray continuations, overlong leads, out-of-range leads).
fn sequence_len(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7F => Some(1),
        0xC2..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF4 => Some(4),
        _ => None,
    }
}

fn is_continuation(b: u8) -> bool {
    b & 0xC0 == 0x80
}

/// Replace invalid bytes in place. Returns the length of the prefix that is
/// complete; with `last == false` a truncated trailing sequence is left after
/// that prefix for the next call, with `last == true` it is replaced.
pub(crate) fn sanitize_in_place(buf: &mut [u8], last: bool) -> usize {
    let n = buf.len();
    let mut i = 0;
    while i < n {
        let b = buf[i];
        if b < 0x80 {
            i += 1;
            continue;
        }
        let Some(len) = sequence_len(b) else {
            buf[i] = PLACEHOLDER;
            i += 1;
            continue;
        };

        if i + len > n {
            let tail_ok = buf[i + 1..].iter().all(|&c| is_continuation(c));
            if tail_ok && !last {
                return i;
            }
            buf[i] = PLACEHOLDER;
            i += 1;
            continue;
        }

        if std::str::from_utf8(&buf[i..i + len]).is_ok() {
            i += len;
        } else {
            buf[i] = PLACEHOLDER;
            i += 1;
        }
    }
    n
}

/// Transcodes a non-UTF-8 source charset into UTF-8, dropping any BOM.
pub struct Transcoder {
    decoder: encoding_rs::Decoder,
}

impl Transcoder {
    pub fn new(encoding: &'static encoding_rs::Encoding) -> Self {
        Self {
            decoder: encoding.new_decoder_with_bom_removal(),
        }
    }

    fn transcode(&mut self, src: &mut BytesMut, last: bool) -> Option<BytesMut> {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(src.len())
            .unwrap_or_else(|| src.len() * 3 + 4);
        let mut out = vec![0; capacity];
        let (_result, read, written, _replaced) = self.decoder.decode_to_utf8(src, &mut out, last);
        src.advance(read);
        (written > 0).then(|| BytesMut::from(&out[..written]))
    }
}

impl Decoder for Transcoder {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        Ok(self.transcode(src, false))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let out = self.transcode(buf, true);
        buf.clear();
        Ok(out)
    }
}
