// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus ASCII framing
//!
//! Frames are `':'`-started, CR-LF-terminated lines of uppercase hex
//! pairs covering unit id, PDU and a trailing LRC. The decoder idles
//! outside a frame, so line noise between frames is ignored for free;
//! a stalled frame is aborted by the inter-character timeout.

use bytes::{BufMut, BytesMut};

use crate::{
    error::{Error, Result},
    frame::{AduView, MAX_PDU_LEN},
};

/// Maximum frame length in characters:
/// `':'` + 2 * (unit + PDU + LRC) + CR + LF.
pub const MAX_FRAME_CHARS: usize = 1 + 2 * MAX_BINARY_LEN + 2;

/// Default inter-character timeout in milliseconds.
pub const DEFAULT_INTER_CHAR_TIMEOUT_MS: u64 = 500;

/// Unit id + PDU + LRC.
const MAX_BINARY_LEN: usize = 1 + MAX_PDU_LEN + 1;

const MAX_HEX_CHARS: usize = 2 * MAX_BINARY_LEN;

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// LRC over `data`: two's complement of the 8-bit sum.
#[must_use]
pub fn calc_lrc(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

fn hex_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        _ => None,
    }
}

fn put_hex(byte: u8, out: &mut BytesMut) {
    out.put_u8(HEX_DIGITS[usize::from(byte >> 4)]);
    out.put_u8(HEX_DIGITS[usize::from(byte & 0x0F)]);
}

/// Wrap a PDU into a complete ASCII ADU:
/// `':' | hex(unit) | hex(pdu) | hex(lrc) | CR | LF`.
pub fn encode_adu(unit_id: u8, pdu: &[u8], out: &mut BytesMut) -> Result<()> {
    if pdu.is_empty() || pdu.len() > MAX_PDU_LEN {
        return Err(Error::InvalidArgument);
    }
    out.reserve(1 + 2 * (1 + pdu.len() + 1) + 2);
    out.put_u8(b':');
    put_hex(unit_id, out);
    let mut sum = unit_id;
    for &byte in pdu {
        put_hex(byte, out);
        sum = sum.wrapping_add(byte);
    }
    put_hex(0u8.wrapping_sub(sum), out);
    out.put_slice(b"\r\n");
    Ok(())
}

/// Streaming ASCII frame decoder.
#[derive(Debug)]
pub struct Decoder {
    hex: [u8; MAX_HEX_CHARS],
    hex_len: usize,
    bin: [u8; MAX_BINARY_LEN],
    in_frame: bool,
    complete: bool,
    failed: Option<Error>,
    last_activity_ms: u64,
    timeout_ms: u64,
}

impl Decoder {
    #[must_use]
    pub fn new(inter_char_timeout_ms: u64) -> Self {
        Self {
            hex: [0; MAX_HEX_CHARS],
            hex_len: 0,
            bin: [0; MAX_BINARY_LEN],
            in_frame: false,
            complete: false,
            failed: None,
            last_activity_ms: 0,
            timeout_ms: inter_char_timeout_ms,
        }
    }

    /// The configured inter-character timeout.
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Feed received characters and note the reception time.
    pub fn accept(&mut self, data: &[u8], now_ms: u64) {
        for &ch in data {
            if ch == b':' {
                // Start of frame always resynchronizes.
                self.in_frame = true;
                self.complete = false;
                self.failed = None;
                self.hex_len = 0;
                self.last_activity_ms = now_ms;
                continue;
            }
            if !self.in_frame || self.complete {
                continue;
            }
            self.last_activity_ms = now_ms;
            match ch {
                b'\r' => {}
                b'\n' => self.complete = true,
                _ => match hex_value(ch) {
                    Some(_) if self.hex_len < MAX_HEX_CHARS => {
                        self.hex[self.hex_len] = ch;
                        self.hex_len += 1;
                    }
                    Some(_) => {
                        log::warn!("ASCII frame longer than {MAX_FRAME_CHARS} chars dropped");
                        self.in_frame = false;
                        self.failed = Some(Error::InvalidRequest);
                    }
                    None => {
                        log::debug!("non-hex character 0x{ch:0>2X} in ASCII frame");
                        self.in_frame = false;
                        self.failed = Some(Error::InvalidRequest);
                    }
                },
            }
        }
    }

    /// Produce the pending frame, a pending failure, or a timeout abort.
    pub fn poll_frame(&mut self, now_ms: u64) -> Result<Option<AduView<'_>>> {
        if let Some(err) = self.failed.take() {
            return Err(err);
        }
        if self.in_frame
            && !self.complete
            && now_ms.wrapping_sub(self.last_activity_ms) >= self.timeout_ms
        {
            self.reset();
            return Err(Error::Timeout);
        }
        if !self.complete {
            return Ok(None);
        }

        self.complete = false;
        self.in_frame = false;
        let hex_len = self.hex_len;
        self.hex_len = 0;

        if hex_len % 2 != 0 {
            return Err(Error::InvalidRequest);
        }
        let bin_len = hex_len / 2;
        if bin_len < 3 {
            // Need at least unit id, function code and LRC.
            return Err(Error::InvalidRequest);
        }
        for i in 0..bin_len {
            let hi = hex_value(self.hex[2 * i]).ok_or(Error::InvalidRequest)?;
            let lo = hex_value(self.hex[2 * i + 1]).ok_or(Error::InvalidRequest)?;
            self.bin[i] = hi << 4 | lo;
        }

        let expected = self.bin[bin_len - 1];
        let actual = calc_lrc(&self.bin[..bin_len - 1]);
        if expected != actual {
            log::warn!("invalid LRC: expected = 0x{expected:0>2X}, actual = 0x{actual:0>2X}");
            return Err(Error::Crc);
        }

        Ok(Some(AduView {
            unit_id: self.bin[0],
            function: self.bin[1],
            payload: &self.bin[2..bin_len - 1],
        }))
    }

    /// Discard any partially received frame.
    pub fn reset(&mut self) {
        self.in_frame = false;
        self.complete = false;
        self.failed = None;
        self.hex_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> Decoder {
        Decoder::new(DEFAULT_INTER_CHAR_TIMEOUT_MS)
    }

    #[test]
    fn lrc_vectors() {
        assert_eq!(calc_lrc(&[]), 0);
        assert_eq!(calc_lrc(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]), 0x7E);
        // Sum wraps at 8 bit.
        assert_eq!(calc_lrc(&[0xFF, 0xFF]), 0x02);
    }

    #[test]
    fn encode_read_request_adu() {
        let mut buf = BytesMut::new();
        encode_adu(0x11, &[0x03, 0x00, 0x6B, 0x00, 0x03], &mut buf).unwrap();
        assert_eq!(&buf[..], b":1103006B00037E\r\n");
    }

    #[test]
    fn decode_happy_path() {
        let mut dec = decoder();
        dec.accept(b":1103006B00037E\r\n", 10);
        let adu = dec.poll_frame(10).unwrap().unwrap();
        assert_eq!(adu.unit_id, 0x11);
        assert_eq!(adu.function, 0x03);
        assert_eq!(adu.payload, &[0x00, 0x6B, 0x00, 0x03]);
        // Consumed.
        assert_eq!(dec.poll_frame(11).unwrap(), None);
    }

    #[test]
    fn lowercase_hex_is_accepted() {
        let mut dec = decoder();
        dec.accept(b":1103006b00037e\r\n", 10);
        let adu = dec.poll_frame(10).unwrap().unwrap();
        assert_eq!(adu.payload, &[0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn bytes_outside_frame_are_ignored() {
        let mut dec = decoder();
        dec.accept(b"\xFFnoise\r\n:1103006B00037E\r\n", 10);
        assert!(dec.poll_frame(10).unwrap().is_some());
    }

    #[test]
    fn round_trip() {
        let mut buf = BytesMut::new();
        encode_adu(0x2A, &[0x10, 0x00, 0x01, 0x00, 0x01, 0x02, 0xBE, 0xEF], &mut buf).unwrap();
        let mut dec = decoder();
        dec.accept(&buf, 0);
        let adu = dec.poll_frame(0).unwrap().unwrap();
        assert_eq!(adu.unit_id, 0x2A);
        assert_eq!(adu.function, 0x10);
        assert_eq!(adu.payload, &[0x00, 0x01, 0x00, 0x01, 0x02, 0xBE, 0xEF]);
    }

    #[test]
    fn lrc_mismatch() {
        let mut dec = decoder();
        dec.accept(b":1103006B00037F\r\n", 10);
        assert_eq!(dec.poll_frame(10), Err(Error::Crc));
    }

    #[test]
    fn non_hex_character_fails() {
        let mut dec = decoder();
        dec.accept(b":11GZ\r\n", 10);
        assert_eq!(dec.poll_frame(10), Err(Error::InvalidRequest));
        assert_eq!(dec.poll_frame(11).unwrap(), None);
    }

    #[test]
    fn odd_digit_count_fails() {
        let mut dec = decoder();
        dec.accept(b":110\r\n", 10);
        assert_eq!(dec.poll_frame(10), Err(Error::InvalidRequest));
    }

    #[test]
    fn inter_char_timeout_aborts_frame() {
        let mut dec = decoder();
        dec.accept(b":1103", 100);
        assert_eq!(dec.poll_frame(100 + DEFAULT_INTER_CHAR_TIMEOUT_MS - 1).unwrap(), None);
        assert_eq!(
            dec.poll_frame(100 + DEFAULT_INTER_CHAR_TIMEOUT_MS),
            Err(Error::Timeout)
        );
        // Aborted frame is gone; a fresh one decodes fine.
        dec.accept(b":1103006B00037E\r\n", 700);
        assert!(dec.poll_frame(700).unwrap().is_some());
    }

    #[test]
    fn colon_mid_frame_resynchronizes() {
        let mut dec = decoder();
        dec.accept(b":11030:1103006B00037E\r\n", 10);
        let adu = dec.poll_frame(10).unwrap().unwrap();
        assert_eq!(adu.payload, &[0x00, 0x6B, 0x00, 0x03]);
    }
}
