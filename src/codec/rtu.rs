// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus RTU framing
//!
//! Binary frames over a serial line, delimited by bus silence and
//! protected by CRC-16. The decoder is a streaming state machine: bytes
//! arrive in arbitrary chunks via [`Decoder::accept`] and a frame is
//! finalized by [`Decoder::poll_frame`] once the line has been quiet for
//! at least the inter-frame silence interval (T3.5).

use bytes::{BufMut, BytesMut};

use crate::{
    error::{Error, Result},
    frame::AduView,
};

// [Modbus over Serial Line Specification and Implementation Guide V1.02](http://modbus.org/docs/Modbus_over_serial_line_V1_02.pdf), page 13
// "The maximum size of a Modbus RTU frame is 256 bytes."
pub const MAX_FRAME_LEN: usize = 256;

/// Smallest valid frame: unit id, function code and CRC.
const MIN_FRAME_LEN: usize = 4;

const CRC_LEN: usize = 2;

/// Inter-frame silence interval (T3.5) in milliseconds for a baud rate.
///
/// The serial line spec fixes the interval at 1750 µs for rates above
/// 19200 baud; below that it is 3.5 character times of 11 bits each,
/// rounded up to the millisecond clock granularity.
#[must_use]
pub const fn silence_interval_ms(baud: u32) -> u64 {
    if baud >= 19_200 {
        2
    } else {
        ((38_500 + baud - 1) / baud) as u64
    }
}

/// CRC-16/Modbus over `data`: polynomial `0xA001` (reflected), initial
/// value `0xFFFF`. The result is appended to the frame little-endian.
#[must_use]
pub fn calc_crc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for x in data {
        crc ^= u16::from(*x);
        for _ in 0..8 {
            let crc_odd = (crc & 0x0001) != 0;
            crc >>= 1;
            if crc_odd {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

/// Wrap a PDU into a complete RTU ADU: `unit | pdu | crc_lo | crc_hi`.
pub fn encode_adu(unit_id: u8, pdu: &[u8], out: &mut BytesMut) -> Result<()> {
    if pdu.is_empty() || 1 + pdu.len() + CRC_LEN > MAX_FRAME_LEN {
        return Err(Error::InvalidArgument);
    }
    out.reserve(1 + pdu.len() + CRC_LEN);
    let start = out.len();
    out.put_u8(unit_id);
    out.put_slice(pdu);
    let crc = calc_crc(&out[start..]);
    out.put_u16_le(crc);
    Ok(())
}

/// Streaming RTU frame decoder.
#[derive(Debug)]
pub struct Decoder {
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
    receiving: bool,
    overrun: bool,
    last_activity_ms: u64,
    silence_ms: u64,
}

impl Decoder {
    #[must_use]
    pub fn new(silence_ms: u64) -> Self {
        Self {
            buf: [0; MAX_FRAME_LEN],
            len: 0,
            receiving: false,
            overrun: false,
            last_activity_ms: 0,
            silence_ms,
        }
    }

    /// The configured inter-frame silence interval.
    #[must_use]
    pub fn silence_ms(&self) -> u64 {
        self.silence_ms
    }

    /// Whether a frame is currently being accumulated.
    #[must_use]
    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    /// Feed received bytes and note the reception time.
    pub fn accept(&mut self, data: &[u8], now_ms: u64) {
        if data.is_empty() {
            return;
        }
        self.receiving = true;
        self.last_activity_ms = now_ms;
        let free = MAX_FRAME_LEN - self.len;
        if data.len() > free {
            // More than a maximum frame before silence: drop the frame
            // once the line goes quiet.
            self.overrun = true;
        }
        let n = data.len().min(free);
        self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
    }

    /// Finalize the pending frame once the silence interval has elapsed.
    ///
    /// Returns `Ok(None)` while the line is active or idle with no
    /// pending data. A finalized frame is validated (length and CRC) and
    /// returned as a borrowed view; the decoder resets itself either way.
    pub fn poll_frame(&mut self, now_ms: u64) -> Result<Option<AduView<'_>>> {
        if !self.receiving {
            return Ok(None);
        }
        if now_ms.wrapping_sub(self.last_activity_ms) < self.silence_ms {
            return Ok(None);
        }

        let len = self.len;
        self.len = 0;
        self.receiving = false;
        if self.overrun {
            self.overrun = false;
            log::warn!("RTU frame longer than {MAX_FRAME_LEN} bytes dropped");
            return Err(Error::InvalidRequest);
        }
        if len < MIN_FRAME_LEN {
            log::debug!("short RTU frame ({len} bytes) dropped");
            return Err(Error::InvalidRequest);
        }

        let body = &self.buf[..len - CRC_LEN];
        let expected = u16::from_le_bytes([self.buf[len - CRC_LEN], self.buf[len - 1]]);
        let actual = calc_crc(body);
        if expected != actual {
            log::warn!("invalid RTU CRC: expected = 0x{expected:0>4X}, actual = 0x{actual:0>4X}");
            return Err(Error::Crc);
        }

        Ok(Some(AduView {
            unit_id: body[0],
            function: body[1],
            payload: &body[2..],
        }))
    }

    /// Discard any partially received frame.
    pub fn reset(&mut self) {
        self.len = 0;
        self.receiving = false;
        self.overrun = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SILENCE: u64 = 2;

    fn decoder() -> Decoder {
        Decoder::new(SILENCE)
    }

    #[test]
    fn crc_vectors() {
        // Appended little-endian: 0x1103006B0003 carries 76 87 on the wire.
        assert_eq!(calc_crc(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]), 0x8776);
        assert_eq!(calc_crc(&[0x01, 0x03, 0x08, 0x2B, 0x00, 0x02]), 0x63B6);
    }

    #[test]
    fn silence_interval_follows_baud_rate() {
        assert_eq!(silence_interval_ms(115_200), 2);
        assert_eq!(silence_interval_ms(19_200), 2);
        // 3.5 chars * 11 bits at 9600 baud is a hair over 4 ms.
        assert_eq!(silence_interval_ms(9_600), 5);
        assert_eq!(silence_interval_ms(1_200), 33);
    }

    #[test]
    fn encode_read_request_adu() {
        let mut buf = BytesMut::new();
        encode_adu(0x11, &[0x03, 0x00, 0x6B, 0x00, 0x03], &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87]
        );
    }

    #[test]
    fn encode_rejects_oversize_pdu() {
        let mut buf = BytesMut::new();
        let pdu = [0u8; MAX_FRAME_LEN];
        assert_eq!(
            encode_adu(0x01, &pdu, &mut buf),
            Err(Error::InvalidArgument)
        );
        assert_eq!(encode_adu(0x01, &[], &mut buf), Err(Error::InvalidArgument));
    }

    #[test]
    fn no_frame_before_silence() {
        let mut dec = decoder();
        dec.accept(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87], 100);
        assert_eq!(dec.poll_frame(100).unwrap(), None);
        assert_eq!(dec.poll_frame(101).unwrap(), None);
        assert!(dec.is_receiving());

        let adu = dec.poll_frame(102).unwrap().unwrap();
        assert_eq!(adu.unit_id, 0x11);
        assert_eq!(adu.function, 0x03);
        assert_eq!(adu.payload, &[0x00, 0x6B, 0x00, 0x03]);
        assert!(!dec.is_receiving());
    }

    #[test]
    fn bytes_in_two_chunks() {
        let mut dec = decoder();
        dec.accept(&[0x11, 0x03, 0x00], 10);
        dec.accept(&[0x6B, 0x00, 0x03, 0x76, 0x87], 11);
        // Silence is measured from the last byte.
        assert_eq!(dec.poll_frame(12).unwrap(), None);
        assert!(dec.poll_frame(13).unwrap().is_some());
    }

    #[test]
    fn crc_mismatch() {
        let mut dec = decoder();
        dec.accept(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x88], 10);
        assert_eq!(dec.poll_frame(20), Err(Error::Crc));
        // The decoder has resynchronized.
        assert_eq!(dec.poll_frame(21).unwrap(), None);
    }

    #[test]
    fn single_bit_flip_is_detected() {
        let frame = [0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87];
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupt = frame;
                corrupt[byte] ^= 1 << bit;
                let mut dec = decoder();
                dec.accept(&corrupt, 10);
                assert_eq!(dec.poll_frame(20), Err(Error::Crc), "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn short_frame_is_rejected() {
        let mut dec = decoder();
        dec.accept(&[0x11, 0x03, 0x00], 10);
        assert_eq!(dec.poll_frame(20), Err(Error::InvalidRequest));
    }

    #[test]
    fn overlong_frame_is_dropped() {
        let mut dec = decoder();
        dec.accept(&[0u8; 300], 10);
        assert_eq!(dec.poll_frame(20), Err(Error::InvalidRequest));
        // Frame data is gone, decoder is idle again.
        assert_eq!(dec.poll_frame(30).unwrap(), None);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut dec = decoder();
        dec.accept(&[0x11, 0x03], 10);
        dec.reset();
        assert_eq!(dec.poll_frame(100).unwrap(), None);
    }

    #[test]
    fn exception_frame_decodes() {
        // <unit> 0x83 0x02 with CRC appended.
        let mut body = vec![0x11, 0x83, 0x02];
        let crc = calc_crc(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        let mut dec = decoder();
        dec.accept(&body, 10);
        let adu = dec.poll_frame(20).unwrap().unwrap();
        assert_eq!(adu.unit_id, 0x11);
        assert_eq!(adu.function, 0x83);
        assert_eq!(adu.payload, &[0x02]);
    }
}
