// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP (MBAP) framing
//!
//! Frames are length-prefixed by the 7-byte MBAP header, so decoding is a
//! plain accumulate-and-split loop with no timing involved. Multiple
//! in-flight requests are multiplexed over one connection and correlated
//! by the 16-bit transaction id.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    error::{Error, Result},
    frame::MAX_PDU_LEN,
};

pub const HEADER_LEN: usize = 7;

pub const PROTOCOL_ID: u16 = 0x0000;

/// MBAP header plus maximum PDU.
pub const MAX_FRAME_LEN: usize = 6 + 1 + MAX_PDU_LEN;

/// A decoded MBAP frame with its PDU payload.
///
/// The payload is a cheap slice of the receive buffer, valid independent
/// of further decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub function: u8,
    pub payload: Bytes,
}

/// Wrap a PDU into a complete MBAP ADU.
pub fn encode_adu(transaction_id: u16, unit_id: u8, pdu: &[u8], out: &mut BytesMut) -> Result<()> {
    if pdu.is_empty() || pdu.len() > MAX_PDU_LEN {
        return Err(Error::InvalidArgument);
    }
    out.reserve(HEADER_LEN + pdu.len());
    out.put_u16(transaction_id);
    out.put_u16(PROTOCOL_ID);
    out.put_u16((pdu.len() + 1) as u16);
    out.put_u8(unit_id);
    out.put_slice(pdu);
    Ok(())
}

/// Streaming MBAP frame decoder.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    current: Option<Adu>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_FRAME_LEN),
            current: None,
        }
    }
}

impl Decoder {
    /// Append received bytes to the accumulation buffer.
    pub fn accept(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Try to split one complete frame off the accumulation buffer.
    ///
    /// A header with a foreign protocol id or an out-of-range length
    /// consumes exactly the 7 header bytes and fails with
    /// [`Error::InvalidRequest`]; the stream stays in sync on the next
    /// header candidate.
    pub fn decode(&mut self) -> Result<Option<Adu>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let protocol_id = BigEndian::read_u16(&self.buf[2..4]);
        let len = usize::from(BigEndian::read_u16(&self.buf[4..6]));
        if protocol_id != PROTOCOL_ID || len < 1 || len > MAX_PDU_LEN + 1 {
            log::warn!("invalid MBAP header: protocol id = {protocol_id}, length = {len}");
            self.buf.advance(HEADER_LEN);
            return Err(Error::InvalidRequest);
        }
        if self.buf.len() < 6 + len {
            // Need more data.
            return Ok(None);
        }

        let header = self.buf.split_to(HEADER_LEN);
        let transaction_id = BigEndian::read_u16(&header[0..2]);
        let unit_id = header[6];
        let pdu = self.buf.split_to(len - 1).freeze();
        let Some(&function) = pdu.first() else {
            // length of 1 covers the unit id only, leaving no PDU
            return Err(Error::InvalidRequest);
        };

        Ok(Some(Adu {
            transaction_id,
            unit_id,
            function,
            payload: pdu.slice(1..),
        }))
    }

    /// Keep a decoded frame alive inside the decoder and return a
    /// reference to it, for borrowed views handed up to the engines.
    pub(crate) fn hold(&mut self, adu: Adu) -> &Adu {
        self.current.insert(adu)
    }

    /// Drop all buffered input.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.current = None;
    }
}
