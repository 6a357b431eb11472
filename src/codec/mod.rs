// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! PDU and framing codecs
//!
//! The PDU codec encodes typed [`Request`]/[`Response`] values into a
//! caller-provided buffer and parses received PDUs into borrowed views.
//! Parsers validate minimum lengths, quantity bounds and byte-count cross
//! checks before handing anything to the engines; they never read past
//! the input slice and never copy payload data.

#[cfg(feature = "ascii")]
pub mod ascii;

#[cfg(feature = "rtu")]
pub mod rtu;

#[cfg(feature = "tcp")]
pub mod tcp;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};

use crate::{
    error::{Error, Result},
    frame::{packed_coils_len, AduView, ExceptionCode, Request, Response, MAX_PDU_LEN},
};

/// Quantity bounds per function code, from the Modbus application
/// protocol specification.
pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_WORDS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_WRITE_WORDS: u16 = 123;
pub const MAX_RW_READ_WORDS: u16 = 125;
pub const MAX_RW_WRITE_WORDS: u16 = 121;

fn bool_to_coil(state: bool) -> u16 {
    if state {
        0xFF00
    } else {
        0x0000
    }
}

fn coil_to_bool(coil: u16) -> Result<bool> {
    match coil {
        0xFF00 => Ok(true),
        0x0000 => Ok(false),
        _ => Err(Error::InvalidRequest),
    }
}

fn check_addr_space(addr: u16, quantity: u16) -> bool {
    u32::from(addr) + u32::from(quantity) <= 0x1_0000
}

fn check_quantity(quantity: u16, max: u16) -> bool {
    (1..=max).contains(&quantity)
}

/// Whether `function` is a request the engines know how to route.
#[must_use]
pub fn supported_request_function(function: u8) -> bool {
    matches!(function, 0x01..=0x06 | 0x0F | 0x10 | 0x11 | 0x16 | 0x17)
}

/// Append the PDU of `req` (function code plus data) to `buf`.
///
/// Contract violations (quantity out of bounds, byte counts not matching
/// the declared quantity, address space overflow) fail with
/// [`Error::InvalidArgument`] before anything is written.
pub fn encode_request(req: &Request<'_>, buf: &mut BytesMut) -> Result<()> {
    use Request::*;

    match *req {
        ReadCoils(addr, quantity) | ReadDiscreteInputs(addr, quantity) => {
            if !check_quantity(quantity, MAX_READ_BITS) || !check_addr_space(addr, quantity) {
                return Err(Error::InvalidArgument);
            }
            buf.put_u8(req.function_code());
            buf.put_u16(addr);
            buf.put_u16(quantity);
        }
        ReadHoldingRegisters(addr, quantity) | ReadInputRegisters(addr, quantity) => {
            if !check_quantity(quantity, MAX_READ_WORDS) || !check_addr_space(addr, quantity) {
                return Err(Error::InvalidArgument);
            }
            buf.put_u8(req.function_code());
            buf.put_u16(addr);
            buf.put_u16(quantity);
        }
        WriteSingleCoil(addr, state) => {
            buf.put_u8(0x05);
            buf.put_u16(addr);
            buf.put_u16(bool_to_coil(state));
        }
        WriteSingleRegister(addr, word) => {
            buf.put_u8(0x06);
            buf.put_u16(addr);
            buf.put_u16(word);
        }
        WriteMultipleCoils(addr, quantity, data) => {
            let byte_count = packed_coils_len(usize::from(quantity));
            if !check_quantity(quantity, MAX_WRITE_BITS)
                || !check_addr_space(addr, quantity)
                || data.len() != byte_count
            {
                return Err(Error::InvalidArgument);
            }
            buf.put_u8(0x0F);
            buf.put_u16(addr);
            buf.put_u16(quantity);
            buf.put_u8(byte_count as u8);
            buf.put_slice(data);
        }
        WriteMultipleRegisters(addr, data) => {
            let quantity = (data.len() / 2) as u16;
            if data.len() % 2 != 0
                || !check_quantity(quantity, MAX_WRITE_WORDS)
                || !check_addr_space(addr, quantity)
            {
                return Err(Error::InvalidArgument);
            }
            buf.put_u8(0x10);
            buf.put_u16(addr);
            buf.put_u16(quantity);
            buf.put_u8(data.len() as u8);
            buf.put_slice(data);
        }
        ReportServerId => {
            buf.put_u8(0x11);
        }
        MaskWriteRegister(addr, and_mask, or_mask) => {
            buf.put_u8(0x16);
            buf.put_u16(addr);
            buf.put_u16(and_mask);
            buf.put_u16(or_mask);
        }
        ReadWriteMultipleRegisters(read_addr, read_quantity, write_addr, write_data) => {
            let write_quantity = (write_data.len() / 2) as u16;
            if write_data.len() % 2 != 0
                || !check_quantity(read_quantity, MAX_RW_READ_WORDS)
                || !check_quantity(write_quantity, MAX_RW_WRITE_WORDS)
                || !check_addr_space(read_addr, read_quantity)
                || !check_addr_space(write_addr, write_quantity)
            {
                return Err(Error::InvalidArgument);
            }
            buf.put_u8(0x17);
            buf.put_u16(read_addr);
            buf.put_u16(read_quantity);
            buf.put_u16(write_addr);
            buf.put_u16(write_quantity);
            buf.put_u8(write_data.len() as u8);
            buf.put_slice(write_data);
        }
    }
    Ok(())
}

/// Parse a request PDU (function code at `pdu[0]`).
///
/// Any violation of minimum length, quantity bounds or byte-count cross
/// checks fails with [`Error::InvalidRequest`].
pub fn parse_request(pdu: &[u8]) -> Result<Request<'_>> {
    use Request::*;

    let (&function, p) = pdu.split_first().ok_or(Error::InvalidRequest)?;
    let req = match function {
        0x01 | 0x02 | 0x03 | 0x04 => {
            if p.len() != 4 {
                return Err(Error::InvalidRequest);
            }
            let addr = BigEndian::read_u16(&p[0..2]);
            let quantity = BigEndian::read_u16(&p[2..4]);
            let max = if function <= 0x02 {
                MAX_READ_BITS
            } else {
                MAX_READ_WORDS
            };
            if !check_quantity(quantity, max) || !check_addr_space(addr, quantity) {
                return Err(Error::InvalidRequest);
            }
            match function {
                0x01 => ReadCoils(addr, quantity),
                0x02 => ReadDiscreteInputs(addr, quantity),
                0x03 => ReadHoldingRegisters(addr, quantity),
                _ => ReadInputRegisters(addr, quantity),
            }
        }
        0x05 => {
            if p.len() != 4 {
                return Err(Error::InvalidRequest);
            }
            WriteSingleCoil(
                BigEndian::read_u16(&p[0..2]),
                coil_to_bool(BigEndian::read_u16(&p[2..4]))?,
            )
        }
        0x06 => {
            if p.len() != 4 {
                return Err(Error::InvalidRequest);
            }
            WriteSingleRegister(BigEndian::read_u16(&p[0..2]), BigEndian::read_u16(&p[2..4]))
        }
        0x0F => {
            if p.len() < 5 {
                return Err(Error::InvalidRequest);
            }
            let addr = BigEndian::read_u16(&p[0..2]);
            let quantity = BigEndian::read_u16(&p[2..4]);
            let byte_count = usize::from(p[4]);
            if !check_quantity(quantity, MAX_WRITE_BITS)
                || !check_addr_space(addr, quantity)
                || byte_count != packed_coils_len(usize::from(quantity))
                || p.len() != 5 + byte_count
            {
                return Err(Error::InvalidRequest);
            }
            WriteMultipleCoils(addr, quantity, &p[5..])
        }
        0x10 => {
            if p.len() < 5 {
                return Err(Error::InvalidRequest);
            }
            let addr = BigEndian::read_u16(&p[0..2]);
            let quantity = BigEndian::read_u16(&p[2..4]);
            let byte_count = usize::from(p[4]);
            if !check_quantity(quantity, MAX_WRITE_WORDS)
                || !check_addr_space(addr, quantity)
                || byte_count != 2 * usize::from(quantity)
                || p.len() != 5 + byte_count
            {
                return Err(Error::InvalidRequest);
            }
            WriteMultipleRegisters(addr, &p[5..])
        }
        0x11 => {
            if !p.is_empty() {
                return Err(Error::InvalidRequest);
            }
            ReportServerId
        }
        0x16 => {
            if p.len() != 6 {
                return Err(Error::InvalidRequest);
            }
            MaskWriteRegister(
                BigEndian::read_u16(&p[0..2]),
                BigEndian::read_u16(&p[2..4]),
                BigEndian::read_u16(&p[4..6]),
            )
        }
        0x17 => {
            if p.len() < 9 {
                return Err(Error::InvalidRequest);
            }
            let read_addr = BigEndian::read_u16(&p[0..2]);
            let read_quantity = BigEndian::read_u16(&p[2..4]);
            let write_addr = BigEndian::read_u16(&p[4..6]);
            let write_quantity = BigEndian::read_u16(&p[6..8]);
            let byte_count = usize::from(p[8]);
            if !check_quantity(read_quantity, MAX_RW_READ_WORDS)
                || !check_quantity(write_quantity, MAX_RW_WRITE_WORDS)
                || !check_addr_space(read_addr, read_quantity)
                || !check_addr_space(write_addr, write_quantity)
                || byte_count != 2 * usize::from(write_quantity)
                || p.len() != 9 + byte_count
            {
                return Err(Error::InvalidRequest);
            }
            ReadWriteMultipleRegisters(read_addr, read_quantity, write_addr, &p[9..])
        }
        _ => return Err(Error::InvalidRequest),
    };
    Ok(req)
}

/// Append the PDU of `rsp` (function code plus data) to `buf`.
pub fn encode_response(rsp: &Response<'_>, buf: &mut BytesMut) -> Result<()> {
    use Response::*;

    match *rsp {
        ReadCoils(data) | ReadDiscreteInputs(data) | ReportServerId(data) => {
            if data.is_empty() || data.len() > MAX_PDU_LEN - 2 {
                return Err(Error::InvalidArgument);
            }
            buf.put_u8(rsp.function_code());
            buf.put_u8(data.len() as u8);
            buf.put_slice(data);
        }
        ReadHoldingRegisters(data) | ReadInputRegisters(data) | ReadWriteMultipleRegisters(data) => {
            if data.is_empty() || data.len() % 2 != 0 || data.len() > MAX_PDU_LEN - 2 {
                return Err(Error::InvalidArgument);
            }
            buf.put_u8(rsp.function_code());
            buf.put_u8(data.len() as u8);
            buf.put_slice(data);
        }
        WriteSingleCoil(addr, state) => {
            buf.put_u8(0x05);
            buf.put_u16(addr);
            buf.put_u16(bool_to_coil(state));
        }
        WriteSingleRegister(addr, word) => {
            buf.put_u8(0x06);
            buf.put_u16(addr);
            buf.put_u16(word);
        }
        WriteMultipleCoils(addr, quantity) | WriteMultipleRegisters(addr, quantity) => {
            buf.put_u8(rsp.function_code());
            buf.put_u16(addr);
            buf.put_u16(quantity);
        }
        MaskWriteRegister(addr, and_mask, or_mask) => {
            buf.put_u8(0x16);
            buf.put_u16(addr);
            buf.put_u16(and_mask);
            buf.put_u16(or_mask);
        }
    }
    Ok(())
}

/// Append an exception PDU (`function | 0x80` plus exception code) to `buf`.
pub fn encode_exception(function: u8, code: ExceptionCode, buf: &mut BytesMut) {
    debug_assert!(function < 0x80);
    buf.put_u8(function | 0x80);
    buf.put_u8(code as u8);
}

/// Parse a response PDU against the function code of the pending request.
///
/// A received exception frame (`expected | 0x80`) surfaces as
/// [`Error::Exception`]; a function code that matches neither the request
/// nor its exception form, or any malformed field, fails with
/// [`Error::InvalidRequest`].
pub fn parse_response(expected: u8, pdu: &[u8]) -> Result<Response<'_>> {
    use Response::*;

    let (&function, p) = pdu.split_first().ok_or(Error::InvalidRequest)?;
    if function & 0x80 != 0 {
        if function != expected | 0x80 || p.len() != 1 {
            return Err(Error::InvalidRequest);
        }
        let code = ExceptionCode::from_u8(p[0]).ok_or(Error::InvalidRequest)?;
        return Err(Error::Exception(code));
    }
    if function != expected {
        return Err(Error::InvalidRequest);
    }

    let rsp = match function {
        0x01 | 0x02 => {
            let (&byte_count, data) = p.split_first().ok_or(Error::InvalidRequest)?;
            if byte_count == 0 || data.len() != usize::from(byte_count) {
                return Err(Error::InvalidRequest);
            }
            if function == 0x01 {
                ReadCoils(data)
            } else {
                ReadDiscreteInputs(data)
            }
        }
        0x03 | 0x04 => {
            let (&byte_count, data) = p.split_first().ok_or(Error::InvalidRequest)?;
            if byte_count == 0
                || byte_count % 2 != 0
                || data.len() != usize::from(byte_count)
            {
                return Err(Error::InvalidRequest);
            }
            if function == 0x03 {
                ReadHoldingRegisters(data)
            } else {
                ReadInputRegisters(data)
            }
        }
        0x05 => {
            if p.len() != 4 {
                return Err(Error::InvalidRequest);
            }
            WriteSingleCoil(
                BigEndian::read_u16(&p[0..2]),
                coil_to_bool(BigEndian::read_u16(&p[2..4]))?,
            )
        }
        0x06 => {
            if p.len() != 4 {
                return Err(Error::InvalidRequest);
            }
            WriteSingleRegister(BigEndian::read_u16(&p[0..2]), BigEndian::read_u16(&p[2..4]))
        }
        0x0F | 0x10 => {
            if p.len() != 4 {
                return Err(Error::InvalidRequest);
            }
            let addr = BigEndian::read_u16(&p[0..2]);
            let quantity = BigEndian::read_u16(&p[2..4]);
            if function == 0x0F {
                WriteMultipleCoils(addr, quantity)
            } else {
                WriteMultipleRegisters(addr, quantity)
            }
        }
        0x11 => {
            let (&byte_count, data) = p.split_first().ok_or(Error::InvalidRequest)?;
            if data.len() != usize::from(byte_count) {
                return Err(Error::InvalidRequest);
            }
            ReportServerId(data)
        }
        0x16 => {
            if p.len() != 6 {
                return Err(Error::InvalidRequest);
            }
            MaskWriteRegister(
                BigEndian::read_u16(&p[0..2]),
                BigEndian::read_u16(&p[2..4]),
                BigEndian::read_u16(&p[4..6]),
            )
        }
        0x17 => {
            let (&byte_count, data) = p.split_first().ok_or(Error::InvalidRequest)?;
            if byte_count == 0
                || byte_count % 2 != 0
                || data.len() != usize::from(byte_count)
            {
                return Err(Error::InvalidRequest);
            }
            ReadWriteMultipleRegisters(data)
        }
        _ => return Err(Error::InvalidRequest),
    };
    Ok(rsp)
}

/// A complete inbound frame produced by a framing codec.
///
/// `transaction_id` is populated on TCP only; serial framings correlate
/// by bus turnaround instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameView<'a> {
    pub transaction_id: Option<u16>,
    pub adu: AduView<'a>,
}

/// Framing state of one engine instance.
///
/// The three codecs have disjoint state machines; representing them as a
/// tagged variant keeps the polling code exhaustive instead of hiding
/// behavior behind function-pointer tables.
#[cfg(any(feature = "rtu", feature = "ascii", feature = "tcp"))]
#[derive(Debug)]
pub enum Framing {
    #[cfg(feature = "rtu")]
    Rtu(rtu::Decoder),
    #[cfg(feature = "ascii")]
    Ascii(ascii::Decoder),
    #[cfg(feature = "tcp")]
    Tcp(tcp::Decoder),
}

#[cfg(any(feature = "rtu", feature = "ascii", feature = "tcp"))]
impl Framing {
    /// RTU framing with an explicit inter-frame silence interval.
    #[cfg(feature = "rtu")]
    #[must_use]
    pub fn rtu(silence_ms: u64) -> Self {
        Self::Rtu(rtu::Decoder::new(silence_ms))
    }

    /// RTU framing with the silence interval derived from the baud rate.
    #[cfg(feature = "rtu")]
    #[must_use]
    pub fn rtu_for_baud(baud: u32) -> Self {
        Self::Rtu(rtu::Decoder::new(rtu::silence_interval_ms(baud)))
    }

    /// ASCII framing with the default inter-character timeout.
    #[cfg(feature = "ascii")]
    #[must_use]
    pub fn ascii() -> Self {
        Self::Ascii(ascii::Decoder::new(ascii::DEFAULT_INTER_CHAR_TIMEOUT_MS))
    }

    /// ASCII framing with an explicit inter-character timeout.
    #[cfg(feature = "ascii")]
    #[must_use]
    pub fn ascii_with_timeout(inter_char_timeout_ms: u64) -> Self {
        Self::Ascii(ascii::Decoder::new(inter_char_timeout_ms))
    }

    /// Modbus TCP (MBAP) framing.
    #[cfg(feature = "tcp")]
    #[must_use]
    pub fn tcp() -> Self {
        Self::Tcp(tcp::Decoder::default())
    }

    /// Whether the link allows only one outstanding request.
    #[must_use]
    pub fn is_half_duplex(&self) -> bool {
        match self {
            #[cfg(feature = "rtu")]
            Self::Rtu(_) => true,
            #[cfg(feature = "ascii")]
            Self::Ascii(_) => true,
            #[cfg(feature = "tcp")]
            Self::Tcp(_) => false,
        }
    }

    /// Feed received bytes into the streaming decoder.
    pub(crate) fn accept(&mut self, data: &[u8], now_ms: u64) {
        match self {
            #[cfg(feature = "rtu")]
            Self::Rtu(dec) => dec.accept(data, now_ms),
            #[cfg(feature = "ascii")]
            Self::Ascii(dec) => dec.accept(data, now_ms),
            #[cfg(feature = "tcp")]
            Self::Tcp(dec) => dec.accept(data),
        }
    }

    /// Try to produce one complete frame.
    pub(crate) fn poll_frame(&mut self, now_ms: u64) -> Result<Option<FrameView<'_>>> {
        match self {
            #[cfg(feature = "rtu")]
            Self::Rtu(dec) => Ok(dec.poll_frame(now_ms)?.map(|adu| FrameView {
                transaction_id: None,
                adu,
            })),
            #[cfg(feature = "ascii")]
            Self::Ascii(dec) => Ok(dec.poll_frame(now_ms)?.map(|adu| FrameView {
                transaction_id: None,
                adu,
            })),
            #[cfg(feature = "tcp")]
            Self::Tcp(dec) => {
                let Some(adu) = dec.decode()? else {
                    return Ok(None);
                };
                let adu = dec.hold(adu);
                Ok(Some(FrameView {
                    transaction_id: Some(adu.transaction_id),
                    adu: AduView {
                        unit_id: adu.unit_id,
                        function: adu.function,
                        payload: &adu.payload,
                    },
                }))
            }
        }
    }

    /// Drop any partially accumulated input, e.g. after a watchdog trip.
    pub(crate) fn reset(&mut self) {
        match self {
            #[cfg(feature = "rtu")]
            Self::Rtu(dec) => dec.reset(),
            #[cfg(feature = "ascii")]
            Self::Ascii(dec) => dec.reset(),
            #[cfg(feature = "tcp")]
            Self::Tcp(dec) => dec.reset(),
        }
    }

    /// Wrap a PDU into a complete outbound ADU.
    ///
    /// `transaction_id` is only used by TCP framing.
    pub(crate) fn encode(
        &self,
        unit_id: u8,
        transaction_id: u16,
        pdu: &[u8],
        out: &mut BytesMut,
    ) -> Result<()> {
        match self {
            #[cfg(feature = "rtu")]
            Self::Rtu(_) => rtu::encode_adu(unit_id, pdu, out),
            #[cfg(feature = "ascii")]
            Self::Ascii(_) => ascii::encode_adu(unit_id, pdu, out),
            #[cfg(feature = "tcp")]
            Self::Tcp(_) => tcp::encode_adu(transaction_id, unit_id, pdu, out),
        }
    }
}
