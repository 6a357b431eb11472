// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Framing-agnostic protocol data units.
//!
//! Payload-carrying request/response variants borrow the byte buffer they
//! were parsed from: coil bitmaps stay packed and register data stays
//! big-endian. Callers that need to retain data past the borrow copy it
//! out, typically with the [`unpack_coils`] and [`words_from_be`] helpers.

use std::{error, fmt};

/// A Modbus function code is represented by an unsigned 8 bit integer.
pub type FunctionCode = u8;

/// A Modbus protocol address is represented by 16 bit from `0` to `65535`.
///
/// This *protocol address* uses 0-based indexing, while the *coil address* or
/// *register address* is often specified as a number with 1-based indexing.
/// Please consult the specification of your devices if 1-based coil/register
/// addresses need to be converted to 0-based protocol addresses by subtracting 1.
pub type Address = u16;

/// A Coil represents a single bit.
///
/// - `true` is equivalent to `ON`, `1` and `0xFF00`.
/// - `false` is equivalent to `OFF`, `0` and `0x0000`.
pub type Coil = bool;

/// Modbus uses 16 bit for its data items (big-endian representation).
pub type Word = u16;

/// Number of items to process (`0` - `65535`).
pub type Quantity = u16;

/// Maximum length of a PDU (function code + data) in bytes.
pub const MAX_PDU_LEN: usize = 253;

/// A decoded application data unit.
///
/// The view never owns storage; it borrows the framing codec's receive
/// buffer and is only valid for the duration of the poll call that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AduView<'a> {
    /// Server address on the bus (`0` is broadcast on serial lines).
    pub unit_id: u8,
    /// Function code of the PDU.
    pub function: FunctionCode,
    /// PDU data following the function code.
    pub payload: &'a [u8],
}

/// A request represents a message from the client (master) to the server (slave).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    ReadCoils(Address, Quantity),
    ReadDiscreteInputs(Address, Quantity),
    ReadHoldingRegisters(Address, Quantity),
    ReadInputRegisters(Address, Quantity),
    WriteSingleCoil(Address, Coil),
    WriteSingleRegister(Address, Word),
    /// Write multiple coils: start address, coil quantity and the packed
    /// bitmap (`(quantity + 7) / 8` bytes, LSB first).
    WriteMultipleCoils(Address, Quantity, &'a [u8]),
    /// Write multiple registers: start address and big-endian register
    /// data (two bytes per register).
    WriteMultipleRegisters(Address, &'a [u8]),
    ReportServerId,
    /// Mask write register: address, AND mask, OR mask.
    MaskWriteRegister(Address, Word, Word),
    /// Combined write-then-read: read address, read quantity, write
    /// address and big-endian write data.
    ReadWriteMultipleRegisters(Address, Quantity, Address, &'a [u8]),
}

impl Request<'_> {
    /// The function code of this request on the wire.
    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadCoils(_, _) => 0x01,
            Self::ReadDiscreteInputs(_, _) => 0x02,
            Self::ReadHoldingRegisters(_, _) => 0x03,
            Self::ReadInputRegisters(_, _) => 0x04,
            Self::WriteSingleCoil(_, _) => 0x05,
            Self::WriteSingleRegister(_, _) => 0x06,
            Self::WriteMultipleCoils(_, _, _) => 0x0F,
            Self::WriteMultipleRegisters(_, _) => 0x10,
            Self::ReportServerId => 0x11,
            Self::MaskWriteRegister(_, _, _) => 0x16,
            Self::ReadWriteMultipleRegisters(_, _, _, _) => 0x17,
        }
    }
}

/// The data of a successful request.
///
/// `ReadCoils`/`ReadDiscreteInputs` carry the packed bitmap exactly as
/// received; the number of valid bits is known to the requester only.
/// Register reads carry big-endian data, two bytes per register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<'a> {
    ReadCoils(&'a [u8]),
    ReadDiscreteInputs(&'a [u8]),
    ReadHoldingRegisters(&'a [u8]),
    ReadInputRegisters(&'a [u8]),
    WriteSingleCoil(Address, Coil),
    WriteSingleRegister(Address, Word),
    WriteMultipleCoils(Address, Quantity),
    WriteMultipleRegisters(Address, Quantity),
    /// Server id data including the trailing run indicator byte.
    ReportServerId(&'a [u8]),
    MaskWriteRegister(Address, Word, Word),
    ReadWriteMultipleRegisters(&'a [u8]),
}

impl Response<'_> {
    /// The function code of this response on the wire.
    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadCoils(_) => 0x01,
            Self::ReadDiscreteInputs(_) => 0x02,
            Self::ReadHoldingRegisters(_) => 0x03,
            Self::ReadInputRegisters(_) => 0x04,
            Self::WriteSingleCoil(_, _) => 0x05,
            Self::WriteSingleRegister(_, _) => 0x06,
            Self::WriteMultipleCoils(_, _) => 0x0F,
            Self::WriteMultipleRegisters(_, _) => 0x10,
            Self::ReportServerId(_) => 0x11,
            Self::MaskWriteRegister(_, _, _) => 0x16,
            Self::ReadWriteMultipleRegisters(_) => 0x17,
        }
    }
}

/// A server (slave) exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDevice = 0x0B,
}

impl ExceptionCode {
    pub(crate) fn description(&self) -> &'static str {
        use ExceptionCode::*;

        match *self {
            IllegalFunction => "Illegal function",
            IllegalDataAddress => "Illegal data address",
            IllegalDataValue => "Illegal data value",
            ServerDeviceFailure => "Server device failure",
            Acknowledge => "Acknowledge",
            ServerDeviceBusy => "Server device busy",
            MemoryParityError => "Memory parity error",
            GatewayPathUnavailable => "Gateway path unavailable",
            GatewayTargetDevice => "Gateway target device failed to respond",
        }
    }

    /// Decode an exception code byte, `None` for codes outside the
    /// defined set.
    #[must_use]
    pub fn from_u8(code: u8) -> Option<Self> {
        use ExceptionCode::*;

        let ex = match code {
            0x01 => IllegalFunction,
            0x02 => IllegalDataAddress,
            0x03 => IllegalDataValue,
            0x04 => ServerDeviceFailure,
            0x05 => Acknowledge,
            0x06 => ServerDeviceBusy,
            0x08 => MemoryParityError,
            0x0A => GatewayPathUnavailable,
            0x0B => GatewayTargetDevice,
            _ => return None,
        };
        Some(ex)
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl error::Error for ExceptionCode {}

/// Number of bytes needed to pack `bitcount` coils.
#[must_use]
pub const fn packed_coils_len(bitcount: usize) -> usize {
    (bitcount + 7) / 8
}

/// Pack coil states into a bitmap, LSB first.
#[must_use]
pub fn pack_coils(coils: &[Coil]) -> Vec<u8> {
    let mut res = vec![0; packed_coils_len(coils.len())];
    pack_coils_into(coils, &mut res);
    res
}

/// Pack coil states into a caller-owned bitmap, returning the number of
/// bytes written.
///
/// `out` must hold at least [`packed_coils_len`] bytes.
pub fn pack_coils_into(coils: &[Coil], out: &mut [u8]) -> usize {
    let len = packed_coils_len(coils.len());
    out[..len].fill(0);
    for (i, b) in coils.iter().enumerate() {
        if *b {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    len
}

/// Unpack `count` coil states from a bitmap.
#[must_use]
pub fn unpack_coils(bytes: &[u8], count: u16) -> Vec<Coil> {
    let mut res = Vec::with_capacity(count.into());
    for i in 0..usize::from(count) {
        res.push((bytes[i / 8] >> (i % 8)) & 0b1 > 0);
    }
    res
}

/// Unpack `count` coil states into a caller-owned buffer.
pub fn unpack_coils_into(bytes: &[u8], count: u16, out: &mut [Coil]) {
    for i in 0..usize::from(count) {
        out[i] = (bytes[i / 8] >> (i % 8)) & 0b1 > 0;
    }
}

/// Decode big-endian register data into words.
#[must_use]
pub fn words_from_be(data: &[u8]) -> Vec<Word> {
    data.chunks_exact(2)
        .map(|c| Word::from_be_bytes([c[0], c[1]]))
        .collect()
}
