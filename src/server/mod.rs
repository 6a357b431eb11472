// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server engine
//!
//! The server accepts decoded request frames from its framing codec,
//! routes reads and writes to the matching [`Region`] and emits a
//! response or a Modbus exception over the same transport. One request is
//! processed at a time; the framing decoder serializes delivery.
//!
//! Requests addressed to a foreign unit are ignored. Broadcast requests
//! (unit id `0`) apply their writes but are never answered.

mod region;

pub use self::region::{Region, RegionHandler, RegionKind};

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    codec::{self, Framing},
    diag::{Diag, DiagSnapshot, ErrorSlot, TraceKind, TraceSource},
    error::{Error, Result},
    frame::{
        pack_coils_into, unpack_coils_into, Address, Coil, ExceptionCode, Request, Response, Word,
        MAX_PDU_LEN,
    },
    transport::Transport,
    unit::Unit,
};

/// Largest data field of a read response.
const MAX_DATA_LEN: usize = MAX_PDU_LEN - 3;

/// Construction-time limits and knobs.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Maximum number of regions, fixed for the engine's lifetime.
    pub regions_capacity: usize,
    /// Device description reported by Report Server Id (0x11), without
    /// the run indicator byte. At most 249 bytes are reported.
    pub server_id: Vec<u8>,
    /// Log TX/RX frames as hex at trace level.
    pub trace_hex: bool,
    /// Depth of the diagnostic event trace, `0` disables it.
    pub trace_depth: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            regions_capacity: 8,
            server_id: b"modbus-engine".to_vec(),
            trace_hex: false,
            trace_depth: 32,
        }
    }
}

enum Intake {
    /// No complete frame available.
    Idle,
    /// Frame consumed without a response (foreign unit, broadcast,
    /// decode failure).
    Ignored,
    /// Response PDU staged, to be framed with this transaction id.
    Respond(u16),
}

/// A poll-driven Modbus server over one transport.
#[derive(Debug)]
pub struct Server<T> {
    transport: T,
    framing: Framing,
    unit_id: u8,
    regions: Vec<Region>,
    regions_capacity: usize,
    server_id: Vec<u8>,
    rx_chunk: [u8; 260],
    req_pdu: BytesMut,
    rsp_pdu: BytesMut,
    adu_scratch: BytesMut,
    tx: BytesMut,
    bits_scratch: Vec<Coil>,
    words_scratch: Vec<Word>,
    trace_hex: bool,
    diag: Diag,
}

impl<T> Server<T>
where
    T: Transport,
{
    pub fn new(transport: T, framing: Framing, unit_id: u8) -> Self {
        Self::with_options(transport, framing, unit_id, ServerOptions::default())
    }

    pub fn with_options(
        transport: T,
        framing: Framing,
        unit_id: u8,
        options: ServerOptions,
    ) -> Self {
        let trace_hex = options.trace_hex;
        let trace_depth = options.trace_depth;
        Self {
            transport,
            framing,
            unit_id,
            regions: Vec::with_capacity(options.regions_capacity),
            regions_capacity: options.regions_capacity,
            server_id: options.server_id,
            rx_chunk: [0; 260],
            req_pdu: BytesMut::with_capacity(MAX_PDU_LEN),
            rsp_pdu: BytesMut::with_capacity(MAX_PDU_LEN),
            adu_scratch: BytesMut::with_capacity(2 * MAX_PDU_LEN),
            tx: BytesMut::with_capacity(4 * MAX_PDU_LEN),
            bits_scratch: vec![false; usize::from(codec::MAX_READ_BITS)],
            words_scratch: vec![0; usize::from(codec::MAX_READ_WORDS)],
            trace_hex,
            diag: Diag::new(TraceSource::Server, trace_depth),
        }
    }

    /// The unit id this server answers to (besides broadcast).
    #[must_use]
    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Toggle hex dumps of TX/RX frames at trace level.
    pub fn set_trace_hex(&mut self, on: bool) {
        self.trace_hex = on;
    }

    #[must_use]
    pub fn diag(&self) -> &Diag {
        &self.diag
    }

    #[must_use]
    pub fn diag_snapshot(&self) -> DiagSnapshot {
        self.diag.snapshot()
    }

    pub fn diag_reset(&mut self) {
        self.diag.reset();
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Register an address range.
    ///
    /// Fails with [`Error::NoResources`] when the region table is full
    /// and with [`Error::InvalidArgument`] for an empty range, an
    /// overflowing range or an overlap with a same-kind region.
    pub fn add_region(&mut self, region: Region) -> Result<()> {
        if self.regions.len() >= self.regions_capacity {
            return Err(Error::NoResources);
        }
        if region.count() == 0
            || u32::from(region.start()) + u32::from(region.count()) > 0x1_0000
        {
            return Err(Error::InvalidArgument);
        }
        if self.regions.iter().any(|r| r.overlaps(&region)) {
            return Err(Error::InvalidArgument);
        }
        self.regions.push(region);
        Ok(())
    }

    /// Process any complete inbound frames and send the responses.
    pub fn poll(&mut self) -> Result<()> {
        let mut hard_error = None;

        loop {
            match self.transport.recv(&mut self.rx_chunk) {
                Ok(0) | Err(Error::Timeout) => break,
                Ok(n) => {
                    let now = self.transport.now_ms();
                    if self.trace_hex {
                        log::trace!("RX {:02X?}", &self.rx_chunk[..n]);
                    }
                    self.framing.accept(&self.rx_chunk[..n], now);
                }
                Err(err) => {
                    hard_error = Some(err);
                    break;
                }
            }
        }

        loop {
            let now = self.transport.now_ms();
            match self.take_request(now) {
                Intake::Idle => break,
                Intake::Ignored => continue,
                Intake::Respond(transaction_id) => {
                    if let Err(err) = self.queue_reply(transaction_id, now) {
                        hard_error.get_or_insert(err);
                    }
                }
            }
        }

        if let Err(err) = self.flush_tx() {
            hard_error.get_or_insert(err);
        }

        match hard_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Decode one frame and stage a response PDU for it, if any.
    fn take_request(&mut self, now: u64) -> Intake {
        let Self {
            framing,
            regions,
            bits_scratch,
            words_scratch,
            req_pdu,
            rsp_pdu,
            server_id,
            unit_id,
            trace_hex,
            diag,
            ..
        } = self;

        match framing.poll_frame(now) {
            Ok(None) => Intake::Idle,
            Err(err) => {
                diag.count_error(ErrorSlot::from(&err));
                log::warn!("failed to decode request frame: {err}");
                Intake::Ignored
            }
            Ok(Some(frame)) => {
                let function = frame.adu.function;
                let request_unit = Unit(frame.adu.unit_id);
                if frame.adu.unit_id != *unit_id && !request_unit.is_broadcast() {
                    log::debug!("ignoring request for unit {request_unit}");
                    return Intake::Ignored;
                }
                if function & 0x80 != 0 {
                    // An exception marker is never a request.
                    diag.count_error(ErrorSlot::InvalidRequest);
                    return Intake::Ignored;
                }
                if *trace_hex {
                    log::trace!(
                        "RX request unit = {request_unit} fc = 0x{function:0>2X} payload = {:02X?}",
                        frame.adu.payload
                    );
                }
                let broadcast = request_unit.is_broadcast();
                diag.count_function(function);
                diag.record(now, TraceKind::RxComplete, function, None);

                req_pdu.clear();
                req_pdu.put_u8(function);
                req_pdu.put_slice(frame.adu.payload);
                rsp_pdu.clear();

                let result = if codec::supported_request_function(function) {
                    match codec::parse_request(req_pdu) {
                        Ok(request) => execute(
                            regions,
                            bits_scratch,
                            words_scratch,
                            server_id,
                            &request,
                            rsp_pdu,
                        ),
                        // Malformed fields of a known request.
                        Err(_) => Err(ExceptionCode::IllegalDataValue),
                    }
                } else {
                    Err(ExceptionCode::IllegalFunction)
                };

                if let Err(code) = result {
                    rsp_pdu.clear();
                    codec::encode_exception(function, code, rsp_pdu);
                    diag.count_error(ErrorSlot::Exception);
                    diag.record(now, TraceKind::StateChange, function, Some(ErrorSlot::Exception));
                }

                if broadcast {
                    Intake::Ignored
                } else {
                    Intake::Respond(frame.transaction_id.unwrap_or(0))
                }
            }
        }
    }

    fn queue_reply(&mut self, transaction_id: u16, now: u64) -> Result<()> {
        self.adu_scratch.clear();
        self.framing.encode(
            self.unit_id,
            transaction_id,
            &self.rsp_pdu,
            &mut self.adu_scratch,
        )?;
        if self.trace_hex {
            log::trace!("TX {:02X?}", &self.adu_scratch[..]);
        }
        let function = self.rsp_pdu.first().copied().unwrap_or_default();
        self.tx.extend_from_slice(&self.adu_scratch);
        self.diag.record(now, TraceKind::TxSent, function, None);
        self.flush_tx()
    }

    fn flush_tx(&mut self) -> Result<()> {
        while !self.tx.is_empty() {
            match self.transport.send(&self.tx) {
                Ok(0) => break,
                Ok(n) => {
                    self.tx.advance(n);
                }
                Err(err) => {
                    self.tx.clear();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    // Host-side access to region storage. These bypass the `read_only`
    // protection, which only guards protocol writes, and work for
    // callback-backed regions as well.

    pub fn read_holding(&mut self, addr: Address) -> Result<Word> {
        let mut out = [0];
        self.region_read_words(RegionKind::HoldingRegisters, addr, &mut out)?;
        Ok(out[0])
    }

    pub fn write_holding(&mut self, addr: Address, value: Word) -> Result<()> {
        self.region_write_words(RegionKind::HoldingRegisters, addr, &[value])
    }

    pub fn write_holding_registers(&mut self, addr: Address, values: &[Word]) -> Result<()> {
        self.region_write_words(RegionKind::HoldingRegisters, addr, values)
    }

    pub fn read_input_register(&mut self, addr: Address) -> Result<Word> {
        let mut out = [0];
        self.region_read_words(RegionKind::InputRegisters, addr, &mut out)?;
        Ok(out[0])
    }

    pub fn write_input_register(&mut self, addr: Address, value: Word) -> Result<()> {
        self.region_write_words(RegionKind::InputRegisters, addr, &[value])
    }

    pub fn write_input_registers(&mut self, addr: Address, values: &[Word]) -> Result<()> {
        self.region_write_words(RegionKind::InputRegisters, addr, values)
    }

    pub fn coil(&mut self, addr: Address) -> Result<Coil> {
        let mut out = [false];
        self.region_read_bits(RegionKind::Coils, addr, &mut out)?;
        Ok(out[0])
    }

    pub fn set_coil(&mut self, addr: Address, state: Coil) -> Result<()> {
        self.region_write_bits(RegionKind::Coils, addr, &[state])
    }

    pub fn discrete_input(&mut self, addr: Address) -> Result<Coil> {
        let mut out = [false];
        self.region_read_bits(RegionKind::DiscreteInputs, addr, &mut out)?;
        Ok(out[0])
    }

    pub fn set_discrete_input(&mut self, addr: Address, state: Coil) -> Result<()> {
        self.region_write_bits(RegionKind::DiscreteInputs, addr, &[state])
    }

    fn region_read_words(
        &mut self,
        kind: RegionKind,
        addr: Address,
        out: &mut [Word],
    ) -> Result<()> {
        let region = find_region(&mut self.regions, kind, addr, out.len() as u16)
            .ok_or(Error::InvalidArgument)?;
        region.read_words_into(addr, out).map_err(Error::Exception)
    }

    fn region_write_words(&mut self, kind: RegionKind, addr: Address, values: &[Word]) -> Result<()> {
        let region = find_region(&mut self.regions, kind, addr, values.len() as u16)
            .ok_or(Error::InvalidArgument)?;
        region
            .write_words_from(addr, values)
            .map_err(Error::Exception)
    }

    fn region_read_bits(&mut self, kind: RegionKind, addr: Address, out: &mut [Coil]) -> Result<()> {
        let region = find_region(&mut self.regions, kind, addr, out.len() as u16)
            .ok_or(Error::InvalidArgument)?;
        region.read_bits_into(addr, out).map_err(Error::Exception)
    }

    fn region_write_bits(&mut self, kind: RegionKind, addr: Address, values: &[Coil]) -> Result<()> {
        let region = find_region(&mut self.regions, kind, addr, values.len() as u16)
            .ok_or(Error::InvalidArgument)?;
        region
            .write_bits_from(addr, values)
            .map_err(Error::Exception)
    }
}

fn find_region(
    regions: &mut [Region],
    kind: RegionKind,
    addr: Address,
    quantity: u16,
) -> Option<&mut Region> {
    regions
        .iter_mut()
        .find(|r| r.kind() == kind && r.covers(addr, quantity))
}

/// Route one validated request and stage its response PDU into `out`.
fn execute(
    regions: &mut [Region],
    bits_scratch: &mut [Coil],
    words_scratch: &mut [Word],
    server_id: &[u8],
    request: &Request<'_>,
    out: &mut BytesMut,
) -> core::result::Result<(), ExceptionCode> {
    use ExceptionCode::{IllegalDataAddress, ServerDeviceFailure};

    match *request {
        Request::ReadCoils(addr, quantity) | Request::ReadDiscreteInputs(addr, quantity) => {
            let kind = if matches!(request, Request::ReadCoils(_, _)) {
                RegionKind::Coils
            } else {
                RegionKind::DiscreteInputs
            };
            let region = find_region(regions, kind, addr, quantity).ok_or(IllegalDataAddress)?;
            let bits = &mut bits_scratch[..usize::from(quantity)];
            region.read_bits_into(addr, bits)?;
            let mut packed = [0u8; MAX_DATA_LEN];
            let n = pack_coils_into(bits, &mut packed);
            let response = if kind == RegionKind::Coils {
                Response::ReadCoils(&packed[..n])
            } else {
                Response::ReadDiscreteInputs(&packed[..n])
            };
            codec::encode_response(&response, out).map_err(|_| ServerDeviceFailure)
        }
        Request::ReadHoldingRegisters(addr, quantity) | Request::ReadInputRegisters(addr, quantity) => {
            let kind = if matches!(request, Request::ReadHoldingRegisters(_, _)) {
                RegionKind::HoldingRegisters
            } else {
                RegionKind::InputRegisters
            };
            let region = find_region(regions, kind, addr, quantity).ok_or(IllegalDataAddress)?;
            let words = &mut words_scratch[..usize::from(quantity)];
            region.read_words_into(addr, words)?;
            let mut data = [0u8; MAX_DATA_LEN];
            for (i, word) in words.iter().enumerate() {
                data[2 * i..2 * i + 2].copy_from_slice(&word.to_be_bytes());
            }
            let data = &data[..2 * words.len()];
            let response = if kind == RegionKind::HoldingRegisters {
                Response::ReadHoldingRegisters(data)
            } else {
                Response::ReadInputRegisters(data)
            };
            codec::encode_response(&response, out).map_err(|_| ServerDeviceFailure)
        }
        Request::WriteSingleCoil(addr, state) => {
            let region =
                find_region(regions, RegionKind::Coils, addr, 1).ok_or(IllegalDataAddress)?;
            if region.is_read_only() {
                return Err(IllegalDataAddress);
            }
            region.write_bits_from(addr, &[state])?;
            codec::encode_response(&Response::WriteSingleCoil(addr, state), out)
                .map_err(|_| ServerDeviceFailure)
        }
        Request::WriteSingleRegister(addr, value) => {
            let region = find_region(regions, RegionKind::HoldingRegisters, addr, 1)
                .ok_or(IllegalDataAddress)?;
            if region.is_read_only() {
                return Err(IllegalDataAddress);
            }
            region.write_words_from(addr, &[value])?;
            codec::encode_response(&Response::WriteSingleRegister(addr, value), out)
                .map_err(|_| ServerDeviceFailure)
        }
        Request::WriteMultipleCoils(addr, quantity, packed) => {
            let region = find_region(regions, RegionKind::Coils, addr, quantity)
                .ok_or(IllegalDataAddress)?;
            if region.is_read_only() {
                return Err(IllegalDataAddress);
            }
            let bits = &mut bits_scratch[..usize::from(quantity)];
            unpack_coils_into(packed, quantity, bits);
            region.write_bits_from(addr, bits)?;
            codec::encode_response(&Response::WriteMultipleCoils(addr, quantity), out)
                .map_err(|_| ServerDeviceFailure)
        }
        Request::WriteMultipleRegisters(addr, data) => {
            let quantity = (data.len() / 2) as u16;
            let region = find_region(regions, RegionKind::HoldingRegisters, addr, quantity)
                .ok_or(IllegalDataAddress)?;
            if region.is_read_only() {
                return Err(IllegalDataAddress);
            }
            let words = &mut words_scratch[..usize::from(quantity)];
            for (i, word) in words.iter_mut().enumerate() {
                *word = Word::from_be_bytes([data[2 * i], data[2 * i + 1]]);
            }
            region.write_words_from(addr, words)?;
            codec::encode_response(&Response::WriteMultipleRegisters(addr, quantity), out)
                .map_err(|_| ServerDeviceFailure)
        }
        Request::ReportServerId => {
            let mut data = [0u8; MAX_DATA_LEN];
            let n = server_id.len().min(MAX_DATA_LEN - 1);
            data[..n].copy_from_slice(&server_id[..n]);
            // Run indicator: on.
            data[n] = 0xFF;
            codec::encode_response(&Response::ReportServerId(&data[..n + 1]), out)
                .map_err(|_| ServerDeviceFailure)
        }
        Request::MaskWriteRegister(addr, and_mask, or_mask) => {
            let region = find_region(regions, RegionKind::HoldingRegisters, addr, 1)
                .ok_or(IllegalDataAddress)?;
            if region.is_read_only() {
                return Err(IllegalDataAddress);
            }
            let mut current = [0];
            region.read_words_into(addr, &mut current)?;
            let value = (current[0] & and_mask) | (or_mask & !and_mask);
            region.write_words_from(addr, &[value])?;
            codec::encode_response(&Response::MaskWriteRegister(addr, and_mask, or_mask), out)
                .map_err(|_| ServerDeviceFailure)
        }
        Request::ReadWriteMultipleRegisters(read_addr, read_quantity, write_addr, write_data) => {
            // The write is applied before the read.
            let write_quantity = (write_data.len() / 2) as u16;
            let region = find_region(regions, RegionKind::HoldingRegisters, write_addr, write_quantity)
                .ok_or(IllegalDataAddress)?;
            if region.is_read_only() {
                return Err(IllegalDataAddress);
            }
            let words = &mut words_scratch[..usize::from(write_quantity)];
            for (i, word) in words.iter_mut().enumerate() {
                *word = Word::from_be_bytes([write_data[2 * i], write_data[2 * i + 1]]);
            }
            region.write_words_from(write_addr, words)?;

            let region = find_region(regions, RegionKind::HoldingRegisters, read_addr, read_quantity)
                .ok_or(IllegalDataAddress)?;
            let words = &mut words_scratch[..usize::from(read_quantity)];
            region.read_words_into(read_addr, words)?;
            let mut data = [0u8; MAX_DATA_LEN];
            for (i, word) in words.iter().enumerate() {
                data[2 * i..2 * i + 2].copy_from_slice(&word.to_be_bytes());
            }
            codec::encode_response(
                &Response::ReadWriteMultipleRegisters(&data[..2 * usize::from(read_quantity)]),
                out,
            )
            .map_err(|_| ServerDeviceFailure)
        }
    }
}
