// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Synchronous convenience API
//!
//! Typed wrappers that submit a request and then loop `poll` +
//! `yield_now` until the transaction reaches a terminal state. These are
//! the only looping functions in the engine; they never block on the
//! transport itself, so a cooperative host (or an RTOS task calling a
//! sleeping `yield_now`) stays responsive. Decoded payloads are copied
//! into owned values at this boundary.

use smallvec::SmallVec;

use crate::{
    client::{Call, Client, Listener, Priority, DEFAULT_RETRY_BACKOFF_MS, DEFAULT_TIMEOUT_MS},
    codec,
    error::{Error, Result},
    frame::{
        pack_coils_into, packed_coils_len, unpack_coils, words_from_be, Address, Coil, Quantity,
        Request, Response, Word,
    },
    transport::Transport,
};

use super::PduBuf;

/// Per-call knobs of the synchronous API.
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub timeout_ms: u32,
    pub max_retries: u8,
    pub retry_backoff_ms: u32,
    pub priority: Priority,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: 0,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            priority: Priority::Normal,
        }
    }
}

impl<T, L> Client<T, L>
where
    T: Transport,
    L: Listener,
{
    /// Submit and drive a request to completion, returning the raw
    /// response PDU. The regular listener is bypassed for this call.
    fn run_sync(
        &mut self,
        unit_id: u8,
        request: Request<'_>,
        options: &SyncOptions,
    ) -> Result<PduBuf> {
        let call = Call {
            unit_id,
            request,
            timeout_ms: options.timeout_ms,
            max_retries: options.max_retries,
            retry_backoff_ms: options.retry_backoff_ms,
            priority: options.priority,
            retry_on_busy: false,
            token: 0,
        };
        let handle = self.submit(&call)?;
        if let Some(slot) = self.pool.get_mut(handle) {
            slot.sync = true;
        }

        // Terminal state is guaranteed by the per-attempt deadline, so
        // this loop always ends.
        loop {
            let _ = self.poll();
            if let Some(done) = self.sync_done.take() {
                if done.handle != handle {
                    let _ = self.pool.release(done.handle);
                    continue;
                }
                let result = match done.status {
                    Ok(()) => {
                        let slot = self.pool.get(handle).ok_or(Error::Other)?;
                        let mut pdu = PduBuf::new();
                        pdu.extend_from_slice(&slot.response);
                        Ok(pdu)
                    }
                    Err(err) => Err(err),
                };
                let _ = self.pool.release(handle);
                return result;
            }
            self.transport_mut().yield_now();
        }
    }

    pub fn read_coils(
        &mut self,
        unit_id: u8,
        addr: Address,
        cnt: Quantity,
        options: &SyncOptions,
    ) -> Result<Vec<Coil>> {
        let pdu = self.run_sync(unit_id, Request::ReadCoils(addr, cnt), options)?;
        match codec::parse_response(0x01, &pdu)? {
            Response::ReadCoils(data) => {
                if data.len() < packed_coils_len(usize::from(cnt)) {
                    return Err(Error::InvalidRequest);
                }
                Ok(unpack_coils(data, cnt))
            }
            _ => Err(Error::InvalidRequest),
        }
    }

    pub fn read_discrete_inputs(
        &mut self,
        unit_id: u8,
        addr: Address,
        cnt: Quantity,
        options: &SyncOptions,
    ) -> Result<Vec<Coil>> {
        let pdu = self.run_sync(unit_id, Request::ReadDiscreteInputs(addr, cnt), options)?;
        match codec::parse_response(0x02, &pdu)? {
            Response::ReadDiscreteInputs(data) => {
                if data.len() < packed_coils_len(usize::from(cnt)) {
                    return Err(Error::InvalidRequest);
                }
                Ok(unpack_coils(data, cnt))
            }
            _ => Err(Error::InvalidRequest),
        }
    }

    pub fn read_holding_registers(
        &mut self,
        unit_id: u8,
        addr: Address,
        cnt: Quantity,
        options: &SyncOptions,
    ) -> Result<Vec<Word>> {
        let pdu = self.run_sync(unit_id, Request::ReadHoldingRegisters(addr, cnt), options)?;
        match codec::parse_response(0x03, &pdu)? {
            Response::ReadHoldingRegisters(data) if data.len() == 2 * usize::from(cnt) => {
                Ok(words_from_be(data))
            }
            _ => Err(Error::InvalidRequest),
        }
    }

    pub fn read_input_registers(
        &mut self,
        unit_id: u8,
        addr: Address,
        cnt: Quantity,
        options: &SyncOptions,
    ) -> Result<Vec<Word>> {
        let pdu = self.run_sync(unit_id, Request::ReadInputRegisters(addr, cnt), options)?;
        match codec::parse_response(0x04, &pdu)? {
            Response::ReadInputRegisters(data) if data.len() == 2 * usize::from(cnt) => {
                Ok(words_from_be(data))
            }
            _ => Err(Error::InvalidRequest),
        }
    }

    pub fn write_single_coil(
        &mut self,
        unit_id: u8,
        addr: Address,
        state: Coil,
        options: &SyncOptions,
    ) -> Result<()> {
        let pdu = self.run_sync(unit_id, Request::WriteSingleCoil(addr, state), options)?;
        match codec::parse_response(0x05, &pdu)? {
            // The response echoes the request.
            Response::WriteSingleCoil(rsp_addr, rsp_state)
                if rsp_addr == addr && rsp_state == state =>
            {
                Ok(())
            }
            _ => Err(Error::InvalidRequest),
        }
    }

    pub fn write_single_register(
        &mut self,
        unit_id: u8,
        addr: Address,
        value: Word,
        options: &SyncOptions,
    ) -> Result<()> {
        let pdu = self.run_sync(unit_id, Request::WriteSingleRegister(addr, value), options)?;
        match codec::parse_response(0x06, &pdu)? {
            Response::WriteSingleRegister(rsp_addr, rsp_value)
                if rsp_addr == addr && rsp_value == value =>
            {
                Ok(())
            }
            _ => Err(Error::InvalidRequest),
        }
    }

    pub fn write_multiple_coils(
        &mut self,
        unit_id: u8,
        addr: Address,
        coils: &[Coil],
        options: &SyncOptions,
    ) -> Result<()> {
        let quantity = coils.len() as Quantity;
        let mut packed = SmallVec::<[u8; 256]>::new();
        packed.resize(packed_coils_len(coils.len()), 0);
        pack_coils_into(coils, &mut packed);
        let pdu = self.run_sync(
            unit_id,
            Request::WriteMultipleCoils(addr, quantity, &packed),
            options,
        )?;
        match codec::parse_response(0x0F, &pdu)? {
            Response::WriteMultipleCoils(rsp_addr, rsp_quantity)
                if rsp_addr == addr && rsp_quantity == quantity =>
            {
                Ok(())
            }
            _ => Err(Error::InvalidRequest),
        }
    }

    pub fn write_multiple_registers(
        &mut self,
        unit_id: u8,
        addr: Address,
        words: &[Word],
        options: &SyncOptions,
    ) -> Result<()> {
        let quantity = words.len() as Quantity;
        let mut data = SmallVec::<[u8; 256]>::new();
        for word in words {
            data.extend_from_slice(&word.to_be_bytes());
        }
        let pdu = self.run_sync(unit_id, Request::WriteMultipleRegisters(addr, &data), options)?;
        match codec::parse_response(0x10, &pdu)? {
            Response::WriteMultipleRegisters(rsp_addr, rsp_quantity)
                if rsp_addr == addr && rsp_quantity == quantity =>
            {
                Ok(())
            }
            _ => Err(Error::InvalidRequest),
        }
    }

    pub fn read_write_multiple_registers(
        &mut self,
        unit_id: u8,
        read_addr: Address,
        read_count: Quantity,
        write_addr: Address,
        write_data: &[Word],
        options: &SyncOptions,
    ) -> Result<Vec<Word>> {
        let mut data = SmallVec::<[u8; 256]>::new();
        for word in write_data {
            data.extend_from_slice(&word.to_be_bytes());
        }
        let pdu = self.run_sync(
            unit_id,
            Request::ReadWriteMultipleRegisters(read_addr, read_count, write_addr, &data),
            options,
        )?;
        match codec::parse_response(0x17, &pdu)? {
            Response::ReadWriteMultipleRegisters(data)
                if data.len() == 2 * usize::from(read_count) =>
            {
                Ok(words_from_be(data))
            }
            _ => Err(Error::InvalidRequest),
        }
    }

    pub fn mask_write_register(
        &mut self,
        unit_id: u8,
        addr: Address,
        and_mask: Word,
        or_mask: Word,
        options: &SyncOptions,
    ) -> Result<()> {
        let pdu = self.run_sync(
            unit_id,
            Request::MaskWriteRegister(addr, and_mask, or_mask),
            options,
        )?;
        match codec::parse_response(0x16, &pdu)? {
            Response::MaskWriteRegister(rsp_addr, rsp_and, rsp_or)
                if rsp_addr == addr && rsp_and == and_mask && rsp_or == or_mask =>
            {
                Ok(())
            }
            _ => Err(Error::InvalidRequest),
        }
    }

    /// Server id data as reported by the device, including the trailing
    /// run indicator byte.
    pub fn report_server_id(&mut self, unit_id: u8, options: &SyncOptions) -> Result<Vec<u8>> {
        let pdu = self.run_sync(unit_id, Request::ReportServerId, options)?;
        match codec::parse_response(0x11, &pdu)? {
            Response::ReportServerId(data) => Ok(data.to_vec()),
            _ => Err(Error::InvalidRequest),
        }
    }
}
