// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client engine
//!
//! The client owns a fixed pool of transaction slots and drives them
//! through `Pending → InFlight → terminal` from a cooperative [`poll`]
//! loop. Submitting never blocks and polling never suspends the caller;
//! deadlines, retries, cancellation and the link watchdog are all
//! observed inside [`poll`], so deadline accuracy is bounded by the poll
//! cadence.
//!
//! On half-duplex framings (RTU, ASCII) at most one transaction is in
//! flight and responses are correlated by bus turnaround; on TCP up to
//! the pool capacity may be in flight concurrently, correlated by the
//! MBAP transaction id.
//!
//! [`poll`]: Client::poll

#[cfg(feature = "sync")]
pub mod sync;

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use smallvec::SmallVec;

use crate::{
    codec::{self, Framing},
    diag::{Diag, DiagSnapshot, ErrorSlot, TraceKind, TraceSource},
    error::{Error, Result},
    frame::{ExceptionCode, Request, Response, MAX_PDU_LEN},
    mem::{Handle, Pool},
    transport::Transport,
};

/// Default per-attempt response timeout.
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;

/// Default delay before a retry attempt is queued again.
pub const DEFAULT_RETRY_BACKOFF_MS: u32 = 100;

/// Default number of internal steps one [`Client::poll`] call performs.
pub const DEFAULT_POLL_BUDGET: usize = 32;

/// Wrap-safe "has `at` been reached" comparison.
const fn time_reached(now: u64, at: u64) -> bool {
    (now.wrapping_sub(at) as i64) >= 0
}

type PduBuf = SmallVec<[u8; 256]>;

/// Scheduling band of a transaction.
///
/// The high band is drained strictly before the normal band; within a
/// band requests go out in submission order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    High,
    #[default]
    Normal,
}

/// Observable state of a live transaction.
///
/// Terminal transactions disappear from the pool once their completion
/// has been delivered, so [`Client::state`] answers `None` for them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionState {
    #[default]
    Pending,
    InFlight,
}

/// A request submission.
#[derive(Debug, Clone, Copy)]
pub struct Call<'a> {
    pub unit_id: u8,
    pub request: Request<'a>,
    /// Per-attempt response deadline.
    pub timeout_ms: u32,
    pub max_retries: u8,
    pub retry_backoff_ms: u32,
    pub priority: Priority,
    /// Opt into retrying `ServerDeviceBusy` exceptions. All other
    /// exceptions terminate the transaction regardless of retries left.
    pub retry_on_busy: bool,
    /// Opaque value handed back in the completion.
    pub token: u64,
}

impl<'a> Call<'a> {
    #[must_use]
    pub fn new(unit_id: u8, request: Request<'a>) -> Self {
        Self {
            unit_id,
            request,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: 0,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            priority: Priority::Normal,
            retry_on_busy: false,
            token: 0,
        }
    }

    #[must_use]
    pub fn timeout(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn retries(mut self, max_retries: u8, backoff_ms: u32) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: u64) -> Self {
        self.token = token;
        self
    }
}

/// Delivered exactly once for every terminal transaction.
///
/// The borrowed response payload is only valid for the duration of the
/// [`Listener::completed`] call; retain data by copying it out, e.g. with
/// [`crate::frame::words_from_be`].
#[derive(Debug)]
pub struct Completion<'a> {
    pub handle: Handle,
    pub token: u64,
    pub unit_id: u8,
    pub function: u8,
    pub status: Result<Response<'a>>,
}

/// Completion sink of a client instance.
///
/// Callbacks run inside [`Client::poll`] and must not block.
pub trait Listener {
    fn completed(&mut self, completion: Completion<'_>);

    /// Invoked once when the engine has been quiescent for the
    /// configured idle interval, e.g. to enter a low-power state.
    /// Activity rearms the hook.
    fn idle(&mut self, _now_ms: u64) {}
}

/// Discards all completions.
#[derive(Debug, Default)]
pub struct Ignore;

impl Listener for Ignore {
    fn completed(&mut self, _completion: Completion<'_>) {}
}

/// Adapts a closure to the [`Listener`] trait.
#[derive(Debug)]
pub struct FnListener<F>(pub F);

impl<F> Listener for FnListener<F>
where
    F: FnMut(Completion<'_>),
{
    fn completed(&mut self, completion: Completion<'_>) {
        (self.0)(completion);
    }
}

/// Construction-time limits and knobs.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Number of transaction slots, fixed for the engine's lifetime.
    pub pool_capacity: usize,
    /// Admission limit for queued (not yet dispatched) transactions.
    pub queue_capacity: usize,
    /// Force-close a wedged link after this long without any received
    /// frame while requests are in flight. `0` disables the watchdog.
    pub watchdog_ms: u32,
    /// Fire [`Listener::idle`] after this long without activity.
    /// `0` disables idle detection.
    pub idle_after_ms: u32,
    /// Log TX/RX frames as hex at trace level.
    pub trace_hex: bool,
    /// Depth of the diagnostic event trace, `0` disables it.
    pub trace_depth: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            pool_capacity: 16,
            queue_capacity: 16,
            watchdog_ms: 0,
            idle_after_ms: 0,
            trace_hex: false,
            trace_depth: 32,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    token: u64,
    unit_id: u8,
    function: u8,
    request: PduBuf,
    response: PduBuf,
    phase: TransactionState,
    priority: Priority,
    cancel_requested: bool,
    sync: bool,
    retry_on_busy: bool,
    timeout_ms: u32,
    retries_left: u8,
    retry_backoff_ms: u32,
    not_before_ms: u64,
    sent_at_ms: u64,
    tid: u16,
}

#[derive(Debug)]
struct SyncDone {
    handle: Handle,
    status: Result<()>,
}

enum FrameOutcome {
    None,
    Deliver(Handle),
    SlotError(Handle, Error),
    Dropped,
}

/// A poll-driven Modbus client over one transport.
#[derive(Debug)]
pub struct Client<T, L> {
    transport: T,
    listener: L,
    framing: Framing,
    pool: Pool<Slot>,
    queue_high: VecDeque<Handle>,
    queue_normal: VecDeque<Handle>,
    queue_capacity: usize,
    next_tid: u16,
    pdu_scratch: BytesMut,
    adu_scratch: BytesMut,
    tx: BytesMut,
    rx_chunk: [u8; 260],
    watchdog_ms: u32,
    idle_after_ms: u32,
    trace_hex: bool,
    last_rx_ms: u64,
    last_activity_ms: u64,
    idle_signalled: bool,
    sync_done: Option<SyncDone>,
    diag: Diag,
}

impl<T, L> Client<T, L>
where
    T: Transport,
    L: Listener,
{
    pub fn new(transport: T, framing: Framing, listener: L) -> Self {
        Self::with_options(transport, framing, listener, &ClientOptions::default())
    }

    pub fn with_options(
        transport: T,
        framing: Framing,
        listener: L,
        options: &ClientOptions,
    ) -> Self {
        let now = transport.now_ms();
        Self {
            transport,
            listener,
            framing,
            pool: Pool::new(options.pool_capacity),
            queue_high: VecDeque::with_capacity(options.queue_capacity),
            queue_normal: VecDeque::with_capacity(options.queue_capacity),
            queue_capacity: options.queue_capacity,
            next_tid: 0,
            pdu_scratch: BytesMut::with_capacity(MAX_PDU_LEN),
            adu_scratch: BytesMut::with_capacity(2 * MAX_PDU_LEN),
            tx: BytesMut::with_capacity(4 * MAX_PDU_LEN),
            rx_chunk: [0; 260],
            watchdog_ms: options.watchdog_ms,
            idle_after_ms: options.idle_after_ms,
            trace_hex: options.trace_hex,
            last_rx_ms: now,
            last_activity_ms: now,
            idle_signalled: false,
            sync_done: None,
            diag: Diag::new(TraceSource::Client, options.trace_depth),
        }
    }

    /// Bound the number of queued-but-undispatched transactions.
    pub fn set_queue_capacity(&mut self, capacity: usize) {
        self.queue_capacity = capacity;
    }

    /// Reconfigure the link watchdog; `0` disables it.
    pub fn set_watchdog_ms(&mut self, watchdog_ms: u32) {
        self.watchdog_ms = watchdog_ms;
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

    /// Number of transactions admitted but not yet dispatched.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue_high.len() + self.queue_normal.len()
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pool
            .iter()
            .filter(|(_, s)| s.phase == TransactionState::InFlight)
            .count()
    }

    /// Observable state of a live transaction, `None` once terminal.
    #[must_use]
    pub fn state(&self, handle: Handle) -> Option<TransactionState> {
        self.pool.get(handle).map(|s| s.phase)
    }

    /// Admit a request for transmission.
    ///
    /// Fails with [`Error::NoResources`] when the queue or the pool is
    /// full and with [`Error::InvalidArgument`] for malformed requests,
    /// without any side effect in either case.
    pub fn submit(&mut self, call: &Call<'_>) -> Result<Handle> {
        if self.queued() >= self.queue_capacity {
            return Err(Error::NoResources);
        }
        self.pdu_scratch.clear();
        codec::encode_request(&call.request, &mut self.pdu_scratch)?;
        debug_assert!(self.pdu_scratch.len() <= MAX_PDU_LEN);

        let now = self.transport.now_ms();
        let handle = self.pool.acquire().ok_or(Error::NoResources)?;
        let function = call.request.function_code();
        let slot = self.pool.get_mut(handle).ok_or(Error::Other)?;
        slot.token = call.token;
        slot.unit_id = call.unit_id;
        slot.function = function;
        slot.request.clear();
        slot.request.extend_from_slice(&self.pdu_scratch);
        slot.response.clear();
        slot.phase = TransactionState::Pending;
        slot.priority = call.priority;
        slot.cancel_requested = false;
        slot.sync = false;
        slot.retry_on_busy = call.retry_on_busy;
        slot.timeout_ms = call.timeout_ms;
        slot.retries_left = call.max_retries;
        slot.retry_backoff_ms = call.retry_backoff_ms;
        slot.not_before_ms = now;
        slot.sent_at_ms = now;
        slot.tid = 0;

        self.enqueue(handle, call.priority);
        self.diag.count_function(function);
        self.diag.record(now, TraceKind::TxSubmit, function, None);
        self.note_activity(now);
        Ok(handle)
    }

    /// Request cooperative cancellation of a live transaction.
    ///
    /// The next [`poll`](Self::poll) observes the flag and delivers the
    /// completion callback exactly once with [`Error::Cancelled`]. Stale
    /// handles fail with [`Error::InvalidArgument`].
    pub fn cancel(&mut self, handle: Handle) -> Result<()> {
        let slot = self.pool.get_mut(handle).ok_or(Error::InvalidArgument)?;
        slot.cancel_requested = true;
        Ok(())
    }

    /// Drive the engine by one pass with the default work budget.
    ///
    /// Call at >= 1 kHz for RTU, or whenever the socket is readable (plus
    /// a timer tick) for TCP.
    pub fn poll(&mut self) -> Result<()> {
        self.poll_with_budget(DEFAULT_POLL_BUDGET)
    }

    /// Drive the engine, bounding the work done to `budget` internal
    /// steps (received chunks and processed frames).
    pub fn poll_with_budget(&mut self, budget: usize) -> Result<()> {
        let mut budget = budget.max(1);
        let mut hard_error = None;

        // Pump received bytes into the framing decoder.
        loop {
            if budget == 0 {
                break;
            }
            match self.transport.recv(&mut self.rx_chunk) {
                Ok(0) | Err(Error::Timeout) => break,
                Ok(n) => {
                    let now = self.transport.now_ms();
                    if self.trace_hex {
                        log::trace!("RX {:02X?}", &self.rx_chunk[..n]);
                    }
                    self.framing.accept(&self.rx_chunk[..n], now);
                    self.note_activity(now);
                    budget -= 1;
                }
                Err(err) => {
                    hard_error = Some(err);
                    break;
                }
            }
        }

        // Drain complete frames.
        loop {
            if budget == 0 {
                break;
            }
            let now = self.transport.now_ms();
            match self.take_frame(now) {
                FrameOutcome::None => break,
                FrameOutcome::Deliver(handle) => {
                    self.complete(handle, Ok(()));
                    budget -= 1;
                }
                FrameOutcome::SlotError(handle, err) => {
                    self.complete(handle, Err(err));
                    budget -= 1;
                }
                FrameOutcome::Dropped => {
                    budget -= 1;
                }
            }
        }

        let now = self.transport.now_ms();
        self.scan_slots(now);
        self.check_watchdog(now);

        if let Err(err) = self.pump_tx(now) {
            hard_error.get_or_insert(err);
        }

        self.check_idle(self.transport.now_ms());

        match hard_error {
            None => Ok(()),
            Some(err) => {
                self.fail_all_in_flight();
                Err(err)
            }
        }
    }

    fn enqueue(&mut self, handle: Handle, priority: Priority) {
        match priority {
            Priority::High => self.queue_high.push_back(handle),
            Priority::Normal => self.queue_normal.push_back(handle),
        }
    }

    fn note_activity(&mut self, now: u64) {
        self.last_activity_ms = now;
        self.idle_signalled = false;
    }

    fn find_in_flight(pool: &Pool<Slot>, tid: Option<u16>) -> Option<Handle> {
        pool.iter()
            .find(|(_, s)| {
                s.phase == TransactionState::InFlight && tid.map_or(true, |t| s.tid == t)
            })
            .map(|(h, _)| h)
    }

    fn take_frame(&mut self, now: u64) -> FrameOutcome {
        let Self {
            framing,
            pool,
            diag,
            trace_hex,
            last_rx_ms,
            ..
        } = self;

        match framing.poll_frame(now) {
            Ok(None) => FrameOutcome::None,
            Ok(Some(frame)) => {
                *last_rx_ms = now;
                if *trace_hex {
                    log::trace!(
                        "RX frame unit = {} fc = 0x{:0>2X} payload = {:02X?}",
                        frame.adu.unit_id,
                        frame.adu.function,
                        frame.adu.payload
                    );
                }
                let Some(handle) = Self::find_in_flight(pool, frame.transaction_id) else {
                    diag.count_error(ErrorSlot::UnknownTransaction);
                    log::debug!("dropped response frame with no matching transaction");
                    return FrameOutcome::Dropped;
                };
                let Some(slot) = pool.get_mut(handle) else {
                    return FrameOutcome::Dropped;
                };
                if frame.adu.unit_id != slot.unit_id {
                    // Foreign unit id on a correlated response.
                    return FrameOutcome::SlotError(handle, Error::InvalidRequest);
                }
                slot.response.clear();
                slot.response.push(frame.adu.function);
                slot.response.extend_from_slice(frame.adu.payload);
                FrameOutcome::Deliver(handle)
            }
            Err(err) => {
                *last_rx_ms = now;
                if framing.is_half_duplex() {
                    // The decode failure belongs to the outstanding request.
                    if let Some(handle) = Self::find_in_flight(pool, None) {
                        return FrameOutcome::SlotError(handle, err);
                    }
                }
                diag.count_error(ErrorSlot::from(&err));
                log::warn!("failed to decode response frame: {err}");
                FrameOutcome::Dropped
            }
        }
    }

    /// Settle one attempt of a transaction: schedule a retry or deliver
    /// the completion exactly once and release the slot.
    fn complete(&mut self, handle: Handle, outcome: Result<()>) {
        let now = self.transport.now_ms();

        let status: Result<()> = match outcome {
            Ok(()) => {
                let Some(slot) = self.pool.get(handle) else {
                    return;
                };
                codec::parse_response(slot.function, &slot.response).map(|_| ())
            }
            Err(err) => Err(err),
        };

        let Some(slot) = self.pool.get_mut(handle) else {
            return;
        };

        if let Err(err) = status {
            let busy_retry = slot.retry_on_busy
                && matches!(err, Error::Exception(ExceptionCode::ServerDeviceBusy));
            if (err.is_retryable() || busy_retry)
                && slot.retries_left > 0
                && !slot.cancel_requested
            {
                slot.retries_left -= 1;
                slot.phase = TransactionState::Pending;
                slot.not_before_ms = now.wrapping_add(u64::from(slot.retry_backoff_ms));
                let function = slot.function;
                let priority = slot.priority;
                self.diag.count_error(ErrorSlot::from(&err));
                self.diag
                    .record(now, TraceKind::StateChange, function, Some(ErrorSlot::from(&err)));
                log::debug!("scheduling transaction retry after {err}");
                self.enqueue(handle, priority);
                return;
            }
        }

        if slot.sync {
            let function = slot.function;
            match &status {
                Ok(()) => self.diag.record(now, TraceKind::RxComplete, function, None),
                Err(err) => {
                    let error_slot = ErrorSlot::from(err);
                    self.diag.count_error(error_slot);
                    let kind = if matches!(err, Error::Timeout) {
                        TraceKind::TxTimeout
                    } else {
                        TraceKind::StateChange
                    };
                    self.diag.record(now, kind, function, Some(error_slot));
                }
            }
            self.sync_done = Some(SyncDone { handle, status });
            return;
        }

        {
            let Self {
                pool,
                listener,
                diag,
                ..
            } = self;
            let Some(slot) = pool.get(handle) else {
                return;
            };
            let completion_status: Result<Response<'_>> = match status {
                Ok(()) => codec::parse_response(slot.function, &slot.response),
                Err(err) => Err(err),
            };
            match &completion_status {
                Ok(_) => diag.record(now, TraceKind::RxComplete, slot.function, None),
                Err(err) => {
                    let error_slot = ErrorSlot::from(err);
                    diag.count_error(error_slot);
                    let kind = if matches!(err, Error::Timeout) {
                        TraceKind::TxTimeout
                    } else {
                        TraceKind::StateChange
                    };
                    diag.record(now, kind, slot.function, Some(error_slot));
                }
            }
            listener.completed(Completion {
                handle,
                token: slot.token,
                unit_id: slot.unit_id,
                function: slot.function,
                status: completion_status,
            });
        }
        let _ = self.pool.release(handle);
        self.note_activity(now);
    }

    fn scan_slots(&mut self, now: u64) {
        for index in 0..self.pool.capacity() {
            let Some(handle) = self.pool.handle_at(index) else {
                continue;
            };
            let Some(slot) = self.pool.get(handle) else {
                continue;
            };
            let cancelled = slot.cancel_requested;
            let in_flight = slot.phase == TransactionState::InFlight;
            let timed_out =
                in_flight && now.wrapping_sub(slot.sent_at_ms) >= u64::from(slot.timeout_ms);
            if cancelled {
                if in_flight && self.framing.is_half_duplex() {
                    // Drop a partially received late response so it is
                    // not attributed to the next transaction.
                    self.framing.reset();
                }
                self.queue_high.retain(|h| *h != handle);
                self.queue_normal.retain(|h| *h != handle);
                self.complete(handle, Err(Error::Cancelled));
            } else if timed_out {
                self.complete(handle, Err(Error::Timeout));
            }
        }
    }

    fn check_watchdog(&mut self, now: u64) {
        if self.watchdog_ms == 0 {
            return;
        }
        if Self::find_in_flight(&self.pool, None).is_none() {
            return;
        }
        if now.wrapping_sub(self.last_rx_ms) < u64::from(self.watchdog_ms) {
            return;
        }

        log::warn!(
            "watchdog: no frame for {} ms with requests in flight, resetting link state",
            self.watchdog_ms
        );
        self.framing.reset();
        self.diag.count_error(ErrorSlot::Watchdog);
        // Rearm before failing the oldest slot so one wedged interval
        // fails one transaction, not the whole pool at once.
        self.last_rx_ms = now;
        let oldest = self
            .pool
            .iter()
            .filter(|(_, s)| s.phase == TransactionState::InFlight)
            .max_by_key(|(_, s)| now.wrapping_sub(s.sent_at_ms))
            .map(|(h, _)| h);
        if let Some(handle) = oldest {
            self.complete(handle, Err(Error::Transport));
        }
    }

    /// First queued transaction that is ready to go out, high band first.
    fn next_ready(&mut self, now: u64) -> Option<Handle> {
        let Self {
            pool,
            queue_high,
            queue_normal,
            ..
        } = self;
        for queue in [queue_high, queue_normal] {
            let mut i = 0;
            while i < queue.len() {
                let handle = queue[i];
                match pool.get(handle) {
                    // Released or re-dispatched meanwhile: drop the entry.
                    None => {
                        queue.remove(i);
                    }
                    Some(slot) if slot.phase != TransactionState::Pending => {
                        queue.remove(i);
                    }
                    Some(slot) if time_reached(now, slot.not_before_ms) => {
                        queue.remove(i);
                        return Some(handle);
                    }
                    // Still backing off; keep its FIFO position.
                    Some(_) => i += 1,
                }
            }
        }
        None
    }

    fn alloc_tid(&mut self) -> u16 {
        loop {
            self.next_tid = self.next_tid.wrapping_add(1);
            let tid = self.next_tid;
            let in_use = self
                .pool
                .iter()
                .any(|(_, s)| s.phase == TransactionState::InFlight && s.tid == tid);
            if !in_use {
                return tid;
            }
        }
    }

    fn pump_tx(&mut self, now: u64) -> Result<()> {
        // Drain staged output first (full-duplex links accept partial
        // writes; the remainder goes out on later polls).
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

        loop {
            if self.framing.is_half_duplex() && Self::find_in_flight(&self.pool, None).is_some() {
                break;
            }
            let Some(handle) = self.next_ready(now) else {
                break;
            };
            self.dispatch(handle, now)?;
            if self.framing.is_half_duplex() {
                break;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, handle: Handle, now: u64) -> Result<()> {
        let tid = self.alloc_tid();
        let encoded = {
            let Self {
                framing,
                pool,
                adu_scratch,
                ..
            } = self;
            let Some(slot) = pool.get_mut(handle) else {
                return Ok(());
            };
            slot.phase = TransactionState::InFlight;
            slot.sent_at_ms = now;
            slot.tid = tid;
            adu_scratch.clear();
            framing.encode(slot.unit_id, tid, &slot.request, adu_scratch)
        };
        if let Err(err) = encoded {
            self.complete(handle, Err(err));
            return Ok(());
        }
        if self.trace_hex {
            log::trace!("TX {:02X?}", &self.adu_scratch[..]);
        }

        let function = self.pool.get(handle).map_or(0, |s| s.function);
        if self.framing.is_half_duplex() {
            // Half-duplex sends are single-shot: the whole ADU must go
            // out now to keep the bus timing intact.
            match self.transport.send(&self.adu_scratch) {
                Ok(n) if n == self.adu_scratch.len() => {
                    self.diag.record(now, TraceKind::TxSent, function, None);
                    self.note_activity(now);
                }
                Ok(_) | Err(_) => {
                    self.complete(handle, Err(Error::Transport));
                }
            }
        } else {
            self.tx.extend_from_slice(&self.adu_scratch);
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
            self.diag.record(now, TraceKind::TxSent, function, None);
            self.note_activity(now);
        }
        Ok(())
    }

    fn fail_all_in_flight(&mut self) {
        loop {
            let Some(handle) = Self::find_in_flight(&self.pool, None) else {
                break;
            };
            self.complete(handle, Err(Error::Transport));
            // Retried slots leave the in-flight phase, so this loop
            // terminates.
        }
    }

    fn check_idle(&mut self, now: u64) {
        if self.idle_after_ms == 0 || self.idle_signalled {
            return;
        }
        let busy = self.queued() != 0 || !self.pool.is_empty() || !self.tx.is_empty();
        if busy {
            return;
        }
        if now.wrapping_sub(self.last_activity_ms) >= u64::from(self.idle_after_ms) {
            self.listener.idle(now);
            self.idle_signalled = true;
        }
    }
}

#[cfg(all(test, feature = "rtu"))]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::frame::words_from_be;
    use crate::testutil::{sim_pair, SharedClock, SimTransport};

    const SILENCE_MS: u64 = 2;

    type Outcome = (u64, Result<Vec<u16>>);
    type Record = Rc<RefCell<Vec<Outcome>>>;

    fn recording_listener(record: &Record) -> FnListener<impl FnMut(Completion<'_>)> {
        let record = Rc::clone(record);
        FnListener(move |completion: Completion<'_>| {
            let words = completion.status.map(|rsp| match rsp {
                Response::ReadHoldingRegisters(data) | Response::ReadInputRegisters(data) => {
                    words_from_be(data)
                }
                Response::WriteSingleRegister(addr, value) => vec![addr, value],
                _ => Vec::new(),
            });
            record.borrow_mut().push((completion.token, words));
        })
    }

    fn rtu_client(
        transport: SimTransport,
        record: &Record,
    ) -> Client<SimTransport, FnListener<impl FnMut(Completion<'_>)>> {
        Client::new(
            transport,
            Framing::rtu(SILENCE_MS),
            recording_listener(record),
        )
    }

    /// Pop everything the client sent from the peer's end of the link.
    fn drain_peer(peer: &mut SimTransport) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = peer.recv(&mut chunk).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn rtu_read_holding_registers_happy_path() {
        let clock = SharedClock::new();
        let (side_a, mut peer) = sim_pair(&clock);
        let record: Record = Rc::new(RefCell::new(Vec::new()));
        let mut client = rtu_client(side_a, &record);

        let call = Call::new(0x11, Request::ReadHoldingRegisters(0x006B, 3)).with_token(7);
        let handle = client.submit(&call).unwrap();
        assert_eq!(client.state(handle), Some(TransactionState::Pending));

        client.poll().unwrap();
        assert_eq!(client.state(handle), Some(TransactionState::InFlight));
        assert_eq!(
            drain_peer(&mut peer),
            vec![0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87]
        );

        let mut rsp = vec![0x11, 0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64];
        let crc = codec::rtu::calc_crc(&rsp);
        rsp.extend_from_slice(&crc.to_le_bytes());
        peer.send(&rsp).unwrap();
        client.poll().unwrap();
        // Nothing completes before the silence interval elapses.
        assert!(record.borrow().is_empty());

        clock.advance(SILENCE_MS);
        client.poll().unwrap();
        assert_eq!(
            record.borrow().as_slice(),
            &[(7, Ok(vec![0x022B, 0x0000, 0x0064]))]
        );
        assert_eq!(client.state(handle), None);
        assert_eq!(client.diag().function_count(0x03), 1);
    }

    #[test]
    fn half_duplex_priority_ordering() {
        let clock = SharedClock::new();
        let (side_a, mut peer) = sim_pair(&clock);
        let record: Record = Rc::new(RefCell::new(Vec::new()));
        let mut client = rtu_client(side_a, &record);

        let request = Request::ReadHoldingRegisters(0x0000, 1);
        let a = Call::new(0x01, request)
            .with_priority(Priority::High)
            .with_token(1);
        let b = Call::new(0x01, request)
            .with_priority(Priority::Normal)
            .with_token(2);
        let c = Call::new(0x01, request)
            .with_priority(Priority::High)
            .with_token(3);
        client.submit(&a).unwrap();
        client.submit(&b).unwrap();
        client.submit(&c).unwrap();

        // Echo a valid single-register response to whatever is on the wire.
        for _ in 0..3 {
            client.poll().unwrap();
            assert_eq!(client.in_flight(), 1);
            let request_bytes = drain_peer(&mut peer);
            assert!(!request_bytes.is_empty());
            let mut rsp = vec![0x01, 0x03, 0x02, 0x00, 0x2A];
            let crc = codec::rtu::calc_crc(&rsp);
            rsp.extend_from_slice(&crc.to_le_bytes());
            peer.send(&rsp).unwrap();
            clock.advance(SILENCE_MS);
            client.poll().unwrap();
            clock.advance(1);
        }

        let tokens: Vec<u64> = record.borrow().iter().map(|(t, _)| *t).collect();
        assert_eq!(tokens, vec![1, 3, 2]);
    }

    #[test]
    fn crc_error_triggers_retry() {
        let clock = SharedClock::new();
        let (side_a, mut peer) = sim_pair(&clock);
        let record: Record = Rc::new(RefCell::new(Vec::new()));
        let mut client = rtu_client(side_a, &record);

        let call = Call::new(0x11, Request::ReadHoldingRegisters(0x006B, 3))
            .retries(1, 10)
            .with_token(9);
        client.submit(&call).unwrap();
        client.poll().unwrap();
        let first = drain_peer(&mut peer);
        assert_eq!(first.len(), 8);

        let mut rsp = vec![0x11, 0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64];
        let crc = codec::rtu::calc_crc(&rsp);
        rsp.extend_from_slice(&crc.to_le_bytes());

        // Corrupt the last CRC byte of the response.
        let mut corrupt = rsp.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x01;
        peer.send(&corrupt).unwrap();
        client.poll().unwrap();
        clock.advance(SILENCE_MS);
        client.poll().unwrap();
        // Failed attempt, no callback yet; retry is backing off.
        assert!(record.borrow().is_empty());
        assert_eq!(client.diag().error_count(ErrorSlot::Crc), 1);
        assert!(drain_peer(&mut peer).is_empty());

        clock.advance(10);
        client.poll().unwrap();
        // Re-sent after the backoff.
        assert_eq!(first, drain_peer(&mut peer));

        peer.send(&rsp).unwrap();
        client.poll().unwrap();
        clock.advance(SILENCE_MS);
        client.poll().unwrap();
        assert_eq!(
            record.borrow().as_slice(),
            &[(9, Ok(vec![0x022B, 0x0000, 0x0064]))]
        );
    }

    #[test]
    fn timeout_without_retries_fails_once() {
        let clock = SharedClock::new();
        let (side_a, _peer) = sim_pair(&clock);
        let record: Record = Rc::new(RefCell::new(Vec::new()));
        let mut client = rtu_client(side_a, &record);

        let call = Call::new(0x05, Request::ReadInputRegisters(0, 1))
            .timeout(50)
            .with_token(4);
        client.submit(&call).unwrap();
        client.poll().unwrap();

        clock.advance(49);
        client.poll().unwrap();
        assert!(record.borrow().is_empty());

        clock.advance(1);
        client.poll().unwrap();
        assert_eq!(record.borrow().len(), 1);
        assert_eq!(record.borrow()[0], (4, Err(Error::Timeout)));

        // No further callbacks on subsequent polls.
        clock.advance(100);
        client.poll().unwrap();
        assert_eq!(record.borrow().len(), 1);
        assert_eq!(client.diag().error_count(ErrorSlot::Timeout), 1);
    }

    #[test]
    fn cancel_delivers_exactly_once() {
        let clock = SharedClock::new();
        let (side_a, _peer) = sim_pair(&clock);
        let record: Record = Rc::new(RefCell::new(Vec::new()));
        let mut client = rtu_client(side_a, &record);

        // One in flight, one still queued behind it.
        let call = Call::new(0x01, Request::ReadCoils(0, 8)).with_token(1);
        let queued = Call::new(0x01, Request::ReadCoils(0, 8)).with_token(2);
        let h1 = client.submit(&call).unwrap();
        let h2 = client.submit(&queued).unwrap();
        client.poll().unwrap();
        assert_eq!(client.state(h1), Some(TransactionState::InFlight));
        assert_eq!(client.state(h2), Some(TransactionState::Pending));

        client.cancel(h1).unwrap();
        client.cancel(h2).unwrap();
        client.poll().unwrap();

        let outcomes = record.borrow();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, r)| *r == Err(Error::Cancelled)));
        drop(outcomes);

        // Handles are stale now.
        assert_eq!(client.cancel(h1), Err(Error::InvalidArgument));
        assert_eq!(client.state(h2), None);
    }

    #[test]
    fn transport_failure_fails_in_flight() {
        let clock = SharedClock::new();
        let (side_a, _peer) = sim_pair(&clock);
        let record: Record = Rc::new(RefCell::new(Vec::new()));
        let mut client = rtu_client(side_a, &record);

        let call = Call::new(0x01, Request::ReadCoils(0, 1)).with_token(3);
        client.submit(&call).unwrap();
        client.poll().unwrap();
        assert_eq!(client.in_flight(), 1);

        client.transport_mut().kill();
        clock.advance(1);
        assert_eq!(client.poll(), Err(Error::Transport));
        assert_eq!(record.borrow().as_slice(), &[(3, Err(Error::Transport))]);
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn queue_capacity_is_enforced() {
        let clock = SharedClock::new();
        let (side_a, _peer) = sim_pair(&clock);
        let record: Record = Rc::new(RefCell::new(Vec::new()));
        let options = ClientOptions {
            pool_capacity: 4,
            queue_capacity: 2,
            ..ClientOptions::default()
        };
        let mut client = Client::with_options(
            side_a,
            Framing::rtu(SILENCE_MS),
            recording_listener(&record),
            &options,
        );

        let call = Call::new(0x01, Request::ReadCoils(0, 1));
        client.submit(&call).unwrap();
        client.submit(&call).unwrap();
        assert_eq!(client.submit(&call), Err(Error::NoResources));
    }

    #[test]
    fn oversize_request_is_rejected_up_front() {
        let clock = SharedClock::new();
        let (side_a, _peer) = sim_pair(&clock);
        let record: Record = Rc::new(RefCell::new(Vec::new()));
        let mut client = rtu_client(side_a, &record);

        let too_many_words = [0u8; 2 * 124];
        let call = Call::new(0x01, Request::WriteMultipleRegisters(0, &too_many_words));
        assert_eq!(client.submit(&call), Err(Error::InvalidArgument));
        assert_eq!(client.queued(), 0);
        assert_eq!(client.pool.available(), client.pool.capacity());
    }

    #[test]
    fn foreign_unit_id_fails_the_transaction() {
        let clock = SharedClock::new();
        let (side_a, mut peer) = sim_pair(&clock);
        let record: Record = Rc::new(RefCell::new(Vec::new()));
        let mut client = rtu_client(side_a, &record);

        let call = Call::new(0x11, Request::ReadHoldingRegisters(0, 1)).with_token(5);
        client.submit(&call).unwrap();
        client.poll().unwrap();
        drain_peer(&mut peer);

        let mut rsp = vec![0x12, 0x03, 0x02, 0x00, 0x01];
        let crc = codec::rtu::calc_crc(&rsp);
        rsp.extend_from_slice(&crc.to_le_bytes());
        peer.send(&rsp).unwrap();
        client.poll().unwrap();
        clock.advance(SILENCE_MS);
        client.poll().unwrap();

        assert_eq!(record.borrow().as_slice(), &[(5, Err(Error::InvalidRequest))]);
    }

    #[test]
    fn exception_response_is_delivered_verbatim() {
        let clock = SharedClock::new();
        let (side_a, mut peer) = sim_pair(&clock);
        let record: Record = Rc::new(RefCell::new(Vec::new()));
        let mut client = rtu_client(side_a, &record);

        let call = Call::new(0x11, Request::ReadHoldingRegisters(0x0005, 10)).with_token(8);
        client.submit(&call).unwrap();
        client.poll().unwrap();
        drain_peer(&mut peer);

        let mut rsp = vec![0x11, 0x83, 0x02];
        let crc = codec::rtu::calc_crc(&rsp);
        rsp.extend_from_slice(&crc.to_le_bytes());
        peer.send(&rsp).unwrap();
        client.poll().unwrap();
        clock.advance(SILENCE_MS);
        client.poll().unwrap();

        assert_eq!(
            record.borrow().as_slice(),
            &[(
                8,
                Err(Error::Exception(ExceptionCode::IllegalDataAddress))
            )]
        );
        assert_eq!(client.diag().error_count(ErrorSlot::Exception), 1);
    }

    #[test]
    fn watchdog_fails_the_oldest_in_flight() {
        let clock = SharedClock::new();
        let (side_a, mut peer) = sim_pair(&clock);
        let record: Record = Rc::new(RefCell::new(Vec::new()));
        let options = ClientOptions {
            watchdog_ms: 200,
            ..ClientOptions::default()
        };
        let mut client = Client::with_options(
            side_a,
            Framing::rtu(SILENCE_MS),
            recording_listener(&record),
            &options,
        );

        let call = Call::new(0x01, Request::ReadCoils(0, 1))
            .timeout(10_000)
            .with_token(6);
        client.submit(&call).unwrap();
        client.poll().unwrap();
        drain_peer(&mut peer);

        clock.advance(199);
        client.poll().unwrap();
        assert!(record.borrow().is_empty());

        clock.advance(1);
        client.poll().unwrap();
        assert_eq!(record.borrow().as_slice(), &[(6, Err(Error::Transport))]);
        assert_eq!(client.diag().error_count(ErrorSlot::Watchdog), 1);
    }

    #[cfg(feature = "tcp")]
    mod tcp {
        use super::*;

        fn tcp_client(
            transport: SimTransport,
            record: &Record,
        ) -> Client<SimTransport, FnListener<impl FnMut(Completion<'_>)>> {
            Client::new(transport, Framing::tcp(), recording_listener(record))
        }

        #[test]
        fn responses_correlate_by_transaction_id() {
            let clock = SharedClock::new();
            let (side_a, mut peer) = sim_pair(&clock);
            let record: Record = Rc::new(RefCell::new(Vec::new()));
            let mut client = tcp_client(side_a, &record);

            let first = Call::new(0xFF, Request::WriteSingleRegister(0x10, 0xAAAA)).with_token(1);
            let second = Call::new(0xFF, Request::WriteSingleRegister(0x11, 0xBBBB)).with_token(2);
            client.submit(&first).unwrap();
            client.submit(&second).unwrap();
            client.poll().unwrap();
            assert_eq!(client.in_flight(), 2);

            let raw = drain_peer(&mut peer);
            // Two MBAP frames of 12 bytes each, tids 1 and 2.
            assert_eq!(raw.len(), 24);
            assert_eq!(&raw[0..2], &[0x00, 0x01]);
            assert_eq!(&raw[12..14], &[0x00, 0x02]);

            // Answer the second request first.
            peer.send(&[
                0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0xFF, 0x06, 0x00, 0x11, 0xBB, 0xBB,
            ])
            .unwrap();
            client.poll().unwrap();
            peer.send(&[
                0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0xFF, 0x06, 0x00, 0x10, 0xAA, 0xAA,
            ])
            .unwrap();
            client.poll().unwrap();

            let tokens: Vec<u64> = record.borrow().iter().map(|(t, _)| *t).collect();
            assert_eq!(tokens, vec![2, 1]);
        }

        #[test]
        fn unknown_transaction_id_is_dropped_and_counted() {
            let clock = SharedClock::new();
            let (side_a, mut peer) = sim_pair(&clock);
            let record: Record = Rc::new(RefCell::new(Vec::new()));
            let mut client = tcp_client(side_a, &record);

            let call = Call::new(0xFF, Request::WriteSingleRegister(0x10, 1)).with_token(1);
            client.submit(&call).unwrap();
            client.poll().unwrap();
            drain_peer(&mut peer);

            // tid 0x0077 was never issued.
            peer.send(&[
                0x00, 0x77, 0x00, 0x00, 0x00, 0x06, 0xFF, 0x06, 0x00, 0x10, 0x00, 0x01,
            ])
            .unwrap();
            client.poll().unwrap();
            assert!(record.borrow().is_empty());
            assert_eq!(
                client.diag().error_count(ErrorSlot::UnknownTransaction),
                1
            );

            // The matching response still completes the transaction.
            peer.send(&[
                0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0xFF, 0x06, 0x00, 0x10, 0x00, 0x01,
            ])
            .unwrap();
            client.poll().unwrap();
            assert_eq!(record.borrow().len(), 1);
        }
    }

    #[test]
    fn idle_hook_fires_once_when_quiescent() {
        struct IdleCounter {
            idle_count: Rc<RefCell<u32>>,
        }
        impl Listener for IdleCounter {
            fn completed(&mut self, _completion: Completion<'_>) {}
            fn idle(&mut self, _now_ms: u64) {
                *self.idle_count.borrow_mut() += 1;
            }
        }

        let clock = SharedClock::new();
        let (side_a, _peer) = sim_pair(&clock);
        let idle_count = Rc::new(RefCell::new(0));
        let options = ClientOptions {
            idle_after_ms: 100,
            ..ClientOptions::default()
        };
        let mut client = Client::with_options(
            side_a,
            Framing::rtu(SILENCE_MS),
            IdleCounter {
                idle_count: Rc::clone(&idle_count),
            },
            &options,
        );

        client.poll().unwrap();
        assert_eq!(*idle_count.borrow(), 0);
        clock.advance(100);
        client.poll().unwrap();
        assert_eq!(*idle_count.borrow(), 1);
        // Signalled once, not on every poll.
        clock.advance(100);
        client.poll().unwrap();
        assert_eq!(*idle_count.borrow(), 1);
    }
}
