// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-instance diagnostic counters and event tracing
//!
//! Each engine instance owns its own [`Diag`]; there is no process-wide
//! state. The host reads counters through accessors or takes an owned
//! [`DiagSnapshot`] — mutable references are never handed out. Counters
//! are monotonic within a reset epoch.

use crate::error::Error;

/// Number of error counter slots.
pub const ERROR_SLOTS: usize = 11;

/// Counter slot an [`Error`] (or engine-internal event) is tallied under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ErrorSlot {
    InvalidArgument = 0,
    InvalidRequest = 1,
    Crc = 2,
    Timeout = 3,
    Transport = 4,
    Cancelled = 5,
    NoResources = 6,
    Exception = 7,
    Other = 8,
    /// A response arrived that matched no in-flight transaction.
    UnknownTransaction = 9,
    /// The watchdog force-closed a wedged link.
    Watchdog = 10,
}

impl From<&Error> for ErrorSlot {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidArgument => Self::InvalidArgument,
            Error::InvalidRequest => Self::InvalidRequest,
            Error::Crc => Self::Crc,
            Error::Timeout => Self::Timeout,
            Error::Transport => Self::Transport,
            Error::Cancelled => Self::Cancelled,
            Error::NoResources => Self::NoResources,
            Error::Exception(_) => Self::Exception,
            Error::Other => Self::Other,
        }
    }
}

/// Which engine recorded a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSource {
    Client,
    Server,
}

/// Lifecycle point of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    TxSubmit,
    TxSent,
    RxComplete,
    TxTimeout,
    StateChange,
}

/// One entry of the circular event trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    pub ts_ms: u64,
    pub source: TraceSource,
    pub kind: TraceKind,
    pub function: u8,
    /// `None` for success, otherwise the error slot involved.
    pub status: Option<ErrorSlot>,
}

/// Owned copy of the diagnostic state at one point in time.
#[derive(Debug, Clone)]
pub struct DiagSnapshot {
    /// Per-function-code counters, indexed by the raw function code.
    pub functions: [u64; 256],
    /// Per-error-slot counters, indexed by [`ErrorSlot`].
    pub errors: [u64; ERROR_SLOTS],
    /// Trace events, oldest first.
    pub trace: Vec<TraceEvent>,
}

/// Diagnostic state of one engine instance.
#[derive(Debug)]
pub struct Diag {
    source: TraceSource,
    functions: [u64; 256],
    errors: [u64; ERROR_SLOTS],
    trace: Vec<TraceEvent>,
    trace_head: usize,
    trace_len: usize,
    trace_depth: usize,
}

impl Diag {
    pub(crate) fn new(source: TraceSource, trace_depth: usize) -> Self {
        Self {
            source,
            functions: [0; 256],
            errors: [0; ERROR_SLOTS],
            trace: Vec::with_capacity(trace_depth),
            trace_head: 0,
            trace_len: 0,
            trace_depth,
        }
    }

    pub(crate) fn count_function(&mut self, function: u8) {
        self.functions[usize::from(function)] += 1;
    }

    pub(crate) fn count_error(&mut self, slot: ErrorSlot) {
        self.errors[slot as usize] += 1;
    }

    pub(crate) fn record(&mut self, ts_ms: u64, kind: TraceKind, function: u8, status: Option<ErrorSlot>) {
        if self.trace_depth == 0 {
            return;
        }
        let event = TraceEvent {
            ts_ms,
            source: self.source,
            kind,
            function,
            status,
        };
        if self.trace_len < self.trace_depth {
            self.trace.push(event);
            self.trace_len += 1;
        } else {
            // Full: overwrite the oldest entry.
            self.trace[self.trace_head] = event;
            self.trace_head = (self.trace_head + 1) % self.trace_depth;
        }
    }

    /// Counter for one function code.
    #[must_use]
    pub fn function_count(&self, function: u8) -> u64 {
        self.functions[usize::from(function)]
    }

    /// Counter for one error slot.
    #[must_use]
    pub fn error_count(&self, slot: ErrorSlot) -> u64 {
        self.errors[slot as usize]
    }

    /// Copy the current state. The trace comes out oldest-first.
    #[must_use]
    pub fn snapshot(&self) -> DiagSnapshot {
        let mut trace = Vec::with_capacity(self.trace_len);
        for i in 0..self.trace_len {
            trace.push(self.trace[(self.trace_head + i) % self.trace_len.max(1)]);
        }
        DiagSnapshot {
            functions: self.functions,
            errors: self.errors,
            trace,
        }
    }

    /// Zero all counters and drop the trace, starting a new epoch.
    pub fn reset(&mut self) {
        self.functions = [0; 256];
        self.errors = [0; ERROR_SLOTS];
        self.trace.clear();
        self.trace_head = 0;
        self.trace_len = 0;
    }
}
