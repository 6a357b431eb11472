// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory link simulation for engine tests: a pair of transports
//! connected by byte rings, sharing a manually advanced clock.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{
    error::{Error, Result},
    mem::ByteRing,
    transport::Transport,
};

const LINK_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub(crate) struct SharedClock(Rc<Cell<u64>>);

impl SharedClock {
    pub(crate) fn new() -> Self {
        Self(Rc::new(Cell::new(0)))
    }

    pub(crate) fn now(&self) -> u64 {
        self.0.get()
    }

    pub(crate) fn advance(&self, ms: u64) {
        self.0.set(self.0.get().wrapping_add(ms));
    }
}

/// One end of a simulated full-duplex link.
pub(crate) struct SimTransport {
    tx: Rc<RefCell<ByteRing>>,
    rx: Rc<RefCell<ByteRing>>,
    clock: SharedClock,
    dead: Rc<Cell<bool>>,
    /// How far `yield_now` advances the shared clock, so synchronous
    /// wrappers make progress against silence intervals and timeouts.
    pub(crate) yield_advance_ms: u64,
    on_yield: Option<Box<dyn FnMut()>>,
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimTransport")
            .field("now_ms", &self.clock.now())
            .field("dead", &self.dead.get())
            .finish_non_exhaustive()
    }
}

impl SimTransport {
    /// Simulate a hard link failure on both directions of this end.
    pub(crate) fn kill(&self) {
        self.dead.set(true);
    }

    /// Run `hook` on every `yield_now`, e.g. to play the peer while a
    /// synchronous wrapper spins.
    pub(crate) fn set_yield_hook(&mut self, hook: impl FnMut() + 'static) {
        self.on_yield = Some(Box::new(hook));
    }
}

pub(crate) fn sim_pair(clock: &SharedClock) -> (SimTransport, SimTransport) {
    let a_to_b = Rc::new(RefCell::new(ByteRing::new(LINK_CAPACITY)));
    let b_to_a = Rc::new(RefCell::new(ByteRing::new(LINK_CAPACITY)));
    let a = SimTransport {
        tx: Rc::clone(&a_to_b),
        rx: Rc::clone(&b_to_a),
        clock: clock.clone(),
        dead: Rc::new(Cell::new(false)),
        yield_advance_ms: 1,
        on_yield: None,
    };
    let b = SimTransport {
        tx: b_to_a,
        rx: a_to_b,
        clock: clock.clone(),
        dead: Rc::new(Cell::new(false)),
        yield_advance_ms: 1,
        on_yield: None,
    };
    (a, b)
}

impl Transport for SimTransport {
    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        if self.dead.get() {
            return Err(Error::Transport);
        }
        Ok(self.tx.borrow_mut().push_slice(buf))
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.dead.get() {
            return Err(Error::Transport);
        }
        Ok(self.rx.borrow_mut().pop_slice(buf))
    }

    fn now_ms(&self) -> u64 {
        self.clock.now()
    }

    fn yield_now(&mut self) {
        self.clock.advance(self.yield_advance_ms);
        if let Some(hook) = self.on_yield.as_mut() {
            hook();
        }
    }
}
