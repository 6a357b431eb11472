// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory link simulation shared by the end-to-end tests: two
//! transports joined by byte rings, with a manually advanced clock.

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use modbus_engine::{mem::ByteRing, Result, Transport};

const LINK_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct SharedClock(Rc<Cell<u64>>);

impl SharedClock {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(0)))
    }

    pub fn now(&self) -> u64 {
        self.0.get()
    }

    pub fn advance(&self, ms: u64) {
        self.0.set(self.0.get().wrapping_add(ms));
    }
}

/// One end of a simulated full-duplex link.
pub struct SimTransport {
    tx: Rc<RefCell<ByteRing>>,
    rx: Rc<RefCell<ByteRing>>,
    clock: SharedClock,
    on_yield: Option<Box<dyn FnMut()>>,
}

impl SimTransport {
    /// Run `hook` on every `yield_now`, e.g. to play the peer while a
    /// synchronous wrapper spins.
    pub fn set_yield_hook(&mut self, hook: impl FnMut() + 'static) {
        self.on_yield = Some(Box::new(hook));
    }

    /// Collect everything the other side has sent so far.
    pub fn drain(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 300];
        loop {
            let n = self.recv(&mut chunk).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }
}

pub fn pair(clock: &SharedClock) -> (SimTransport, SimTransport) {
    let a_to_b = Rc::new(RefCell::new(ByteRing::new(LINK_CAPACITY)));
    let b_to_a = Rc::new(RefCell::new(ByteRing::new(LINK_CAPACITY)));
    let a = SimTransport {
        tx: Rc::clone(&a_to_b),
        rx: Rc::clone(&b_to_a),
        clock: clock.clone(),
        on_yield: None,
    };
    let b = SimTransport {
        tx: b_to_a,
        rx: a_to_b,
        clock: clock.clone(),
        on_yield: None,
    };
    (a, b)
}

impl Transport for SimTransport {
    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.tx.borrow_mut().push_slice(buf))
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.rx.borrow_mut().pop_slice(buf))
    }

    fn now_ms(&self) -> u64 {
        self.clock.now()
    }

    fn yield_now(&mut self) {
        self.clock.advance(1);
        if let Some(hook) = self.on_yield.as_mut() {
            hook();
        }
    }
}
