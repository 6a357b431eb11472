// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport capability
//!
//! The engines never touch OS services directly. Byte I/O, the monotonic
//! clock and cooperative yielding are injected through this trait, so the
//! same engine code runs against sockets, serial ports, ISR-fed ring
//! buffers or an in-memory simulation.

use crate::error::Result;

/// Abstract byte transport with a monotonic clock.
///
/// Contract:
///
/// - Neither [`send`](Self::send) nor [`recv`](Self::recv) may block
///   indefinitely; partial I/O is normal and the engines always loop.
/// - The capability is non-reentrant; the host ensures exclusive access
///   by one engine instance.
pub trait Transport {
    /// Hand bytes to the link, accepting `0..=buf.len()` of them.
    ///
    /// Returns the number of bytes accepted. A hard link failure is
    /// reported as [`Error::Transport`](crate::Error::Transport).
    fn send(&mut self, buf: &[u8]) -> Result<usize>;

    /// Fetch available bytes from the link into `buf`.
    ///
    /// Returns the number of bytes produced; `Ok(0)` means no data is
    /// available right now.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Monotonic clock in milliseconds.
    ///
    /// Timeout arithmetic uses wrapping differences, so the absolute
    /// value carries no meaning.
    fn now_ms(&self) -> u64;

    /// Cooperative hint invoked by the synchronous convenience API
    /// between polls. On an OS this may sleep briefly; on bare-metal it
    /// may be a no-op or a WFI.
    fn yield_now(&mut self) {}
}
