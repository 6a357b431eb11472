// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed-capacity memory primitives
//!
//! All capacity is committed at construction time; steady-state operation
//! never allocates and never fragments.

mod pool;
mod ring;

pub use self::{
    pool::{Handle, Pool},
    ring::ByteRing,
};
