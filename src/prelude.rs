// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types

///////////////////////////////////////////////////////////////////
/// Modules
///////////////////////////////////////////////////////////////////
#[cfg(feature = "client")]
pub use crate::client;

#[cfg(feature = "server")]
pub use crate::server;

pub use crate::{codec, diag, mem};

///////////////////////////////////////////////////////////////////
/// Structs
///////////////////////////////////////////////////////////////////
#[cfg(any(feature = "rtu", feature = "ascii", feature = "tcp"))]
pub use crate::codec::Framing;
pub use crate::error::{Error, Result};
pub use crate::frame::{AduView, ExceptionCode, Request, Response};
pub use crate::unit::{Unit, UnitId};

#[cfg(feature = "client")]
pub use crate::client::{Call, Client, ClientOptions, Completion, FnListener, Ignore, Priority};

#[cfg(feature = "sync")]
pub use crate::client::sync::SyncOptions;

#[cfg(feature = "server")]
pub use crate::server::{Region, RegionKind, Server, ServerOptions};

///////////////////////////////////////////////////////////////////
/// Traits
///////////////////////////////////////////////////////////////////
pub use crate::transport::Transport;

#[cfg(feature = "client")]
pub use crate::client::Listener;

#[cfg(feature = "server")]
pub use crate::server::RegionHandler;
