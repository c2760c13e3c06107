// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod channel;
mod line;
mod process;
mod router;
mod sse;
mod transport;
mod ws;

pub use channel::{ChannelPeer, ChannelTransport};
pub use line::LineTransport;
pub use process::ProcessAdapter;
pub use router::Router;
pub use sse::SseTransport;
pub use transport::{Transport, TransportError, TransportMessage, MAX_MESSAGE_BYTES};
pub use ws::WsTransport;
