// message-level sending abstraction shared by the protocol handlers and the
// transport, plus the one wire codec used everywhere: bincode with fixed-width
// big-endian integers, so every numeric field crosses the network in
// canonical byte order and loopback payloads need no conversion

use bincode::Options as _;
use serde::{de::DeserializeOwned, Serialize};

pub mod session;

pub trait SendMessage<A, M> {
    fn send(&mut self, dest: A, message: M) -> anyhow::Result<()>;
}

/// Broadcast address: every node in the cluster except the sender.
#[derive(Debug, Clone, Copy)]
pub struct All;

fn wire_options() -> impl bincode::Options {
    bincode::options().with_fixint_encoding().with_big_endian()
}

pub fn serialize(message: &impl Serialize) -> anyhow::Result<Vec<u8>> {
    wire_options().serialize(message).map_err(Into::into)
}

pub fn deserialize<M: DeserializeOwned>(buf: &[u8]) -> anyhow::Result<M> {
    wire_options().deserialize(buf).map_err(Into::into)
}
