// a toolkit of interchangeable distributed mutual exclusion protocols: every
// node in a fixed cluster gets a blocking acquire/release pair, and at any
// instant at most one node is inside the critical section
// the three protocols live in `ricart`, `maekawa` and `fuchi`; the common
// per-node fabric (multi-class mailbox, handler loop, local API) lives in
// `mailbox` and `engine`, and `net` carries the wire codec and TCP mesh

pub mod buffer;
pub mod clock;
pub mod engine;
pub mod event;
pub mod fuchi;
pub mod maekawa;
pub mod mailbox;
pub mod net;
pub mod quorum;
pub mod ricart;

#[cfg(test)]
mod testing;

/// Fixed node identity in `1..=N`. `0` is reserved for the broadcast
/// destination on the wire side.
pub type NodeId = u8;

/// Delivered to the blocked application when the cluster-wide mutex is won.
#[derive(Debug, Clone, Copy)]
pub struct Granted;
