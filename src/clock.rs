use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Scalar Lamport clock. Locally originated events `tick`, receives `observe`
/// the sender's stamp and advance past both views.
#[derive(Debug, Clone, Copy, Default)]
pub struct LamportClock(u32);

impl LamportClock {
    pub fn tick(&mut self) -> u32 {
        self.0 += 1;
        self.0
    }

    pub fn observe(&mut self, time: u32) {
        self.0 = self.0.max(time) + 1
    }

    pub fn time(&self) -> u32 {
        self.0
    }
}

/// A `(time, node)` pair. The derived order is the total order used for every
/// tie-break: field order gives time first, node id on equal times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub time: u32,
    pub node: NodeId,
}

impl Stamp {
    pub fn new(time: u32, node: NodeId) -> Self {
        Self { time, node }
    }
}
