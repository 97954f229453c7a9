// Ricart and Agrawala's broadcast mutual exclusion
// ("An Optimal Algorithm for Mutual Exclusion in Computer Networks", 1981)
// every request is broadcast and totally ordered by (timestamp, node id). a
// node answers a REQUEST immediately unless its own pending request precedes
// it, in which case the answer waits until the local release. the local
// request is granted once all N-1 REPLYs are in; its timestamp is then zeroed
// so it stays at the queue head and keeps blocking answers for the whole
// critical section

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    clock::{LamportClock, Stamp},
    event::{OnEvent, SendEvent},
    net::{All, SendMessage},
    Granted, NodeId,
};

/// Protocol events. The local variants ride the same tagged union as the wire
/// messages: the handler sees one uniform stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Stamp),
    Reply(Stamp),
    LocalRequest,
    LocalRelease,
}

pub trait Net: SendMessage<NodeId, Message> + SendMessage<All, Message> {}
impl<T: SendMessage<NodeId, Message> + SendMessage<All, Message>> Net for T {}

#[derive(Debug)]
pub struct Processor<N, U> {
    id: NodeId,
    num_node: u8,
    clock: LamportClock,
    /// Pending requests sorted by `(time, node)`. While a local request is
    /// pending it is always the head after `drain`, so everything behind it
    /// stays unanswered.
    requests: Vec<Stamp>,
    /// REPLYs still awaited for the local entry; `Some(0)` once granted,
    /// `None` while not requesting.
    outstanding: Option<u32>,

    net: N,
    upcall: U,
}

impl<N, U> Processor<N, U> {
    pub fn new(id: NodeId, num_node: u8, net: N, upcall: U) -> Self {
        Self {
            id,
            num_node,
            clock: Default::default(),
            requests: Default::default(),
            outstanding: None,
            net,
            upcall,
        }
    }
}

impl<N: Net, U: SendEvent<Granted>> OnEvent<Message> for Processor<N, U> {
    fn on_event(&mut self, message: Message) -> anyhow::Result<()> {
        match message {
            Message::LocalRequest => self.on_local_request(),
            Message::LocalRelease => self.on_local_release(),
            Message::Request(stamp) => self.on_request(stamp),
            Message::Reply(stamp) => self.on_reply(stamp),
        }
    }
}

impl<N: Net, U: SendEvent<Granted>> Processor<N, U> {
    fn on_local_request(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.outstanding.is_none(),
            "ricart: local request while one is already pending"
        );
        let stamp = Stamp::new(self.clock.tick(), self.id);
        self.insert(stamp);
        self.outstanding = Some(u32::from(self.num_node) - 1);
        debug!("ricart: node {} requests at {}", self.id, stamp.time);
        self.net.send(All, Message::Request(stamp))?;
        if self.outstanding == Some(0) {
            // single-node cluster, nobody to wait for
            self.grant()?
        }
        self.drain()
    }

    fn on_request(&mut self, stamp: Stamp) -> anyhow::Result<()> {
        self.clock.observe(stamp.time);
        self.insert(stamp);
        self.drain()
    }

    fn on_reply(&mut self, stamp: Stamp) -> anyhow::Result<()> {
        self.clock.observe(stamp.time);
        let Some(outstanding) = &mut self.outstanding else {
            anyhow::bail!(
                "ricart: REPLY from node {} without a pending request",
                stamp.node
            )
        };
        anyhow::ensure!(
            *outstanding > 0,
            "ricart: REPLY from node {} after the grant",
            stamp.node
        );
        *outstanding -= 1;
        if *outstanding == 0 {
            self.grant()?
        }
        self.drain()
    }

    fn on_local_release(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.outstanding.take() == Some(0),
            "ricart: local release without a granted request"
        );
        let front = self.requests.remove(0);
        anyhow::ensure!(
            front.node == self.id && front.time == 0,
            "ricart: local release while node {} holds the queue head",
            front.node
        );
        debug!("ricart: node {} releases, answering again", self.id);
        self.drain()
    }

    fn grant(&mut self) -> anyhow::Result<()> {
        let front = self
            .requests
            .first_mut()
            .filter(|stamp| stamp.node == self.id)
            .ok_or(anyhow::anyhow!(
                "ricart: all REPLYs in while the local request is not the queue head"
            ))?;
        // zero the timestamp: nothing can precede the entry now, so no REPLY
        // leaves this node until the local release
        front.time = 0;
        self.upcall.send(Granted)
    }

    /// Answer every request ahead of the local one. Stops at the local entry
    /// or an empty queue.
    fn drain(&mut self) -> anyhow::Result<()> {
        while let Some(stamp) = self.requests.first().copied() {
            if stamp.node == self.id {
                break;
            }
            self.requests.remove(0);
            let reply = Stamp::new(self.clock.tick(), self.id);
            self.net.send(stamp.node, Message::Reply(reply))?
        }
        Ok(())
    }

    fn insert(&mut self, stamp: Stamp) {
        if let Err(index) = self.requests.binary_search(&stamp) {
            self.requests.insert(index, stamp)
        }
    }
}
