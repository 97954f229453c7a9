// Maekawa's quorum mutual exclusion ("A sqrt(N) Algorithm for Mutual
// Exclusion in Decentralized Systems", 1985)
// a node enters the critical section once every member of its voting set has
// LOCKed its request. each voter's vote is the head of its request queue; a
// younger request is FAILed, an older one makes the voter INQUIRY the current
// vote holder, who RELINQUISHes the vote if its own round has already seen a
// FAIL. the INQUIRY/RELINQUISH exchange is what breaks the deadlock cycle of
// two overlapping requests each holding part of the other's quorum

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    clock::{LamportClock, Stamp},
    event::{OnEvent, SendEvent},
    net::SendMessage,
    Granted, NodeId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Stamp),
    Lock(Stamp),
    Fail(Stamp),
    Inquiry(Stamp),
    Relinquish(Stamp),
    Release(Stamp),
    LocalRequest,
    LocalRelease,
}

pub trait Net: SendMessage<NodeId, Message> {}
impl<T: SendMessage<NodeId, Message>> Net for T {}

#[derive(Debug)]
pub struct Processor<N, U> {
    id: NodeId,
    /// This node's voting set, self included.
    members: Vec<NodeId>,
    clock: LamportClock,
    /// Requests this node has been asked to vote on. The head holds the
    /// vote; the tail is kept sorted by `(time, node)` and an insert never
    /// displaces the head.
    queue: Vec<Stamp>,
    /// LOCKs gathered for the local request.
    lock_count: i32,
    /// A FAIL has been seen since the local round started.
    fail: bool,
    /// An INQUIRY for the current vote holder is outstanding.
    inquiry_sent: bool,
    /// Peers owed a RELINQUISH once the local round fails.
    inquiries: Vec<NodeId>,

    net: N,
    upcall: U,
}

impl<N, U> Processor<N, U> {
    pub fn new(id: NodeId, members: Vec<NodeId>, net: N, upcall: U) -> Self {
        Self {
            id,
            members,
            clock: Default::default(),
            queue: Default::default(),
            lock_count: 0,
            fail: false,
            inquiry_sent: false,
            inquiries: Default::default(),
            net,
            upcall,
        }
    }

    fn quorum(&self) -> i32 {
        self.members.len() as _
    }
}

impl<N: Net, U: SendEvent<Granted>> OnEvent<Message> for Processor<N, U> {
    fn on_event(&mut self, message: Message) -> anyhow::Result<()> {
        match message {
            Message::LocalRequest => self.on_local_request(),
            Message::LocalRelease => self.on_local_release(),
            Message::Request(stamp) => self.on_request(stamp),
            Message::Lock(stamp) => self.on_lock(stamp),
            Message::Fail(stamp) => self.on_fail(stamp),
            Message::Inquiry(stamp) => self.on_inquiry(stamp),
            Message::Relinquish(stamp) => self.on_relinquish(stamp),
            Message::Release(stamp) => self.on_release(stamp),
        }
    }
}

impl<N: Net, U: SendEvent<Granted>> Processor<N, U> {
    fn on_local_request(&mut self) -> anyhow::Result<()> {
        let stamp = Stamp::new(self.clock.tick(), self.id);
        debug!("maekawa: node {} requests at {}", self.id, stamp.time);
        for &peer in &self.members {
            self.net.send(peer, Message::Request(stamp))?
        }
        Ok(())
    }

    fn on_local_release(&mut self) -> anyhow::Result<()> {
        let stamp = Stamp::new(self.clock.tick(), self.id);
        debug!("maekawa: node {} releases", self.id);
        for &peer in &self.members {
            self.net.send(peer, Message::Release(stamp))?
        }
        Ok(())
    }

    fn on_request(&mut self, stamp: Stamp) -> anyhow::Result<()> {
        self.clock.observe(stamp.time);
        if self.queue.is_empty() {
            self.queue.push(stamp);
            debug!("maekawa: node {} votes for node {}", self.id, stamp.node);
            return self.send_to(stamp.node, Message::Lock);
        }
        let front = self.queue[0];
        if stamp < front {
            if !self.inquiry_sent {
                debug!(
                    "maekawa: node {} asks node {} to reconsider for node {}",
                    self.id, front.node, stamp.node
                );
                self.send_to(front.node, Message::Inquiry)?;
                self.inquiry_sent = true
            }
        } else if stamp.node != self.id {
            debug!("maekawa: node {} fails node {}", self.id, stamp.node);
            self.send_to(stamp.node, Message::Fail)?
        }
        self.insert_tail(stamp);
        Ok(())
    }

    fn on_lock(&mut self, stamp: Stamp) -> anyhow::Result<()> {
        self.clock.observe(stamp.time);
        self.lock_count += 1;
        if self.lock_count == self.quorum() {
            self.fail = false;
            self.inquiries.clear();
            debug!(
                "maekawa: node {} gathered all {} votes",
                self.id,
                self.members.len()
            );
            self.upcall.send(Granted)?
        }
        Ok(())
    }

    fn on_fail(&mut self, stamp: Stamp) -> anyhow::Result<()> {
        self.clock.observe(stamp.time);
        self.fail = true;
        self.relinquish_promised()
    }

    fn on_inquiry(&mut self, stamp: Stamp) -> anyhow::Result<()> {
        self.clock.observe(stamp.time);
        if self.queue.is_empty() || self.lock_count == self.quorum() {
            // no vote to give back, or already inside the critical section
            return Ok(());
        }
        self.inquiries.push(stamp.node);
        if self.fail {
            self.relinquish_promised()?
        }
        Ok(())
    }

    fn on_relinquish(&mut self, stamp: Stamp) -> anyhow::Result<()> {
        self.clock.observe(stamp.time);
        anyhow::ensure!(
            !self.queue.is_empty(),
            "maekawa: RELINQUISH from node {} with an empty vote queue",
            stamp.node
        );
        let front = self.queue.remove(0);
        if front.node == self.id && stamp.node != self.id {
            self.lock_count -= 1
        }
        anyhow::ensure!(
            !self.queue.is_empty(),
            "maekawa: RELINQUISH from node {} with no waiting request",
            stamp.node
        );
        self.insert_tail(front);
        let next = self.queue[0];
        debug!("maekawa: node {} revotes for node {}", self.id, next.node);
        self.send_to(next.node, Message::Lock)
    }

    fn on_release(&mut self, stamp: Stamp) -> anyhow::Result<()> {
        self.clock.observe(stamp.time);
        self.inquiry_sent = false;
        anyhow::ensure!(
            !self.queue.is_empty(),
            "maekawa: RELEASE from node {} with an empty vote queue",
            stamp.node
        );
        // the head is normally the releaser's own request; popping whatever
        // sits there tolerates an INQUIRY crossing the RELEASE in flight
        let front = self.queue.remove(0);
        if front.node == self.id {
            self.lock_count = 0
        }
        if let Some(next) = self.queue.first().copied() {
            debug!("maekawa: node {} votes for node {}", self.id, next.node);
            self.send_to(next.node, Message::Lock)?
        }
        Ok(())
    }

    fn relinquish_promised(&mut self) -> anyhow::Result<()> {
        for peer in std::mem::take(&mut self.inquiries) {
            debug!("maekawa: node {} returns the vote of node {}", self.id, peer);
            self.send_to(peer, Message::Relinquish)?;
            self.lock_count -= 1
        }
        Ok(())
    }

    fn send_to(&mut self, peer: NodeId, message: fn(Stamp) -> Message) -> anyhow::Result<()> {
        let stamp = Stamp::new(self.clock.time(), self.id);
        self.net.send(peer, message(stamp))
    }

    fn insert_tail(&mut self, stamp: Stamp) {
        let index = match self.queue[1..].binary_search(&stamp) {
            Ok(index) | Err(index) => index + 1,
        };
        self.queue.insert(index, stamp)
    }
}
