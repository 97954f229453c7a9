// deterministic in-process cluster for protocol tests: per-(source,
// destination) FIFO queues, seeded random interleaving, and a shared grant
// log standing in for the blocked application. loopback sends go through a
// (node, node) queue, which models the mailbox short-circuit closely enough
// for every scenario here

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
};

use rand::{rngs::StdRng, Rng};

use crate::{
    event::{OnEvent, SendEvent},
    net::{All, SendMessage},
    Granted, NodeId,
};

#[derive(Debug)]
pub struct NetworkState<M> {
    pub queues: BTreeMap<(NodeId, NodeId), VecDeque<M>>,
    /// Every message ever sent, in send order.
    pub sent: Vec<(NodeId, NodeId, M)>,
}

impl<M> Default for NetworkState<M> {
    fn default() -> Self {
        Self {
            queues: Default::default(),
            sent: Default::default(),
        }
    }
}

pub type Network<M> = Rc<RefCell<NetworkState<M>>>;

#[derive(Debug)]
pub struct Outbox<M> {
    id: NodeId,
    num_node: u8,
    network: Network<M>,
}

impl<M: Clone> SendMessage<NodeId, M> for Outbox<M> {
    fn send(&mut self, dest: NodeId, message: M) -> anyhow::Result<()> {
        let mut network = self.network.borrow_mut();
        network.sent.push((self.id, dest, message.clone()));
        network
            .queues
            .entry((self.id, dest))
            .or_default()
            .push_back(message);
        Ok(())
    }
}

impl<M: Clone> SendMessage<All, M> for Outbox<M> {
    fn send(&mut self, All: All, message: M) -> anyhow::Result<()> {
        for dest in 1..=self.num_node {
            if dest != self.id {
                SendMessage::<NodeId, M>::send(self, dest, message.clone())?
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct GrantLog {
    id: NodeId,
    grants: Rc<RefCell<Vec<NodeId>>>,
}

impl SendEvent<Granted> for GrantLog {
    fn send(&mut self, Granted: Granted) -> anyhow::Result<()> {
        self.grants.borrow_mut().push(self.id);
        Ok(())
    }
}

pub struct Cluster<P, M> {
    pub nodes: Vec<P>,
    pub network: Network<M>,
    pub grants: Rc<RefCell<Vec<NodeId>>>,
}

impl<P, M> Cluster<P, M> {
    pub fn new(num_node: u8, make: impl Fn(NodeId, Outbox<M>, GrantLog) -> P) -> Self {
        let network = Network::default();
        let grants = Rc::new(RefCell::new(Vec::new()));
        let nodes = (1..=num_node)
            .map(|id| {
                make(
                    id,
                    Outbox {
                        id,
                        num_node,
                        network: network.clone(),
                    },
                    GrantLog {
                        id,
                        grants: grants.clone(),
                    },
                )
            })
            .collect();
        Self {
            nodes,
            network,
            grants,
        }
    }

    pub fn node(&self, id: NodeId) -> &P {
        &self.nodes[id as usize - 1]
    }

    pub fn take_grants(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut *self.grants.borrow_mut())
    }

    pub fn in_flight(&self) -> usize {
        self.network.borrow().queues.values().map(VecDeque::len).sum()
    }

    pub fn sent(&self) -> Vec<(NodeId, NodeId, M)>
    where
        M: Clone,
    {
        self.network.borrow().sent.clone()
    }
}

impl<P: OnEvent<M>, M> Cluster<P, M> {
    /// Inject a local event, as the local API would through the mailbox.
    pub fn local(&mut self, node: NodeId, event: M) -> anyhow::Result<()> {
        self.nodes[node as usize - 1].on_event(event)
    }

    /// Deliver the oldest undelivered message from `from` to `to`, if any.
    pub fn step_pair(&mut self, from: NodeId, to: NodeId) -> anyhow::Result<bool> {
        let message = self
            .network
            .borrow_mut()
            .queues
            .get_mut(&(from, to))
            .and_then(VecDeque::pop_front);
        let Some(message) = message else {
            return Ok(false);
        };
        self.nodes[to as usize - 1].on_event(message)?;
        Ok(true)
    }

    /// Deliver one message over a randomly chosen non-empty pair.
    pub fn step(&mut self, rng: &mut StdRng) -> anyhow::Result<bool> {
        let pairs = self
            .network
            .borrow()
            .queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(&pair, _)| pair)
            .collect::<Vec<_>>();
        if pairs.is_empty() {
            return Ok(false);
        }
        let (from, to) = pairs[rng.gen_range(0..pairs.len())];
        self.step_pair(from, to)
    }

    pub fn run(&mut self, rng: &mut StdRng) -> anyhow::Result<()> {
        while self.step(rng)? {}
        Ok(())
    }
}

/// Random workload: every node acquires and releases `rounds` times under a
/// seeded interleaving. Asserts mutual exclusion throughout (a grant while
/// another node is inside the critical section panics) and that every acquire
/// is eventually granted. `check` runs after every delivery for
/// protocol-specific invariants.
pub fn drive<P: OnEvent<M>, M>(
    cluster: &mut Cluster<P, M>,
    rng: &mut StdRng,
    rounds: usize,
    request: impl Fn() -> M,
    release: impl Fn() -> M,
    check: impl Fn(&Cluster<P, M>),
) -> anyhow::Result<()> {
    let num_node = cluster.nodes.len() as NodeId;
    let mut remaining = vec![rounds; cluster.nodes.len()];
    let mut requested = vec![false; cluster.nodes.len()];
    let mut holder: Option<(NodeId, usize)> = None;
    for step in 0.. {
        assert!(step < 200_000, "no progress after {step} deliveries");
        for node in 1..=num_node {
            let slot = node as usize - 1;
            // a node never re-requests while waiting or inside the section
            let idle = !requested[slot] && holder.map(|(holder, _)| holder) != Some(node);
            if remaining[slot] > 0 && idle && rng.gen_bool(0.3) {
                requested[slot] = true;
                cluster.local(node, request())?
            }
        }
        for node in cluster.take_grants() {
            assert!(
                holder.is_none(),
                "node {node} granted while node {} is inside the critical section",
                holder.unwrap().0
            );
            let slot = node as usize - 1;
            assert!(requested[slot], "node {node} granted without a request");
            requested[slot] = false;
            remaining[slot] -= 1;
            holder = Some((node, 3))
        }
        if let Some((node, hold)) = &mut holder {
            if *hold == 0 {
                let node = *node;
                holder = None;
                cluster.local(node, release())?
            } else {
                *hold -= 1
            }
        }
        let stepped = cluster.step(rng)?;
        check(cluster);
        if !stepped
            && holder.is_none()
            && cluster.grants.borrow().is_empty()
            && remaining.iter().all(|&rounds| rounds == 0)
            && requested.iter().all(|&requested| !requested)
        {
            break;
        }
    }
    Ok(())
}
