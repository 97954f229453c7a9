// Fuchi's improved sqrt(N) token algorithm ("An Improved sqrt(N) Algorithm
// for Mutual Exclusion in Decentralized Systems", 1992)
// a single token carries the right to enter the critical section. requests
// flood a voting set; holders pass the token to the oldest request they know
// of, finishers with nobody waiting keep it and announce a FINISH so that
// set members can chase the token on behalf of requests they know about.
// every message carries the sender's request/finish time vectors, merged on
// receipt, and a request whose finish is already recorded is masked out. the
// oldest-stamp watermark rides along with requests so that a peer holding
// knowledge of an even older request can bounce the message back with a
// refreshed view instead of letting the old request starve

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    event::{OnEvent, SendEvent},
    net::SendMessage,
    Granted, NodeId,
};

/// Per-node times, indexed by node id minus one; `None` is "no value".
pub type Times = Vec<Option<u32>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub time: u32,
    pub sender: NodeId,
    pub request_times: Times,
    pub finish_times: Times,
    pub oldest: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finish {
    pub time: u32,
    pub sender: NodeId,
    pub finish_times: Times,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub time: u32,
    pub request_times: Times,
    pub finish_times: Times,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Token(Token),
    Finish(Finish),
    LocalRequest,
    LocalFinish,
}

/// Startup event: the boot-token holder announces itself to its voting set.
#[derive(Debug, Clone, Copy)]
pub struct Init;

pub trait Net: SendMessage<NodeId, Message> {}
impl<T: SendMessage<NodeId, Message>> Net for T {}

#[derive(Debug)]
pub struct Processor<N, U> {
    id: NodeId,
    /// This node's voting set, self included.
    members: Vec<NodeId>,
    time: u32,
    /// `R`: known outstanding request times, one slot per node.
    request_times: Times,
    /// `F`: known finish times, one slot per node.
    finish_times: Times,
    /// Last peer known to have finished while nothing was pending here;
    /// arriving requests are forwarded toward it.
    wait: Option<(NodeId, u32)>,
    /// Anti-starvation watermark: the request time of the node the token was
    /// last passed to.
    oldest: Option<u32>,
    /// The token is present and free to hand out. Cleared for the whole
    /// critical section so the token cannot leave mid-section.
    have_token: bool,
    token: Option<Token>,

    net: N,
    upcall: U,
}

impl<N, U> Processor<N, U> {
    pub fn new(id: NodeId, num_node: u8, members: Vec<NodeId>, net: N, upcall: U) -> Self {
        // node 1 boots with the token
        let token = (id == 1).then(|| Token {
            time: 0,
            request_times: vec![None; num_node as usize],
            finish_times: vec![None; num_node as usize],
        });
        Self {
            id,
            members,
            time: 0,
            request_times: vec![None; num_node as usize],
            finish_times: vec![None; num_node as usize],
            wait: None,
            oldest: None,
            have_token: token.is_some(),
            token,
            net,
            upcall,
        }
    }

    fn slot(node: NodeId) -> usize {
        node as usize - 1
    }

    /// The node with the earliest outstanding request, ties to the lower id.
    fn search_oldest_request(&self) -> Option<NodeId> {
        let mut oldest = None;
        for (index, request) in self.request_times.iter().enumerate() {
            if let Some(time) = *request {
                if oldest.map_or(true, |(earliest, _)| time < earliest) {
                    oldest = Some((time, index as NodeId + 1))
                }
            }
        }
        oldest.map(|(_, node)| node)
    }

    /// Merge a message's view: timestamp, finish times, then request times,
    /// masking out every request a recorded finish already supersedes. The
    /// trailing mask keeps `R[i] > F[i]` as a state invariant, so a stale
    /// request time riding in on a message can never resurrect.
    fn absorb(&mut self, time: u32, request_times: Option<&Times>, finish_times: &Times) {
        self.time = self.time.max(time);
        for (own, seen) in self.finish_times.iter_mut().zip(finish_times) {
            *own = max_time(*own, *seen)
        }
        self.mask();
        if let Some(request_times) = request_times {
            for (own, seen) in self.request_times.iter_mut().zip(request_times) {
                *own = max_time(*own, *seen)
            }
            self.mask()
        }
    }

    fn mask(&mut self) {
        for (request, finish) in self.request_times.iter_mut().zip(&self.finish_times) {
            if let (Some(requested), Some(finished)) = (*request, *finish) {
                if requested <= finished {
                    *request = None
                }
            }
        }
    }
}

fn max_time(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

impl<N: Net, U: SendEvent<Granted>> OnEvent<Init> for Processor<N, U> {
    fn on_event(&mut self, Init: Init) -> anyhow::Result<()> {
        if !self.have_token {
            return Ok(());
        }
        self.time += 1;
        debug!("fuchi: node {} announces the boot token", self.id);
        self.send_finish()
    }
}

impl<N: Net, U: SendEvent<Granted>> OnEvent<Message> for Processor<N, U> {
    fn on_event(&mut self, message: Message) -> anyhow::Result<()> {
        match message {
            Message::LocalRequest => self.on_local_request(),
            Message::LocalFinish => self.on_local_finish(),
            Message::Request(request) => self.on_request(request),
            Message::Token(token) => self.on_token(token),
            Message::Finish(finish) => self.on_finish(finish),
        }
    }
}

impl<N: Net, U: SendEvent<Granted>> Processor<N, U> {
    fn on_local_request(&mut self) -> anyhow::Result<()> {
        if self.have_token {
            // pin the resident token for the critical section
            self.have_token = false;
            debug!("fuchi: node {} enters with the resident token", self.id);
            return self.upcall.send(Granted);
        }
        self.time += 1;
        self.request_times[Self::slot(self.id)] = Some(self.time);
        debug!("fuchi: node {} requests at {}", self.id, self.time);
        let request = Request {
            time: self.time,
            sender: self.id,
            request_times: self.request_times.clone(),
            finish_times: self.finish_times.clone(),
            oldest: self.oldest,
        };
        for &peer in &self.members {
            self.net.send(peer, Message::Request(request.clone()))?
        }
        Ok(())
    }

    fn on_local_finish(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.token.is_some(),
            "fuchi: node {} finished without the token",
            self.id
        );
        self.request_times[Self::slot(self.id)] = None;
        self.finish_times[Self::slot(self.id)] = Some(self.time);
        self.time += 1;
        if let Some(next) = self.search_oldest_request() {
            debug!("fuchi: node {} finishes, the token moves on", self.id);
            self.pass_token(next)
        } else {
            if let Some(token) = &mut self.token {
                token.time = self.time;
                token.request_times = self.request_times.clone();
                token.finish_times = self.finish_times.clone()
            }
            self.have_token = true;
            self.wait = None;
            self.oldest = None;
            debug!("fuchi: node {} finishes, the token stays", self.id);
            self.send_finish()
        }
    }

    fn on_request(&mut self, request: Request) -> anyhow::Result<()> {
        self.absorb(
            request.time,
            Some(&request.request_times),
            &request.finish_times,
        );
        // a live wait means the token was last seen resting at wait_node:
        // route the request there. a holder never has a live wait, so this
        // cannot swallow a request the token could answer directly
        if let Some((wait_node, wait_time)) = self.wait {
            let live = match self.finish_times[Self::slot(wait_node)] {
                Some(finished) => wait_time > finished,
                None => true,
            };
            if live && self.search_oldest_request().is_some() {
                self.wait = None;
                self.time += 1;
                debug!(
                    "fuchi: node {} forwards the request of node {} to node {}",
                    self.id, request.sender, wait_node
                );
                let forward = Request {
                    time: self.time,
                    sender: request.sender,
                    request_times: self.request_times.clone(),
                    finish_times: self.finish_times.clone(),
                    oldest: request.oldest,
                };
                return self.net.send(wait_node, Message::Request(forward));
            }
        }
        // the sender's watermark names a request older than one still live
        // here: send the refreshed view straight back, at most once
        if !self.have_token && request.sender != self.id {
            if let Some(oldest) = request.oldest {
                if self.request_times.iter().flatten().any(|&time| oldest < time) {
                    self.time += 1;
                    debug!(
                        "fuchi: node {} bounces the request back to node {}",
                        self.id, request.sender
                    );
                    let bounce = Request {
                        time: self.time,
                        sender: self.id,
                        request_times: self.request_times.clone(),
                        finish_times: self.finish_times.clone(),
                        oldest: None,
                    };
                    return self.net.send(request.sender, Message::Request(bounce));
                }
            }
        }
        if self.have_token {
            if let Some(next) = self.search_oldest_request() {
                self.pass_token(next)?
            }
        }
        Ok(())
    }

    fn on_token(&mut self, token: Token) -> anyhow::Result<()> {
        self.absorb(token.time, Some(&token.request_times), &token.finish_times);
        anyhow::ensure!(
            self.token.is_none(),
            "fuchi: node {} received a second token",
            self.id
        );
        // keep `have_token` false: the token is pinned until the finish
        self.token = Some(token);
        debug!("fuchi: node {} received the token", self.id);
        self.upcall.send(Granted)
    }

    fn on_finish(&mut self, finish: Finish) -> anyhow::Result<()> {
        self.absorb(finish.time, None, &finish.finish_times);
        if finish.sender == self.id {
            // own announcement looped back through the voting set
            return Ok(());
        }
        let fresh = match self.finish_times[Self::slot(finish.sender)] {
            Some(finished) => finish.time > finished,
            None => true,
        };
        if !fresh {
            return Ok(());
        }
        if self.search_oldest_request().is_some() {
            // the finisher kept the token: chase it with the requests known
            // here
            self.wait = None;
            self.time += 1;
            debug!(
                "fuchi: node {} chases the token kept by node {}",
                self.id, finish.sender
            );
            let request = Request {
                time: self.time,
                sender: self.id,
                request_times: self.request_times.clone(),
                finish_times: self.finish_times.clone(),
                oldest: None,
            };
            self.net.send(finish.sender, Message::Request(request))
        } else {
            self.wait = Some((finish.sender, finish.time));
            Ok(())
        }
    }

    fn pass_token(&mut self, next: NodeId) -> anyhow::Result<()> {
        let Some(mut token) = self.token.take() else {
            anyhow::bail!("fuchi: node {} passing a token it does not hold", self.id)
        };
        self.oldest = self.request_times[Self::slot(next)];
        token.time = self.time;
        token.request_times = self.request_times.clone();
        token.finish_times = self.finish_times.clone();
        self.have_token = false;
        debug!("fuchi: node {} passes the token to node {}", self.id, next);
        self.net.send(next, Message::Token(token))
    }

    fn send_finish(&mut self) -> anyhow::Result<()> {
        let finish = Finish {
            time: self.time,
            sender: self.id,
            finish_times: self.finish_times.clone(),
        };
        for &peer in &self.members {
            self.net.send(peer, Message::Finish(finish.clone()))?
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use crate::{
        net::{deserialize, serialize},
        quorum,
        testing::{drive, Cluster, GrantLog, Outbox},
    };

    use super::*;

    type TestProcessor = Processor<Outbox<Message>, GrantLog>;

    fn cluster(num_node: u8) -> Cluster<TestProcessor, Message> {
        let mut cluster = Cluster::new(num_node, |id, outbox, grants| {
            Processor::new(
                id,
                num_node,
                quorum::members(num_node, id).unwrap().to_vec(),
                outbox,
                grants,
            )
        });
        for node in &mut cluster.nodes {
            node.on_event(Init).unwrap()
        }
        cluster
    }

    fn token_count(cluster: &Cluster<TestProcessor, Message>) -> usize {
        let held = cluster
            .nodes
            .iter()
            .filter(|processor| processor.token.is_some())
            .count();
        let in_flight = cluster
            .network
            .borrow()
            .queues
            .values()
            .flatten()
            .filter(|message| matches!(message, Message::Token(_)))
            .count();
        held + in_flight
    }

    #[test]
    fn message_codec_round_trip() {
        let times = |seed: u32| (0..7).map(|i| (i % 2 == 0).then(|| seed + i)).collect();
        for message in [
            Message::Request(Request {
                time: 9,
                sender: 3,
                request_times: times(1),
                finish_times: times(2),
                oldest: Some(4),
            }),
            Message::Token(Token {
                time: 10,
                request_times: times(3),
                finish_times: times(4),
            }),
            Message::Finish(Finish {
                time: 11,
                sender: 5,
                finish_times: times(5),
            }),
            Message::LocalRequest,
            Message::LocalFinish,
        ] {
            let buf = serialize(&message).unwrap();
            assert!(buf.len() <= crate::mailbox::MAX_PAYLOAD_LEN);
            assert_eq!(deserialize::<Message>(&buf).unwrap(), message)
        }
    }

    #[test]
    fn boot_announcement_sets_waits() {
        let mut cluster = cluster(3);
        let mut rng = StdRng::seed_from_u64(0);
        cluster.run(&mut rng).unwrap();
        assert!(cluster.node(1).token.is_some());
        assert!(cluster.node(1).have_token);
        // node 2 shares node 1's voting set and now waits on it; node 3 does
        // not hear the announcement
        assert_eq!(cluster.node(2).wait, Some((1, 1)));
        assert_eq!(cluster.node(3).wait, None);
        assert_eq!(token_count(&cluster), 1)
    }

    // an uncontended acquire by node 3 pulls the token straight from node 1
    #[test]
    fn token_transfers_to_requester() {
        let mut cluster = cluster(3);
        let mut rng = StdRng::seed_from_u64(3);
        cluster.run(&mut rng).unwrap();
        cluster.local(3, Message::LocalRequest).unwrap();
        cluster.run(&mut rng).unwrap();
        assert_eq!(cluster.take_grants(), [3]);
        assert!(!cluster.node(1).have_token);
        assert!(cluster.node(1).token.is_none());
        assert_eq!(cluster.node(1).oldest, Some(1));
        assert!(cluster.node(3).token.is_some());
        // pinned for the critical section
        assert!(!cluster.node(3).have_token);
        cluster.local(3, Message::LocalFinish).unwrap();
        cluster.run(&mut rng).unwrap();
        assert!(cluster.node(3).have_token);
        assert_eq!(token_count(&cluster), 1);
        // node 1 saw node 3's finish vector and masked the request out
        assert!(cluster.node(1).request_times.iter().all(Option::is_none))
    }

    #[test]
    fn resident_token_grants_without_traffic() {
        let mut cluster = cluster(1);
        let mut rng = StdRng::seed_from_u64(0);
        // drain the boot announcement, which loops back to node 1 itself
        cluster.run(&mut rng).unwrap();
        let sent_before = cluster.sent().len();
        cluster.local(1, Message::LocalRequest).unwrap();
        assert_eq!(cluster.take_grants(), [1]);
        assert_eq!(cluster.sent().len(), sent_before);
        cluster.local(1, Message::LocalFinish).unwrap();
        cluster.run(&mut rng).unwrap();
        assert!(cluster.node(1).have_token);
        // the finish announcement stays on the loopback path as well
        assert!(cluster
            .sent()
            .iter()
            .all(|&(from, to, _)| (from, to) == (1, 1)))
    }

    // a node with no token and an older request on the books sends the
    // refreshed view back to a sender whose watermark dominates, exactly once
    #[test]
    fn starved_watermark_bounces_once() {
        let mut cluster = cluster(7);
        let mut rng = StdRng::seed_from_u64(0);
        cluster.run(&mut rng).unwrap();
        cluster.local(4, Message::LocalRequest).unwrap();
        // node 5 learns of node 4's request but cannot serve it
        assert!(cluster.step_pair(4, 5).unwrap());
        assert_eq!(cluster.node(5).request_times[3], Some(1));
        let sent_before = cluster.sent().len();
        let starved = Request {
            time: 5,
            sender: 6,
            request_times: vec![None, None, None, None, None, Some(5), None],
            finish_times: vec![None; 7],
            oldest: Some(0),
        };
        cluster.local(5, Message::Request(starved)).unwrap();
        let sent = cluster.sent();
        assert_eq!(sent.len(), sent_before + 1);
        let (from, to, message) = sent.last().unwrap();
        assert_eq!((from, to), (&5, &6));
        let Message::Request(bounce) = message else {
            panic!("expected a bounced request, got {message:?}")
        };
        assert_eq!(bounce.sender, 5);
        assert_eq!(bounce.oldest, None);
        assert_eq!(bounce.request_times[3], Some(1))
    }

    // nodes 2 and 4 churn through the lock; node 6's single request still
    // gets the token within a bounded number of deliveries
    #[test]
    fn old_request_is_not_starved() {
        let mut cluster = cluster(7);
        let mut rng = StdRng::seed_from_u64(6);
        cluster.run(&mut rng).unwrap();
        cluster.local(6, Message::LocalRequest).unwrap();
        let mut waiting = [false; 2];
        'churn: for step in 0.. {
            assert!(step < 20_000, "node 6 starved after {step} deliveries");
            for (slot, node) in [2, 4].into_iter().enumerate() {
                if !waiting[slot] && rng.gen_bool(0.5) {
                    waiting[slot] = true;
                    cluster.local(node, Message::LocalRequest).unwrap()
                }
            }
            for granted in cluster.take_grants() {
                cluster.local(granted, Message::LocalFinish).unwrap();
                if granted == 6 {
                    break 'churn;
                }
                waiting[granted as usize / 2 - 1] = false
            }
            cluster.step(&mut rng).unwrap();
        }
    }

    #[test]
    fn contended_sweep_keeps_token_unique() {
        for (num_node, seed) in [(3, 0), (3, 1), (7, 2)] {
            let mut cluster = cluster(num_node);
            let mut rng = StdRng::seed_from_u64(seed);
            drive(
                &mut cluster,
                &mut rng,
                2,
                || Message::LocalRequest,
                || Message::LocalFinish,
                |cluster| assert_eq!(token_count(cluster), 1),
            )
            .unwrap();
            // back to rest: the token sits whole at exactly one node, which
            // knows of no outstanding request
            assert_eq!(token_count(&cluster), 1);
            let holder = cluster
                .nodes
                .iter()
                .find(|processor| processor.token.is_some())
                .unwrap();
            assert!(holder.have_token);
            assert!(holder.request_times.iter().all(Option::is_none))
        }
    }

    #[test]
    fn second_token_is_fatal() {
        let mut cluster = cluster(3);
        let token = Token {
            time: 1,
            request_times: vec![None; 3],
            finish_times: vec![None; 3],
        };
        assert!(cluster.local(1, Message::Token(token)).is_err())
    }
}
