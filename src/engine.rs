// ties a protocol processor to the per-node fabric. the handler loop below
// is the sole mutator of protocol state: it dequeues ToAlgo envelopes one at
// a time, decodes them and runs the selected processor, which emits ToApp
// envelopes (unblocking `acquire`) and ToNet envelopes (dispatched by the
// transport) through the adapters in this module. the protocol is a
// configuration value: swapping it never touches the routing

use bytes::Bytes;
use serde::Serialize;

use crate::{
    event::{OnEvent, SendEvent},
    fuchi, maekawa,
    mailbox::{Class, Envelope, Mailbox, MailboxReceiver, MailboxSender, ALL_NODES},
    net::{self, All, SendMessage},
    quorum, ricart, Granted, NodeId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Algorithm {
    #[display(fmt = "ricart")]
    Ricart,
    #[display(fmt = "maekawa")]
    Maekawa,
    #[display(fmt = "fuchi")]
    Fuchi,
}

impl std::str::FromStr for Algorithm {
    type Err = anyhow::Error;

    fn from_str(algorithm: &str) -> anyhow::Result<Self> {
        match algorithm {
            "ricart" => Ok(Self::Ricart),
            "maekawa" => Ok(Self::Maekawa),
            "fuchi" => Ok(Self::Fuchi),
            _ => anyhow::bail!("unknown algorithm {algorithm}"),
        }
    }
}

/// Algorithm-facing sender: encodes to canonical bytes and picks the
/// envelope class. A message to this node itself short-circuits back to the
/// handler and never reaches the wire.
#[derive(Debug, Clone)]
pub struct ProtocolNet {
    id: NodeId,
    num_node: u8,
    mailbox: MailboxSender,
}

impl<M: Serialize> SendMessage<NodeId, M> for ProtocolNet {
    fn send(&mut self, dest: NodeId, message: M) -> anyhow::Result<()> {
        let class = if dest == self.id {
            Class::ToAlgo
        } else {
            Class::ToNet
        };
        let payload = net::serialize(&message)?;
        self.mailbox.send(Envelope::new(class, dest, payload)?)
    }
}

impl<M: Serialize> SendMessage<All, M> for ProtocolNet {
    fn send(&mut self, All: All, message: M) -> anyhow::Result<()> {
        if self.num_node == 1 {
            // broadcast excludes the sender, so there is nobody to tell
            return Ok(());
        }
        let payload = net::serialize(&message)?;
        self.mailbox
            .send(Envelope::new(Class::ToNet, ALL_NODES, payload)?)
    }
}

/// Unblocks the application: one empty ToApp envelope per grant.
#[derive(Debug, Clone)]
pub struct AppUpcall(MailboxSender);

impl SendEvent<Granted> for AppUpcall {
    fn send(&mut self, Granted: Granted) -> anyhow::Result<()> {
        self.0.send(Envelope::new(Class::ToApp, 0, Bytes::new())?)
    }
}

/// The selected protocol's state machine behind one payload entry point.
#[derive(Debug)]
pub enum Handler<N, U> {
    Ricart(ricart::Processor<N, U>),
    Maekawa(maekawa::Processor<N, U>),
    Fuchi(fuchi::Processor<N, U>),
}

impl<N, U> Handler<N, U> {
    pub fn new(
        algorithm: Algorithm,
        id: NodeId,
        num_node: u8,
        net: N,
        upcall: U,
    ) -> anyhow::Result<Self> {
        let handler = match algorithm {
            Algorithm::Ricart => Self::Ricart(ricart::Processor::new(id, num_node, net, upcall)),
            Algorithm::Maekawa => Self::Maekawa(maekawa::Processor::new(
                id,
                quorum::members(num_node, id)?.to_vec(),
                net,
                upcall,
            )),
            Algorithm::Fuchi => Self::Fuchi(fuchi::Processor::new(
                id,
                num_node,
                quorum::members(num_node, id)?.to_vec(),
                net,
                upcall,
            )),
        };
        Ok(handler)
    }
}

impl<N: ricart::Net + maekawa::Net + fuchi::Net, U: SendEvent<Granted>> Handler<N, U> {
    /// Startup steps that talk to peers (the Fuchi boot announcement).
    pub fn init(&mut self) -> anyhow::Result<()> {
        if let Self::Fuchi(processor) = self {
            processor.on_event(fuchi::Init)?
        }
        Ok(())
    }

    pub fn on_payload(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        match self {
            Self::Ricart(processor) => processor.on_event(net::deserialize(payload)?),
            Self::Maekawa(processor) => processor.on_event(net::deserialize(payload)?),
            Self::Fuchi(processor) => {
                processor.on_event(net::deserialize::<fuchi::Message>(payload)?)
            }
        }
    }
}

/// The local API, the only two calls an application makes. Reentrancy is not
/// detected: acquiring twice without a release corrupts protocol state.
#[derive(Debug)]
pub struct MutexHandle {
    algorithm: Algorithm,
    mailbox: MailboxSender,
    granted: MailboxReceiver,
}

impl MutexHandle {
    /// Blocks until this node holds the cluster-wide mutex.
    pub async fn acquire(&mut self) -> anyhow::Result<()> {
        let payload = match self.algorithm {
            Algorithm::Ricart => net::serialize(&ricart::Message::LocalRequest)?,
            Algorithm::Maekawa => net::serialize(&maekawa::Message::LocalRequest)?,
            Algorithm::Fuchi => net::serialize(&fuchi::Message::LocalRequest)?,
        };
        self.mailbox.send(Envelope::new(Class::ToAlgo, 0, payload)?)?;
        self.granted.recv().await?;
        Ok(())
    }

    /// Relinquishes the mutex; returns without waiting on the protocol.
    pub fn release(&mut self) -> anyhow::Result<()> {
        let payload = match self.algorithm {
            Algorithm::Ricart => net::serialize(&ricart::Message::LocalRelease)?,
            Algorithm::Maekawa => net::serialize(&maekawa::Message::LocalRelease)?,
            Algorithm::Fuchi => net::serialize(&fuchi::Message::LocalFinish)?,
        };
        self.mailbox.send(Envelope::new(Class::ToAlgo, 0, payload)?)
    }
}

#[derive(Debug)]
pub struct Engine {
    handler: Handler<ProtocolNet, AppUpcall>,
    algo: MailboxReceiver,
}

impl Engine {
    /// Wire up one node. Returns the engine (handler loop), the application
    /// handle, and the transport attachments: the mailbox sender for ingress
    /// envelopes and the ToNet receiver for egress.
    pub fn new(
        algorithm: Algorithm,
        id: NodeId,
        num_node: u8,
    ) -> anyhow::Result<(Self, MutexHandle, MailboxSender, MailboxReceiver)> {
        anyhow::ensure!(
            (1..=num_node).contains(&id),
            "node id {id} out of 1..={num_node}"
        );
        let mailbox = Mailbox::new();
        let handler = Handler::new(
            algorithm,
            id,
            num_node,
            ProtocolNet {
                id,
                num_node,
                mailbox: mailbox.sender.clone(),
            },
            AppUpcall(mailbox.sender.clone()),
        )?;
        let handle = MutexHandle {
            algorithm,
            mailbox: mailbox.sender.clone(),
            granted: mailbox.app,
        };
        let engine = Self {
            handler,
            algo: mailbox.algo,
        };
        Ok((engine, handle, mailbox.sender, mailbox.net))
    }

    /// The cooperative handler loop, the sole mutator of protocol state.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.handler.init()?;
        loop {
            let envelope = self.algo.recv().await?;
            self.handler.on_payload(&envelope.payload)?
        }
    }
}
