// the per-node routing fabric: one FIFO per destination class, fed through a
// single cloneable sender. this is the only synchronisation point in a node;
// the handler, the blocked application and the outbound transport each own
// the receiving end of exactly one class

use bytes::Bytes;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::NodeId;

/// Wire frames carry a one-byte size header, so no payload may exceed this.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Distinguished `Envelope::to` value: deliver to every peer.
pub const ALL_NODES: NodeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    /// To this node's protocol handler.
    ToAlgo,
    /// To the local application blocked in `acquire`.
    ToApp,
    /// To the outbound transport, destined for `to`.
    ToNet,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub class: Class,
    /// Destination node, only meaningful for `ToNet`; `ALL_NODES` broadcasts.
    pub to: NodeId,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(class: Class, to: NodeId, payload: impl Into<Bytes>) -> anyhow::Result<Self> {
        let payload = payload.into();
        anyhow::ensure!(
            payload.len() <= MAX_PAYLOAD_LEN,
            "{} byte payload exceeds the wire frame",
            payload.len()
        );
        Ok(Self { class, to, payload })
    }
}

#[derive(Debug, Clone)]
pub struct MailboxSender {
    algo: UnboundedSender<Envelope>,
    app: UnboundedSender<Envelope>,
    net: UnboundedSender<Envelope>,
}

impl MailboxSender {
    /// Non-blocking, never drops. Envelopes of the same class are received in
    /// send order; no order is defined across classes.
    pub fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        let channel = match envelope.class {
            Class::ToAlgo => &self.algo,
            Class::ToApp => &self.app,
            Class::ToNet => &self.net,
        };
        channel
            .send(envelope)
            .map_err(|_| anyhow::anyhow!("mailbox closed"))
    }
}

#[derive(Debug)]
pub struct MailboxReceiver {
    class: Class,
    receiver: UnboundedReceiver<Envelope>,
}

impl MailboxReceiver {
    pub async fn recv(&mut self) -> anyhow::Result<Envelope> {
        self.receiver
            .recv()
            .await
            .ok_or(anyhow::anyhow!("mailbox closed"))
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.receiver.try_recv().ok()
    }

    pub fn class(&self) -> Class {
        self.class
    }
}

#[derive(Debug)]
pub struct Mailbox {
    pub sender: MailboxSender,
    pub algo: MailboxReceiver,
    pub app: MailboxReceiver,
    pub net: MailboxReceiver,
}

impl Mailbox {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (algo_sender, algo) = unbounded_channel();
        let (app_sender, app) = unbounded_channel();
        let (net_sender, net) = unbounded_channel();
        Self {
            sender: MailboxSender {
                algo: algo_sender,
                app: app_sender,
                net: net_sender,
            },
            algo: MailboxReceiver {
                class: Class::ToAlgo,
                receiver: algo,
            },
            app: MailboxReceiver {
                class: Class::ToApp,
                receiver: app,
            },
            net: MailboxReceiver {
                class: Class::ToNet,
                receiver: net,
            },
        }
    }
}
