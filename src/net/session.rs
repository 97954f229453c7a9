// the transport under the mailbox: a full mesh of TCP streams, one per
// ordered pair of nodes. each node connects outward to every smaller node id
// and accepts from every larger one; the two ends exchange their node ids as
// decimal strings before any frame flows. frames are a one-byte size header
// followed by that many payload bytes, already in canonical byte order.
// transport errors are fatal: the first failed stream takes the node down

use std::{collections::HashMap, net::SocketAddr};

use anyhow::Context as _;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinSet,
};
use tracing::info;

use crate::{
    mailbox::{Class, Envelope, MailboxReceiver, MailboxSender, ALL_NODES},
    NodeId,
};

/// The well-known port every node listens on.
pub const MESH_PORT: u16 = 2017;

const PREAMBLE_LEN: usize = 8;

fn preamble(id: NodeId) -> [u8; PREAMBLE_LEN] {
    let mut buf = [b' '; PREAMBLE_LEN];
    let id = id.to_string();
    buf[..id.len()].copy_from_slice(id.as_bytes());
    buf
}

async fn read_preamble(stream: &mut TcpStream) -> anyhow::Result<NodeId> {
    let mut buf = [0; PREAMBLE_LEN];
    stream.read_exact(&mut buf).await?;
    Ok(std::str::from_utf8(&buf)?.trim_end().parse()?)
}

#[derive(Debug)]
pub struct Mesh {
    peers: HashMap<NodeId, UnboundedSender<Bytes>>,
    tasks: JoinSet<anyhow::Result<()>>,
}

/// Build the mesh: connect outward to every smaller node id, accept inbound
/// from every larger one, verifying identities on the way. `addrs` is
/// indexed by node id minus one. Returns once all `num_node - 1` streams are
/// up.
pub async fn establish(
    listener: TcpListener,
    id: NodeId,
    num_node: u8,
    addrs: Vec<SocketAddr>,
    ingress: MailboxSender,
) -> anyhow::Result<Mesh> {
    anyhow::ensure!(
        addrs.len() == num_node as usize,
        "{} peer addresses for {num_node} nodes",
        addrs.len()
    );
    let mut mesh = Mesh {
        peers: Default::default(),
        tasks: Default::default(),
    };
    for peer in 1..id {
        let mut stream = TcpStream::connect(addrs[peer as usize - 1])
            .await
            .with_context(|| format!("connecting to node {peer}"))?;
        stream.set_nodelay(true)?;
        stream.write_all(&preamble(id)).await?;
        let remote = read_preamble(&mut stream).await?;
        anyhow::ensure!(
            remote == peer,
            "node {remote} answered on the stream to node {peer}"
        );
        info!("connected to node {peer}");
        mesh.attach(peer, stream, &ingress)
    }
    for _ in id..num_node {
        let (mut stream, _) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let remote = read_preamble(&mut stream).await?;
        stream.write_all(&preamble(id)).await?;
        anyhow::ensure!(
            remote > id && remote <= num_node && !mesh.peers.contains_key(&remote),
            "unexpected connection from node {remote}"
        );
        info!("accepted connection from node {remote}");
        mesh.attach(remote, stream, &ingress)
    }
    info!("fully connected");
    Ok(mesh)
}

impl Mesh {
    fn attach(&mut self, peer: NodeId, stream: TcpStream, ingress: &MailboxSender) {
        let (read, write) = stream.into_split();
        let (sender, receiver) = unbounded_channel();
        self.tasks.spawn(read_task(read, peer, ingress.clone()));
        self.tasks.spawn(write_task(write, peer, receiver));
        self.peers.insert(peer, sender);
    }

    /// Egress session: route ToNet envelopes onto peer streams. Runs for the
    /// node's lifetime; the first stream failure is returned and ends it.
    pub async fn run(&mut self, mut egress: MailboxReceiver) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                envelope = egress.recv() => self.dispatch(envelope?)?,
                Some(result) = self.tasks.join_next() => result??,
            }
        }
    }

    fn dispatch(&mut self, envelope: Envelope) -> anyhow::Result<()> {
        if envelope.to == ALL_NODES {
            for sender in self.peers.values() {
                sender
                    .send(envelope.payload.clone())
                    .map_err(|_| anyhow::anyhow!("peer writer exited"))?
            }
            return Ok(());
        }
        self.peers
            .get(&envelope.to)
            .ok_or(anyhow::anyhow!("no stream to node {}", envelope.to))?
            .send(envelope.payload)
            .map_err(|_| anyhow::anyhow!("peer writer exited"))
    }
}

async fn read_task(
    mut stream: OwnedReadHalf,
    peer: NodeId,
    ingress: MailboxSender,
) -> anyhow::Result<()> {
    loop {
        let frame = async {
            let size = stream.read_u8().await?;
            anyhow::ensure!(size != 0, "empty frame");
            let mut buf = vec![0; size as usize];
            stream.read_exact(&mut buf).await?;
            anyhow::Ok(buf)
        };
        let buf = frame.await.with_context(|| format!("<<< node {peer}"))?;
        ingress.send(Envelope::new(Class::ToAlgo, peer, buf)?)?
    }
}

async fn write_task(
    mut stream: OwnedWriteHalf,
    peer: NodeId,
    mut receiver: UnboundedReceiver<Bytes>,
) -> anyhow::Result<()> {
    while let Some(buf) = receiver.recv().await {
        let frame = async {
            stream.write_u8(buf.len() as u8).await?;
            stream.write_all(&buf).await?;
            stream.flush().await?;
            anyhow::Ok(())
        };
        frame.await.with_context(|| format!(">>> node {peer}"))?
    }
    // the mesh was dropped: the node is shutting down
    Ok(())
}
