// the demo application guarded by the cluster mutex: every critical section
// appends exactly one record to the shared buffer server. frames reuse the
// one-byte-size wire convention; the slot index comes back as a big-endian
// u32

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, ToSocketAddrs},
};

use crate::{net, NodeId};

/// The buffer server's listening port.
pub const BUFFER_PORT: u16 = 1992;

/// Records per printed batch.
pub const BATCH_LEN: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub node: NodeId,
    pub item: u32,
}

/// One critical section's worth of work: connect, append, learn the slot.
pub async fn append(server: impl ToSocketAddrs, record: Record) -> anyhow::Result<u32> {
    let mut stream = TcpStream::connect(server).await?;
    let buf = net::serialize(&record)?;
    stream.write_u8(buf.len() as u8).await?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(stream.read_u32().await?)
}

/// Server side: read the one record a producer sends per connection.
pub async fn read_record(stream: &mut TcpStream) -> anyhow::Result<Record> {
    let size = stream.read_u8().await?;
    let mut buf = vec![0; size as usize];
    stream.read_exact(&mut buf).await?;
    net::deserialize(&buf)
}
