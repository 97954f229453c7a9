// the shared buffer the producers contend for. connections are handled
// concurrently and the slot index is read well before it is written back, so
// producers running without the cluster mutex overwrite each other's slots
// and the corruption shows up in the printed batches

use std::sync::Arc;

use clap::Parser;
use dme::buffer::{self, Record, BATCH_LEN, BUFFER_PORT};
use tokio::{io::AsyncWriteExt, net::TcpListener, sync::Mutex, time::Duration};
use tracing::{info, warn};

#[derive(Parser)]
#[command(about = "shared buffer server observing the cluster mutex")]
struct Cli {
    #[arg(long, default_value_t = BUFFER_PORT)]
    port: u16,
}

#[derive(Debug, Default)]
struct Buffer {
    records: Vec<Record>,
    index: usize,
}

impl Buffer {
    fn print_batch(&self, batch: usize) {
        println!("------ start batch {batch} ------");
        for record in &self.records {
            println!("node {:4} item {:4}", record.node, record.item)
        }
        println!("------ end batch {batch} ------")
    }
}

async fn handle(
    mut stream: tokio::net::TcpStream,
    buffer: Arc<Mutex<Buffer>>,
) -> anyhow::Result<()> {
    let record = buffer::read_record(&mut stream).await?;
    let slot = buffer.lock().await.index;
    // the window between claiming the slot and committing it: overlapping
    // producers land on the same slot
    tokio::time::sleep(Duration::from_millis(5)).await;
    {
        let mut buffer = buffer.lock().await;
        let staged = slot % BATCH_LEN;
        if buffer.records.len() <= staged {
            buffer.records.resize(staged + 1, Default::default())
        }
        buffer.records[staged] = record;
        buffer.index = slot + 1;
        info!(
            "node {} appended item {} at slot {slot}",
            record.node, record.item
        );
        if buffer.index % BATCH_LEN == 0 {
            buffer.print_batch(buffer.index / BATCH_LEN - 1);
            buffer.records.clear()
        }
    }
    stream.write_u32(slot as u32).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let listener = TcpListener::bind(("0.0.0.0", cli.port)).await?;
    info!("buffer server listening on {}", listener.local_addr()?);
    let buffer = Arc::new(Mutex::new(Buffer::default()));
    loop {
        let (stream, addr) = listener.accept().await?;
        let buffer = buffer.clone();
        tokio::spawn(async move {
            if let Err(err) = handle(stream, buffer).await {
                warn!("{addr} {err}")
            }
        });
    }
}
