//! Simulated clients: a writer task issuing proposals under a concurrency bound and a reader
//! task matching replies to them by command id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::select;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::shard::ErasureStorage;
use crate::stats::Sample;
use crate::wire::{OpKind, Propose, ProposeReply, WireError};
use crate::workload::{Pacer, WorkloadGenerator};

/// A proposal that was sent and has not been answered yet. Holds its concurrency slot.
pub struct Outstanding {
    pub issued_at: Instant,
    pub issued_wall: SystemTime,
    pub op: OpKind,
    _slot: OwnedSemaphorePermit,
}

/// Requests in flight for one client, shared by its writer and reader.
#[derive(Default)]
pub struct OutstandingTable {
    entries: Mutex<HashMap<i32, Outstanding>>,
}

impl OutstandingTable {
    pub fn insert(&self, command_id: i32, op: OpKind, slot: OwnedSemaphorePermit) {
        let entry = Outstanding {
            issued_at: Instant::now(),
            issued_wall: SystemTime::now(),
            op,
            _slot: slot,
        };
        self.entries.lock().insert(command_id, entry);
    }

    pub fn remove(&self, command_id: i32) -> Option<Outstanding> {
        self.entries.lock().remove(&command_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Writer<W> {
    client: usize,
    conn: W,
    workload: WorkloadGenerator,
    pacer: Pacer,
    storage: Arc<ErasureStorage>,
    table: Arc<OutstandingTable>,
    gate: Arc<Semaphore>,
    payload: Arc<Vec<u8>>,
    limit: Option<u64>,
    next_id: i32,
    finished: watch::Sender<bool>,
}

impl<W: AsyncWrite + Unpin + Send> Writer<W> {
    pub async fn run(mut self) -> Result<()> {
        loop {
            if self.limit.is_some_and(|limit| self.next_id as u64 >= limit) {
                info!(client = self.client, sent = self.next_id, "operation limit reached");
                let _ = self.finished.send(true);
                return Ok(());
            }
            self.issue().await?;
        }
    }

    async fn issue(&mut self) -> Result<()> {
        let command_id = self.next_id;
        self.next_id += 1;
        let op = self.workload.next_operation();

        // the payload must be stored before its write is proposed
        let mut value = 0;
        if op.op == OpKind::Write {
            self.storage
                .write(command_id as i64, self.payload.clone())
                .await
                .context("storing payload")?;
            value = command_id as i64;
        }

        let slot = self.pacer.acquire(&self.gate).await?;
        self.table.insert(command_id, op.op, slot);
        let req = Propose {
            command_id,
            op: op.op,
            key: op.key,
            value,
            timestamp: 0,
        };
        if let Err(err) = req.write_to(&mut self.conn).await {
            self.table.remove(command_id);
            return Err(err).with_context(|| format!("sending command {command_id}"));
        }
        debug!(client = self.client, command_id, key = op.key, op = ?op.op, "sent");
        Ok(())
    }
}

pub struct Reader<R> {
    client: usize,
    replica: usize,
    conn: R,
    storage: Arc<ErasureStorage>,
    table: Arc<OutstandingTable>,
    samples: mpsc::Sender<Sample>,
    writer_done: watch::Receiver<bool>,
}

impl<R: AsyncRead + Unpin + Send> Reader<R> {
    /// Runs until the connection fails, the replica rejects a command, or the writer is
    /// done and every request it sent was answered.
    pub async fn run(self) {
        let Reader {
            client,
            replica,
            mut conn,
            storage,
            table,
            samples,
            mut writer_done,
        } = self;
        let mut writer_alive = true;
        let mut reporting = true;
        loop {
            // once the writer stopped the table only shrinks
            if (!writer_alive || *writer_done.borrow()) && table.is_empty() {
                info!(client, replica, "all replies received, reader done");
                return;
            }
            // the read is kept across writer notifications, a frame is never cut in half
            let read = ProposeReply::read_from(&mut conn);
            tokio::pin!(read);
            let res = loop {
                select! {
                    res = &mut read => break res,
                    changed = writer_done.changed(), if writer_alive => {
                        if changed.is_err() {
                            writer_alive = false;
                        }
                        if (!writer_alive || *writer_done.borrow()) && table.is_empty() {
                            info!(client, replica, "all replies received, reader done");
                            return;
                        }
                    }
                }
            };
            let reply = match res {
                Ok(reply) => reply,
                Err(WireError::Closed) => {
                    warn!(client, replica, "replica closed the connection, reader stopped");
                    return;
                }
                Err(err) => {
                    error!(client, replica, error = %err, "reading reply, reader stopped");
                    return;
                }
            };
            let Some(entry) = table.remove(reply.command_id) else {
                warn!(client, command_id = reply.command_id, "reply for unknown command");
                continue;
            };
            let is_read = entry.op == OpKind::Read;
            if is_read {
                // reads return the id of the write whose payload is current
                if let Err(err) = storage.read(reply.value).await {
                    warn!(
                        client,
                        command_id = reply.command_id,
                        payload = reply.value,
                        error = format!("{err:#}"),
                        "reconstructing payload"
                    );
                }
            }
            let rtt = entry.issued_at.elapsed();
            let issued_at = entry.issued_wall;
            drop(entry);

            let sample = Sample {
                issued_at,
                received_at: issued_at + rtt,
                rtt,
                commit_latency: Duration::ZERO,
                is_read,
                replica,
            };
            if samples.send(sample).await.is_err() && reporting {
                warn!(client, "statistics reporter is gone, dropping samples");
                reporting = false;
            }
        }
    }
}

/// Both tasks of a running client.
pub struct ClientHandle {
    pub table: Arc<OutstandingTable>,
    pub writer: JoinHandle<()>,
    pub reader: JoinHandle<()>,
}

impl ClientHandle {
    pub async fn join(self) {
        let _ = self.writer.await;
        let _ = self.reader.await;
    }
}

/// Builds the writer/reader pair of client number `client`, talking to `replica` over
/// `conn`.
pub fn new_client<R, W>(
    cfg: &Config,
    client: usize,
    replica: usize,
    conn: (R, W),
    storage: Arc<ErasureStorage>,
    samples: mpsc::Sender<Sample>,
) -> Result<(Writer<W>, Reader<R>, Arc<OutstandingTable>)> {
    let table = Arc::new(OutstandingTable::default());
    let (finished, writer_done) = watch::channel(false);
    let mut payload = vec![0u8; storage.payload_len()];
    rand::rng().fill_bytes(&mut payload);

    let writer = Writer {
        client,
        conn: conn.1,
        workload: WorkloadGenerator::from_config(cfg, client)?,
        pacer: Pacer::new(cfg.poisson_mean_us, client, cfg.seed)?,
        storage: storage.clone(),
        table: table.clone(),
        gate: Arc::new(Semaphore::new(cfg.outstanding)),
        payload: Arc::new(payload),
        limit: cfg.ops_per_thread,
        next_id: 0,
        finished,
    };
    let reader = Reader {
        client,
        replica,
        conn: conn.0,
        storage,
        table: table.clone(),
        samples,
        writer_done,
    };
    Ok((writer, reader, table))
}

pub fn spawn_client<R, W>(
    cfg: &Config,
    client: usize,
    replica: usize,
    conn: (R, W),
    storage: Arc<ErasureStorage>,
    samples: mpsc::Sender<Sample>,
) -> Result<ClientHandle>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (writer, reader, table) = new_client(cfg, client, replica, conn, storage, samples)?;
    let writer = task::spawn(async move {
        if let Err(err) = writer.run().await {
            error!(client, error = format!("{err:#}"), "writer stopped");
        }
    });
    let reader = task::spawn(reader.run());
    Ok(ClientHandle {
        table,
        writer,
        reader,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::{duplex, split, DuplexStream};
    use tokio::time::timeout;

    use super::*;
    use crate::shard::tests::FlakyStore;
    use crate::shard::ShardStore;

    #[derive(Default)]
    struct ReplicaLog {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        proposals: Mutex<Vec<Propose>>,
    }

    // Answers every proposal after a delay that depends on its id, so replies come back
    // out of order. Rejects `nack` if set.
    fn fake_replica(stream: DuplexStream, log: Arc<ReplicaLog>, nack: Option<i32>) {
        let (mut rd, mut wr) = split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<ProposeReply>();
        let out = log.clone();
        tokio::spawn(async move {
            while let Some(reply) = rx.recv().await {
                out.in_flight.fetch_sub(1, Ordering::SeqCst);
                if reply.write_to(&mut wr).await.is_err() {
                    return;
                }
            }
        });
        tokio::spawn(async move {
            let mut kv = HashMap::new();
            while let Ok(p) = Propose::read_from(&mut rd).await {
                let n = log.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                log.max_in_flight.fetch_max(n, Ordering::SeqCst);
                log.proposals.lock().push(p.clone());
                let value = match p.op {
                    OpKind::Write => {
                        kv.insert(p.key, p.value);
                        p.value
                    }
                    OpKind::Read => kv.get(&p.key).copied().unwrap_or(0),
                };
                let reply = ProposeReply {
                    ok: nack != Some(p.command_id),
                    command_id: p.command_id,
                    value,
                    timestamp: 0,
                };
                let delay = Duration::from_millis(5 * (3 - p.command_id as u64 % 3));
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(reply);
                });
            }
        });
    }

    fn storage() -> Arc<ErasureStorage> {
        let stores = (0..3)
            .map(|_| Arc::new(FlakyStore::default()) as Arc<dyn ShardStore>)
            .collect();
        Arc::new(ErasureStorage::new(stores, 256).unwrap())
    }

    fn config(outstanding: usize, ops: u64, write_fraction: f64) -> Config {
        Config {
            shards: vec!["a".into(), "b".into(), "c".into()],
            payload_size: 256,
            outstanding,
            ops_per_thread: Some(ops),
            write_fraction,
            seed: Some(11),
            ..Default::default()
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Sample>) -> Vec<Sample> {
        let mut samples = Vec::new();
        while let Ok(s) = rx.try_recv() {
            samples.push(s);
        }
        samples
    }

    #[tokio::test]
    async fn test_pipelined_client() {
        let (client_io, replica_io) = duplex(1 << 16);
        let log = Arc::new(ReplicaLog::default());
        fake_replica(replica_io, log.clone(), None);

        let (tx, mut rx) = mpsc::channel(100);
        let handle = spawn_client(&config(3, 30, 0.5), 0, 1, split(client_io), storage(), tx).unwrap();
        let table = handle.table.clone();
        timeout(Duration::from_secs(10), handle.join()).await.unwrap();

        let samples = drain(&mut rx);
        assert_eq!(samples.len(), 30);
        assert!(samples.iter().all(|s| s.replica == 1));
        assert!(samples.iter().any(|s| s.is_read));
        assert!(samples.iter().any(|s| !s.is_read));
        // every reply waits at least 5ms at the replica
        assert!(samples.iter().all(|s| s.rtt >= Duration::from_millis(5)));
        for s in &samples {
            assert_eq!(s.received_at.duration_since(s.issued_at).unwrap(), s.rtt);
        }
        assert!(table.is_empty());

        let max = log.max_in_flight.load(Ordering::SeqCst);
        assert!((1..=3).contains(&max), "max in flight = {max}");
        let ids: Vec<i32> = log.proposals.lock().iter().map(|p| p.command_id).collect();
        assert_eq!(ids, (0..30).collect::<Vec<_>>());
        let writes = log.proposals.lock().iter().filter(|p| p.op == OpKind::Write).count();
        assert!(log
            .proposals
            .lock()
            .iter()
            .filter(|p| p.op == OpKind::Write)
            .all(|p| p.value == p.command_id as i64));
        assert!(writes > 0);
    }

    #[tokio::test]
    async fn test_negative_ack_stops_reader() {
        let (client_io, replica_io) = duplex(1 << 16);
        let log = Arc::new(ReplicaLog::default());
        fake_replica(replica_io, log.clone(), Some(2));

        let (tx, mut rx) = mpsc::channel(100);
        let handle = spawn_client(&config(1, 5, 1.0), 3, 0, split(client_io), storage(), tx).unwrap();
        timeout(Duration::from_secs(10), handle.reader).await.unwrap().unwrap();

        // command 2 was rejected, its slot is never given back
        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(handle.table.len(), 1);
        assert!(timeout(Duration::from_millis(100), handle.writer).await.is_err());
        assert_eq!(log.proposals.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_replica_gone() {
        let (client_io, replica_io) = duplex(1 << 16);
        drop(replica_io);
        let (tx, _rx) = mpsc::channel(100);
        let handle = spawn_client(&config(1, 5, 1.0), 0, 0, split(client_io), storage(), tx).unwrap();
        let table = handle.table.clone();
        timeout(Duration::from_secs(10), handle.join()).await.unwrap();
        // the failed send gives its slot back
        assert!(table.is_empty());
    }

    // Answers every proposal as soon as it is read.
    fn instant_replica(stream: DuplexStream) {
        tokio::spawn(async move {
            let (mut rd, mut wr) = split(stream);
            while let Ok(p) = Propose::read_from(&mut rd).await {
                let reply = ProposeReply {
                    ok: true,
                    command_id: p.command_id,
                    value: p.value,
                    timestamp: 0,
                };
                if reply.write_to(&mut wr).await.is_err() {
                    return;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_bounded_run_reads_last_reply() {
        let storage = storage();
        for (outstanding, run) in [1, 3].into_iter().flat_map(|c| (0..100).map(move |r| (c, r))) {
            let (client_io, replica_io) = duplex(1 << 16);
            instant_replica(replica_io);
            let (tx, mut rx) = mpsc::channel(100);
            let cfg = config(outstanding, 5, 1.0);
            let handle =
                spawn_client(&cfg, 0, 0, split(client_io), storage.clone(), tx).unwrap();
            let table = handle.table.clone();
            timeout(Duration::from_secs(10), handle.join()).await.unwrap();

            assert_eq!(drain(&mut rx).len(), 5, "C = {outstanding}, run {run}");
            assert!(table.is_empty(), "C = {outstanding}, run {run}");
        }
    }

    #[test]
    fn test_table_releases_slot() {
        let gate = Arc::new(Semaphore::new(2));
        let table = OutstandingTable::default();
        table.insert(0, OpKind::Write, gate.clone().try_acquire_owned().unwrap());
        table.insert(1, OpKind::Read, gate.clone().try_acquire_owned().unwrap());
        assert_eq!(gate.available_permits(), 0);
        assert_eq!(table.len(), 2);

        let entry = table.remove(1).unwrap();
        assert_eq!(entry.op, OpKind::Read);
        assert_eq!(gate.available_permits(), 0);
        drop(entry);
        assert_eq!(gate.available_permits(), 1);
        assert!(table.remove(1).is_none());
    }
}
