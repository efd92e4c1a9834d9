//! Erasure-coded payload storage spread over independent shard stores.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task;
use tonic::transport::Channel;
use tonic::Code;
use tracing::{debug, warn};

use crate::api::shard::{shard_store_client::ShardStoreClient, GetRequest, PutRequest};

mod codec;
pub mod server;

pub use codec::ErasureCodec;

#[tonic::async_trait]
pub trait ShardStore: Send + Sync {
    async fn put(&self, key: String, value: Vec<u8>) -> Result<()>;
    async fn get(&self, key: String) -> Result<Option<Vec<u8>>>;
}

/// Shard store reached over gRPC.
pub struct GrpcShardStore {
    client: ShardStoreClient<Channel>,
}

impl GrpcShardStore {
    pub fn new(addr: &str) -> Result<Self> {
        let ch = Channel::from_shared(addr.to_string())
            .with_context(|| format!("parsing shard store address {addr}"))?
            .connect_lazy();
        Ok(Self {
            client: ShardStoreClient::new(ch),
        })
    }
}

#[tonic::async_trait]
impl ShardStore for GrpcShardStore {
    async fn put(&self, key: String, value: Vec<u8>) -> Result<()> {
        self.client
            .clone()
            .put(PutRequest { key, value })
            .await
            .context("putting fragment")?;
        Ok(())
    }

    async fn get(&self, key: String) -> Result<Option<Vec<u8>>> {
        match self.client.clone().get(GetRequest { key }).await {
            Ok(resp) => Ok(Some(resp.into_inner().value)),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(anyhow!("getting fragment: {status}")),
        }
    }
}

/// Outcome of a payload write: how many fragments were acknowledged before returning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteAck {
    pub acked: usize,
    pub required: usize,
}

impl WriteAck {
    pub fn is_complete(&self) -> bool {
        self.acked >= self.required
    }
}

/// Writes payloads as `k` data fragments plus one parity fragment, one per shard store,
/// and reads them back from any `k` stores.
pub struct ErasureStorage {
    codec: Arc<ErasureCodec>,
    stores: Vec<Arc<dyn ShardStore>>,
    payload_len: usize,
}

impl ErasureStorage {
    pub fn new(stores: Vec<Arc<dyn ShardStore>>, payload_len: usize) -> Result<Self> {
        let codec = ErasureCodec::new(stores.len().saturating_sub(1))?;
        Ok(Self {
            codec: Arc::new(codec),
            stores,
            payload_len,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.codec.data_shards()
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Returns once `k` stores acknowledged their fragment. The remaining put keeps
    /// running in the background.
    pub async fn write(&self, id: i64, payload: Arc<Vec<u8>>) -> Result<WriteAck> {
        let codec = self.codec.clone();
        let fragments = task::spawn_blocking(move || codec.encode(&payload))
            .await
            .context("encoding task")??;

        let key = id.to_string();
        let mut pending: FuturesUnordered<_> = self
            .stores
            .iter()
            .zip(fragments)
            .enumerate()
            .map(|(shard, (store, fragment))| {
                let store = store.clone();
                let key = key.clone();
                task::spawn(async move { (shard, store.put(key, fragment).await) })
            })
            .collect();

        let required = self.codec.data_shards();
        let mut acked = 0;
        while let Some(res) = pending.next().await {
            match res {
                Ok((_, Ok(()))) => acked += 1,
                Ok((shard, Err(err))) => {
                    warn!(id, shard, error = format!("{err:#}"), "writing fragment");
                }
                Err(err) => warn!(id, error = %err, "fragment put task failed"),
            }
            if acked >= required {
                break;
            }
        }
        let ack = WriteAck { acked, required };
        if !ack.is_complete() {
            warn!(id, acked, required, "payload write is not recoverable");
        }
        debug!(id, acked, "payload written");
        Ok(ack)
    }

    /// Fetches fragments until `k` arrived (or every store answered) and decodes them.
    pub async fn read(&self, id: i64) -> Result<Vec<u8>> {
        let key = id.to_string();
        let mut pending: FuturesUnordered<_> = self
            .stores
            .iter()
            .enumerate()
            .map(|(shard, store)| {
                let store = store.clone();
                let key = key.clone();
                task::spawn(async move { (shard, store.get(key).await) })
            })
            .collect();

        let required = self.codec.data_shards();
        let mut fragments = vec![None; self.codec.total_shards()];
        let mut received = 0;
        while let Some(res) = pending.next().await {
            match res {
                Ok((shard, Ok(Some(fragment)))) => {
                    fragments[shard] = Some(fragment);
                    received += 1;
                }
                Ok((shard, Ok(None))) => debug!(id, shard, "fragment not found"),
                Ok((shard, Err(err))) => {
                    warn!(id, shard, error = format!("{err:#}"), "reading fragment");
                }
                Err(err) => warn!(id, error = %err, "fragment get task failed"),
            }
            if received >= required {
                break;
            }
        }

        let codec = self.codec.clone();
        let payload_len = self.payload_len;
        task::spawn_blocking(move || codec.decode(fragments, payload_len))
            .await
            .context("decoding task")?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use parking_lot::Mutex;
    use rand::RngCore;
    use tokio::sync::Notify;

    use super::*;

    /// In-memory store that can be made to fail or to hang until released.
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        data: Mutex<HashMap<String, Vec<u8>>>,
        pub(crate) fail: bool,
        pub(crate) stall: Option<Arc<Notify>>,
        pub(crate) puts: Mutex<Vec<String>>,
    }

    #[tonic::async_trait]
    impl ShardStore for FlakyStore {
        async fn put(&self, key: String, value: Vec<u8>) -> Result<()> {
            if let Some(stall) = &self.stall {
                stall.notified().await;
            }
            if self.fail {
                return Err(anyhow!("shard is down"));
            }
            self.puts.lock().push(key.clone());
            self.data.lock().insert(key, value);
            Ok(())
        }

        async fn get(&self, key: String) -> Result<Option<Vec<u8>>> {
            if let Some(stall) = &self.stall {
                stall.notified().await;
            }
            if self.fail {
                return Err(anyhow!("shard is down"));
            }
            Ok(self.data.lock().get(&key).cloned())
        }
    }

    fn payload(len: usize) -> Arc<Vec<u8>> {
        let mut p = vec![0u8; len];
        rand::rng().fill_bytes(&mut p);
        Arc::new(p)
    }

    fn storage(stores: &[Arc<FlakyStore>], len: usize) -> ErasureStorage {
        let stores = stores
            .iter()
            .map(|s| s.clone() as Arc<dyn ShardStore>)
            .collect();
        ErasureStorage::new(stores, len).unwrap()
    }

    #[tokio::test]
    async fn test_write_read() {
        let stores: Vec<_> = (0..3).map(|_| Arc::new(FlakyStore::default())).collect();
        let es = storage(&stores, 1000);
        let p = payload(1000);

        let ack = es.write(7, p.clone()).await.unwrap();
        assert!(ack.is_complete());
        assert_eq!(ack.required, 2);
        assert_eq!(es.read(7).await.unwrap(), *p);
    }

    #[tokio::test]
    async fn test_write_does_not_wait_for_straggler() {
        let stall = Arc::new(Notify::new());
        let stores = vec![
            Arc::new(FlakyStore::default()),
            Arc::new(FlakyStore {
                stall: Some(stall.clone()),
                ..Default::default()
            }),
            Arc::new(FlakyStore::default()),
        ];
        let es = storage(&stores, 64);
        let p = payload(64);

        let ack = tokio::time::timeout(Duration::from_secs(5), es.write(1, p.clone()))
            .await
            .expect("write waited for the stalled shard")
            .unwrap();
        assert_eq!(ack.acked, 2);
        assert!(stores[1].puts.lock().is_empty());

        // the straggler still lands once it is released
        stall.notify_one();
        for _ in 0..100 {
            if !stores[1].puts.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*stores[1].puts.lock(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_read_with_failed_shard() {
        let stores: Vec<_> = (0..4).map(|_| Arc::new(FlakyStore::default())).collect();
        let es = storage(&stores, 333);
        let p = payload(333);
        es.write(3, p.clone()).await.unwrap();

        let mut broken = stores.clone();
        broken[0] = Arc::new(FlakyStore {
            fail: true,
            ..Default::default()
        });
        // share the surviving fragments with a fresh adapter
        let es = storage(&broken, 333);
        assert_eq!(es.read(3).await.unwrap(), *p);
    }

    #[tokio::test]
    async fn test_write_with_two_failures_is_incomplete() {
        let stores = vec![
            Arc::new(FlakyStore {
                fail: true,
                ..Default::default()
            }),
            Arc::new(FlakyStore {
                fail: true,
                ..Default::default()
            }),
            Arc::new(FlakyStore::default()),
        ];
        let es = storage(&stores, 10);
        let ack = es.write(5, payload(10)).await.unwrap();
        assert_eq!(ack.acked, 1);
        assert!(!ack.is_complete());
        assert!(es.read(5).await.is_err());
    }

    #[tokio::test]
    async fn test_read_missing_key() {
        let stores: Vec<_> = (0..3).map(|_| Arc::new(FlakyStore::default())).collect();
        let es = storage(&stores, 10);
        assert!(es.read(404).await.is_err());
    }
}
