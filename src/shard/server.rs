use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::api::shard::{
    shard_store_server, GetRequest, GetResponse, PutRequest, PutResponse,
};

/// Shard store keeping fragments in memory, served over gRPC by `shardd`.
#[derive(Default, Clone)]
pub struct MemoryShardStore {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }
}

#[tonic::async_trait]
impl super::ShardStore for MemoryShardStore {
    async fn put(&self, key: String, value: Vec<u8>) -> Result<()> {
        self.data.write().await.insert(key, value);
        Ok(())
    }

    async fn get(&self, key: String) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().await.get(&key).cloned())
    }
}

#[tonic::async_trait]
impl shard_store_server::ShardStore for MemoryShardStore {
    async fn put(&self, req: Request<PutRequest>) -> Result<Response<PutResponse>, Status> {
        let req = req.into_inner();
        debug!(key = req.key, len = req.value.len(), "put");
        self.data.write().await.insert(req.key, req.value);
        Ok(Response::new(PutResponse {}))
    }

    async fn get(&self, req: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let key = req.into_inner().key;
        match self.data.read().await.get(&key) {
            Some(v) => Ok(Response::new(GetResponse { value: v.clone() })),
            None => Err(Status::not_found("key not found")),
        }
    }
}
