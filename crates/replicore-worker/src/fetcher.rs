//! Replica file delivery from peer workers.
//!
//! The actual bulk transport is a collaborator contracted by this interface.
//! Two implementations exist: an HTTP fetcher pulling files from the peer's
//! loader endpoint, and a local fetcher copying between data folders on a
//! shared filesystem (also the test double).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use replicore_shared::config::ReplicoreConfig;
use replicore_shared::errors::{ReplicaError, ReplicaResult};

/// File delivery endpoint of one peer worker
#[derive(Debug, Clone)]
struct PeerEndpoint {
    host: String,
    loader_port: u16,
    data_dir: PathBuf,
}

/// Enum-dispatched replica file transport
#[derive(Debug)]
pub enum ReplicaFetcher {
    Local(LocalReplicaFetcher),
    Http(HttpReplicaFetcher),
}

impl ReplicaFetcher {
    /// Build the HTTP fetcher over the configured worker fleet, excluding
    /// this worker itself
    pub fn from_config(config: &ReplicoreConfig, own_name: &str) -> ReplicaResult<Self> {
        let peers = peer_map(config, own_name);
        Ok(ReplicaFetcher::Http(HttpReplicaFetcher {
            client: reqwest::Client::new(),
            peers,
        }))
    }

    /// Build the shared-filesystem fetcher (tests, single-host deployments)
    pub fn local(config: &ReplicoreConfig, own_name: &str) -> Self {
        ReplicaFetcher::Local(LocalReplicaFetcher {
            peers: peer_map(config, own_name),
        })
    }

    /// Copy one file of `(database, chunk)` from a peer worker into `dest`
    pub async fn fetch_file(
        &self,
        source_worker: &str,
        database: &str,
        file_name: &str,
        dest: &Path,
    ) -> ReplicaResult<u64> {
        match self {
            ReplicaFetcher::Local(f) => f.fetch_file(source_worker, database, file_name, dest).await,
            ReplicaFetcher::Http(f) => f.fetch_file(source_worker, database, file_name, dest).await,
        }
    }
}

fn peer_map(config: &ReplicoreConfig, own_name: &str) -> HashMap<String, PeerEndpoint> {
    config
        .workers
        .iter()
        .filter(|w| w.name != own_name)
        .map(|w| {
            (
                w.name.clone(),
                PeerEndpoint {
                    host: w.host.clone(),
                    loader_port: w.loader_port,
                    data_dir: w.data_dir.clone(),
                },
            )
        })
        .collect()
}

/// Copies replica files between data folders on a shared filesystem
#[derive(Debug)]
pub struct LocalReplicaFetcher {
    peers: HashMap<String, PeerEndpoint>,
}

impl LocalReplicaFetcher {
    async fn fetch_file(
        &self,
        source_worker: &str,
        database: &str,
        file_name: &str,
        dest: &Path,
    ) -> ReplicaResult<u64> {
        let peer = self.peers.get(source_worker).ok_or_else(|| {
            ReplicaError::not_found(format!("unknown source worker '{source_worker}'"))
        })?;
        let source = peer.data_dir.join(database).join(file_name);
        tokio::fs::copy(&source, dest).await.map_err(|e| {
            ReplicaError::transport(format!(
                "copy of '{}' from worker '{source_worker}' failed: {e}",
                source.display()
            ))
        })
    }
}

/// Pulls replica files from the peer worker's loader endpoint
#[derive(Debug)]
pub struct HttpReplicaFetcher {
    client: reqwest::Client,
    peers: HashMap<String, PeerEndpoint>,
}

impl HttpReplicaFetcher {
    async fn fetch_file(
        &self,
        source_worker: &str,
        database: &str,
        file_name: &str,
        dest: &Path,
    ) -> ReplicaResult<u64> {
        let peer = self.peers.get(source_worker).ok_or_else(|| {
            ReplicaError::not_found(format!("unknown source worker '{source_worker}'"))
        })?;
        let url = format!(
            "http://{}:{}/replica/file/{database}/{file_name}",
            peer.host, peer.loader_port
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ReplicaError::transport(format!("GET {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ReplicaError::transport(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(bytes) = stream.next().await {
            let bytes =
                bytes.map_err(|e| ReplicaError::transport(format!("read of {url} failed: {e}")))?;
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}
