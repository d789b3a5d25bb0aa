//! etcd v3 backend for [`CoordinationClient`].

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tracing::warn;

use super::coordination::{CoordinationClient, KeyValue, LeaseId, WatchEvent, WatchMode, WatchStream};
use super::error::CoordinationError;

/// Coordination client talking to an etcd cluster.
#[derive(Clone)]
pub struct EtcdCoordination {
    client: Client,
}

impl EtcdCoordination {
    pub async fn connect(endpoints: &[String], timeout: Duration) -> Result<Self, CoordinationError> {
        let options = ConnectOptions::new().with_connect_timeout(timeout);
        let client = Client::connect(endpoints, Some(options)).await?;
        Ok(Self { client })
    }

    fn put_options(lease: Option<LeaseId>) -> Option<PutOptions> {
        lease.map(|id| PutOptions::new().with_lease(id))
    }
}

fn key_value(kv: &etcd_client::KeyValue) -> Result<KeyValue, CoordinationError> {
    Ok(KeyValue {
        key: kv.key_str()?.to_string(),
        value: kv.value_str()?.to_string(),
    })
}

#[async_trait]
impl CoordinationClient for EtcdCoordination {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, CoordinationError> {
        let ttl = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let response = self.client.clone().lease_grant(ttl, None).await?;
        Ok(response.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        let (mut keeper, mut responses) = self.client.clone().lease_keep_alive(lease).await?;
        keeper.keep_alive().await?;
        match responses.message().await? {
            Some(response) if response.ttl() > 0 => Ok(()),
            _ => Err(CoordinationError::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        self.client.clone().lease_revoke(lease).await?;
        Ok(())
    }

    async fn create(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<bool, CoordinationError> {
        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key, value, Self::put_options(lease))]);
        let response = self.client.clone().txn(txn).await?;
        Ok(response.succeeded())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), CoordinationError> {
        self.client.clone().put(key, value, Self::put_options(lease)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        let response = self.client.clone().get(key, None).await?;
        match response.kvs().first() {
            Some(kv) => Ok(Some(kv.value_str()?.to_string())),
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, CoordinationError> {
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(etcd_client::SortTarget::Key, etcd_client::SortOrder::Ascend);
        let response = self.client.clone().get(prefix, Some(options)).await?;
        response.kvs().iter().map(key_value).collect()
    }

    async fn delete(&self, key: &str) -> Result<bool, CoordinationError> {
        let response = self.client.clone().delete(key, None).await?;
        Ok(response.deleted() > 0)
    }

    async fn watch(&self, key: &str, mode: WatchMode) -> Result<WatchStream, CoordinationError> {
        let options = match mode {
            WatchMode::Key => None,
            WatchMode::Prefix => Some(WatchOptions::new().with_prefix()),
        };
        let (watcher, mut stream) = self.client.clone().watch(key, options).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let watched = key.to_string();
        tokio::spawn(async move {
            // The watcher cancels the server-side watch when dropped.
            let _watcher = watcher;
            loop {
                let response = match stream.message().await {
                    Ok(Some(response)) => response,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(key = %watched, error = %err, "etcd watch stream failed");
                        break;
                    }
                };
                for event in response.events() {
                    let Some(kv) = event.kv() else {
                        continue;
                    };
                    let Ok(key) = kv.key_str() else {
                        continue;
                    };
                    let change = match event.event_type() {
                        EventType::Put => WatchEvent::Put(KeyValue {
                            key: key.to_string(),
                            value: kv.value_str().unwrap_or_default().to_string(),
                        }),
                        EventType::Delete => WatchEvent::Delete { key: key.to_string() },
                    };
                    if tx.send(change).is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}
