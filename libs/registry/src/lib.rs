//! # registry
//!
//! The only path from the engine to the record store. Devices are resolved
//! by MAC, created lazily from defaults, and updated with patches. Every
//! store call runs under a deadline.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::{future::Future, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

pub mod device;
pub mod memory;
pub mod policy;
pub mod sqlite;
pub mod storage;

pub use crate::{
    device::{Device, DeviceDefaults, DevicePatch, IpType, Mac},
    memory::MemoryStore,
    policy::SubnetPolicy,
    sqlite::SqliteStore,
    storage::{Collection, Storage},
};

/// how many events a slow subscriber may fall behind before it lags
const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("record store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("record store error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("bad record for {key}: {source}")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// outcome of [`DeviceRegistry::get_or_create`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOrCreate {
    Found(Device),
    Created(Device),
}

impl GetOrCreate {
    pub fn is_created(&self) -> bool {
        matches!(self, GetOrCreate::Created(_))
    }

    pub fn device(&self) -> &Device {
        match self {
            GetOrCreate::Found(dev) | GetOrCreate::Created(dev) => dev,
        }
    }

    pub fn into_device(self) -> Device {
        match self {
            GetOrCreate::Found(dev) | GetOrCreate::Created(dev) => dev,
        }
    }
}

/// published to every [`DeviceRegistry::subscribe`]r
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    New(Device),
    Updated { before: Device, after: Device },
}

/// run a store call under `deadline`
pub(crate) async fn bounded<T, E, F>(deadline: Duration, fut: F) -> Result<T, RegistryError>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res.map_err(|err| RegistryError::Storage(Box::new(err))),
        Err(_) => Err(RegistryError::Timeout(deadline)),
    }
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(key: &str, value: &str) -> Result<T, RegistryError> {
    serde_json::from_str(value).map_err(|source| RegistryError::Serde {
        key: key.to_owned(),
        source,
    })
}

pub(crate) fn encode<T: serde::Serialize>(key: &str, value: &T) -> Result<String, RegistryError> {
    serde_json::to_string(value).map_err(|source| RegistryError::Serde {
        key: key.to_owned(),
        source,
    })
}

#[derive(Debug)]
pub struct DeviceRegistry<S> {
    store: Arc<S>,
    deadline: Duration,
    events: broadcast::Sender<DeviceEvent>,
}

impl<S: Storage> DeviceRegistry<S> {
    pub fn new(store: Arc<S>, deadline: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            deadline,
            events,
        }
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// deadline applied to every store call
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// device events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: DeviceEvent) {
        // no subscribers is fine
        if self.events.send(event).is_err() {
            trace!("no device event subscribers");
        }
    }

    pub async fn get(&self, mac: &Mac) -> Result<Option<Device>, RegistryError> {
        let key = mac.to_string();
        bounded(self.deadline, self.store.get(Collection::Devices, &key))
            .await?
            .map(|value| decode(&key, &value))
            .transpose()
    }

    /// every persisted device
    pub async fn all(&self) -> Result<Vec<Device>, RegistryError> {
        bounded(self.deadline, self.store.select_all(Collection::Devices))
            .await?
            .iter()
            .map(|(key, value)| decode(key, value))
            .collect()
    }

    /// resolve `mac`, creating it from `defaults` when unseen
    pub async fn get_or_create(
        &self,
        mac: &Mac,
        defaults: DeviceDefaults,
    ) -> Result<GetOrCreate, RegistryError> {
        let key = mac.to_string();
        let device = defaults.into_device(*mac);
        let value = encode(&key, &device)?;
        let (stored, inserted) = bounded(
            self.deadline,
            self.store.get_or_insert(Collection::Devices, &key, value),
        )
        .await?;
        if inserted {
            debug!(?mac, ip_type = ?device.ip_type, "new device");
            self.publish(DeviceEvent::New(device.clone()));
            Ok(GetOrCreate::Created(device))
        } else {
            Ok(GetOrCreate::Found(decode(&key, &stored)?))
        }
    }

    /// apply `patch` to the stored record for `device`. The write completes
    /// before this returns, and nothing is written or published when the
    /// patch changes nothing.
    pub async fn update(&self, device: &Device, patch: DevicePatch) -> Result<Device, RegistryError> {
        let before = self.get(&device.mac).await?.unwrap_or_else(|| device.clone());
        let after = patch.apply(before.clone());
        if after == before {
            return Ok(after);
        }
        let key = after.mac.to_string();
        bounded(
            self.deadline,
            self.store
                .put(Collection::Devices, &key, encode(&key, &after)?),
        )
        .await?;
        trace!(mac = ?after.mac, ?before, ?after, "device updated");
        self.publish(DeviceEvent::Updated {
            before,
            after: after.clone(),
        });
        Ok(after)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{convert::Infallible, net::Ipv4Addr};

    use async_trait::async_trait;
    use config::Subnet;

    use super::*;

    pub(crate) fn subnet() -> Subnet {
        Subnet::new(
            [255, 255, 255, 0].into(),
            [192, 168, 1, 2].into(),
            [192, 168, 1, 1].into(),
            [192, 168, 1, 2].into(),
        )
        .unwrap()
    }

    fn registry() -> DeviceRegistry<MemoryStore> {
        DeviceRegistry::new(Arc::new(MemoryStore::new()), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_get_or_create_branches() -> Result<(), RegistryError> {
        let reg = registry();
        let mut events = reg.subscribe();
        let mac: Mac = "AA:BB:CC:DD:EE:01".parse().unwrap();

        let first = reg
            .get_or_create(
                &mac,
                DeviceDefaults::dynamic(subnet()).hostname(Some("phone".into())),
            )
            .await?;
        assert!(first.is_created());
        assert_eq!(first.device().hostname.as_deref(), Some("phone"));
        assert_eq!(events.try_recv().ok(), Some(DeviceEvent::New(first.device().clone())));

        let second = reg
            .get_or_create(&mac, DeviceDefaults::dynamic(subnet()))
            .await?;
        assert!(!second.is_created());
        assert_eq!(second.device(), first.device());
        // found devices are not announced
        assert!(events.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_only_publishes_changes() -> Result<(), RegistryError> {
        let reg = registry();
        let mac: Mac = "AA:BB:CC:DD:EE:02".parse().unwrap();
        let dev = reg
            .get_or_create(&mac, DeviceDefaults::dynamic(subnet()))
            .await?
            .into_device();
        let mut events = reg.subscribe();

        let ip = Ipv4Addr::new(192, 168, 1, 3);
        let after = reg.update(&dev, DevicePatch::new().ip(Some(ip))).await?;
        assert_eq!(after.ip, Some(ip));
        assert_eq!(reg.get(&mac).await?.and_then(|d| d.ip), Some(ip));
        assert!(matches!(
            events.try_recv(),
            Ok(DeviceEvent::Updated { before, after }) if before.ip.is_none() && after.ip == Some(ip)
        ));

        // same value again, no event
        reg.update(&after, DevicePatch::new().ip(Some(ip))).await?;
        assert!(events.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_merges_with_stored_record() -> Result<(), RegistryError> {
        let reg = registry();
        let mac: Mac = "AA:BB:CC:DD:EE:03".parse().unwrap();
        let stale_copy = reg
            .get_or_create(&mac, DeviceDefaults::dynamic(subnet()))
            .await?
            .into_device();
        reg.update(&stale_copy, DevicePatch::new().hostname(Some("tv".into())))
            .await?;
        // patching an old copy keeps the hostname written in between
        let after = reg
            .update(&stale_copy, DevicePatch::new().pending(true))
            .await?;
        assert_eq!(after.hostname.as_deref(), Some("tv"));
        assert!(after.pending_changes);
        assert_eq!(reg.all().await?.len(), 1);
        Ok(())
    }

    /// never answers
    #[derive(Debug)]
    struct Hung;

    #[async_trait]
    impl Storage for Hung {
        type Error = Infallible;
        async fn get(&self, _: Collection, _: &str) -> Result<Option<String>, Infallible> {
            futures_pending().await
        }
        async fn get_or_insert(
            &self,
            _: Collection,
            _: &str,
            _: String,
        ) -> Result<(String, bool), Infallible> {
            futures_pending().await
        }
        async fn put(&self, _: Collection, _: &str, _: String) -> Result<(), Infallible> {
            futures_pending().await
        }
        async fn delete(&self, _: Collection, _: &str) -> Result<bool, Infallible> {
            futures_pending().await
        }
        async fn select_all(&self, _: Collection) -> Result<Vec<(String, String)>, Infallible> {
            futures_pending().await
        }
    }

    async fn futures_pending<T>() -> T {
        std::future::pending().await
    }

    #[tokio::test]
    async fn test_deadline() {
        let reg = DeviceRegistry::new(Arc::new(Hung), Duration::from_millis(20));
        let mac: Mac = "AA:BB:CC:DD:EE:04".parse().unwrap();
        let err = reg
            .get_or_create(&mac, DeviceDefaults::dynamic(subnet()))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_corrupt_record() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(Collection::Devices, "AA:BB:CC:DD:EE:05", "{not json".into())
            .await
            .unwrap();
        let reg = DeviceRegistry::new(store, Duration::from_secs(1));
        let err = reg.all().await.unwrap_err();
        assert!(matches!(err, RegistryError::Serde { key, .. } if key == "AA:BB:CC:DD:EE:05"));
    }
}
