use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use registry::{Collection, DeviceDefaults, MemoryStore};
use tracing_test::traced_test;

use super::*;

const LEASE: Duration = Duration::from_secs(86_400);

fn ungated() -> Subnet {
    Subnet::new(
        [255, 255, 255, 0].into(),
        [192, 168, 1, 2].into(),
        [192, 168, 1, 1].into(),
        [192, 168, 1, 2].into(),
    )
    .unwrap()
}

fn gated() -> Subnet {
    ungated().with_router([192, 168, 1, 2].into())
}

fn mac(last: u8) -> Mac {
    Mac::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
}

struct Fixture<S> {
    registry: Arc<DeviceRegistry<S>>,
    alloc: Allocator<S>,
}

fn fixture(pool: Pool) -> Fixture<MemoryStore> {
    fixture_with(MemoryStore::new(), pool)
}

fn fixture_with<S: Storage>(store: S, pool: Pool) -> Fixture<S> {
    let registry = Arc::new(DeviceRegistry::new(
        Arc::new(store),
        Duration::from_secs(1),
    ));
    Fixture {
        alloc: Allocator::new(
            Arc::clone(&registry),
            &SubnetTable::new(ungated(), gated()),
            pool,
            LEASE,
        ),
        registry,
    }
}

impl<S: Storage> Fixture<S> {
    async fn dynamic(&self, last: u8) -> Device {
        self.registry
            .get_or_create(&mac(last), DeviceDefaults::dynamic(ungated()))
            .await
            .unwrap()
            .into_device()
    }

    async fn infrastructure(&self, last: u8, ip: [u8; 4]) -> Device {
        self.registry
            .get_or_create(
                &mac(last),
                DeviceDefaults::infrastructure(ip.into(), ungated()),
            )
            .await
            .unwrap()
            .into_device()
    }

    async fn stored(&self, last: u8) -> Device {
        self.registry.get(&mac(last)).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn test_assign_skips_infrastructure() -> Result<(), IpError> {
    let f = fixture(Pool::default());
    let router = f.infrastructure(0x01, [192, 168, 1, 1]).await;
    let server = f.infrastructure(0x02, [192, 168, 1, 2]).await;
    assert_eq!(f.alloc.load(vec![router, server]).await?, 2);

    let a = f.dynamic(0x10).await;
    let (ip, a) = f.alloc.assign(&a).await?;
    assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 3));
    assert_eq!(a.ip, Some(ip));
    assert_eq!(f.stored(0x10).await.ip, Some(ip));

    let b = f.dynamic(0x11).await;
    let (ip, _) = f.alloc.assign(&b).await?;
    assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 4));
    Ok(())
}

#[tokio::test]
async fn test_infrastructure_addresses_never_assigned() -> Result<(), IpError> {
    // nothing pinned, router and server still stay out of the pool
    let f = fixture(Pool::default());
    let a = f.dynamic(0x10).await;
    let (ip, _) = f.alloc.assign(&a).await?;
    assert_ne!(ip, ungated().router_ip());
    assert_ne!(ip, ungated().dhcp_server_ip());
    assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 3));

    // a gated device shares the table and must not get the real router either
    let gated_dev = f
        .registry
        .get_or_create(&mac(0x11), DeviceDefaults::dynamic(gated()))
        .await?
        .into_device();
    let (ip, _) = f.alloc.assign(&gated_dev).await?;
    assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 4));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assigns_are_unique() -> Result<(), IpError> {
    let f = Arc::new(fixture(Pool { start: 3, end: 60 }));
    let mut devices = Vec::new();
    for last in 0..30 {
        devices.push(f.dynamic(last).await);
    }
    let handles = devices
        .into_iter()
        .map(|dev| {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f.alloc.assign(&dev).await.map(|(ip, _)| ip) })
        })
        .collect::<Vec<_>>();

    let mut seen = std::collections::HashSet::new();
    for handle in handles {
        let ip = handle.await.expect("assign task panicked")?;
        assert!(seen.insert(ip), "{ip} handed out twice");
    }
    assert_eq!(seen.len(), 30);
    assert_eq!(f.alloc.leased(&ungated()).await.len(), 30);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_orphaned_entries_released() -> Result<(), IpError> {
    let f = fixture(Pool { start: 3, end: 3 });
    let a = f.dynamic(0x0a).await;
    let (ip, a) = f.alloc.assign(&a).await?;
    // record says it no longer holds the address, though seen just now
    f.registry
        .update(&a, DevicePatch::new().ip(None).last_seen(Utc::now()))
        .await?;

    let b = f.dynamic(0x0b).await;
    let (b_ip, _) = f.alloc.assign(&b).await?;
    assert_eq!(b_ip, ip);
    assert_eq!(f.alloc.holder(&ungated(), ip).await, Some(mac(0x0b)));
    assert!(logs_contain("released orphaned table entry"));

    // record deleted from the store altogether
    f.registry
        .store()
        .delete(Collection::Devices, &mac(0x0b).to_string())
        .await
        .unwrap();
    let c = f.dynamic(0x0c).await;
    let (c_ip, _) = f.alloc.assign(&c).await?;
    assert_eq!(c_ip, ip);
    assert_eq!(f.alloc.holder(&ungated(), ip).await, Some(mac(0x0c)));
    Ok(())
}

#[tokio::test]
async fn test_assign_is_idempotent() -> Result<(), IpError> {
    let f = fixture(Pool::default());
    let dev = f.dynamic(0x10).await;
    let (first, dev) = f.alloc.assign(&dev).await?;
    let (second, _) = f.alloc.assign(&dev).await?;
    assert_eq!(first, second);
    assert_eq!(f.alloc.leased(&ungated()).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_no_duplicate_addresses() -> Result<(), IpError> {
    let f = fixture(Pool { start: 10, end: 40 });
    let mut seen = std::collections::HashSet::new();
    for last in 0..31 {
        let dev = f.dynamic(last).await;
        let (ip, _) = f.alloc.assign(&dev).await?;
        assert!(seen.insert(ip), "{ip} handed out twice");
    }
    // gated devices share the prefix and so the table
    let gated_dev = f
        .registry
        .get_or_create(&mac(0xf0), DeviceDefaults::dynamic(gated()))
        .await?
        .into_device();
    // every address is held by a device that has never been seen, so the
    // oldest is reclaimed rather than doubled up
    let (ip, _) = f.alloc.assign(&gated_dev).await?;
    assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 10));
    assert_eq!(f.stored(0).await.ip, None);
    let devices = f.registry.all().await?;
    let addressed = devices.iter().filter_map(|d| d.ip).collect::<Vec<_>>();
    let unique = addressed
        .iter()
        .collect::<std::collections::HashSet<_>>();
    assert_eq!(addressed.len(), unique.len());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_reclaims_stale_lease() -> Result<(), IpError> {
    let f = fixture(Pool { start: 3, end: 3 });
    let a = f.dynamic(0x0a).await;
    let (ip, a) = f.alloc.assign(&a).await?;
    f.registry
        .update(
            &a,
            DevicePatch::new().last_seen(Utc::now() - chrono::Duration::hours(48)),
        )
        .await?;

    let reclaimed_before = RECLAIMED_ADDRS_COUNT.get();
    let b = f.dynamic(0x0b).await;
    let (b_ip, _) = f.alloc.assign(&b).await?;
    assert_eq!(b_ip, ip);
    assert_eq!(f.stored(0x0a).await.ip, None);
    assert_eq!(f.alloc.holder(&ungated(), ip).await, Some(mac(0x0b)));
    assert!(RECLAIMED_ADDRS_COUNT.get() > reclaimed_before);
    assert!(logs_contain("reclaimed stale lease"));
    Ok(())
}

#[tokio::test]
async fn test_reclaims_least_recently_seen() -> Result<(), IpError> {
    let f = fixture(Pool { start: 3, end: 4 });
    let older = f.dynamic(0x0a).await;
    let (older_ip, older) = f.alloc.assign(&older).await?;
    let newer = f.dynamic(0x0b).await;
    let (_, newer) = f.alloc.assign(&newer).await?;
    f.registry
        .update(
            &older,
            DevicePatch::new().last_seen(Utc::now() - chrono::Duration::hours(72)),
        )
        .await?;
    f.registry
        .update(
            &newer,
            DevicePatch::new().last_seen(Utc::now() - chrono::Duration::hours(30)),
        )
        .await?;

    let c = f.dynamic(0x0c).await;
    let (ip, _) = f.alloc.assign(&c).await?;
    assert_eq!(ip, older_ip);
    assert!(f.stored(0x0b).await.ip.is_some());
    Ok(())
}

#[tokio::test]
async fn test_exhausted_when_nobody_is_stale() -> Result<(), IpError> {
    let f = fixture(Pool { start: 3, end: 3 });
    let a = f.dynamic(0x0a).await;
    let (ip, a) = f.alloc.assign(&a).await?;
    f.registry
        .update(&a, DevicePatch::new().last_seen(Utc::now()))
        .await?;

    let b = f.dynamic(0x0b).await;
    let err = f.alloc.assign(&b).await.unwrap_err();
    assert!(matches!(err, IpError::PoolExhausted { .. }));
    assert_eq!(f.stored(0x0a).await.ip, Some(ip));
    assert_eq!(f.stored(0x0b).await.ip, None);
    Ok(())
}

#[tokio::test]
async fn test_static_devices_are_refused() -> Result<(), IpError> {
    let f = fixture(Pool::default());
    let router = f.infrastructure(0x01, [192, 168, 1, 1]).await;
    assert!(matches!(
        f.alloc.assign(&router).await,
        Err(IpError::Configuration(ConfigurationError::StaticDevice(m))) if m == mac(0x01)
    ));
    assert!(matches!(
        f.alloc.relocate(&router, gated()).await,
        Err(IpError::Configuration(ConfigurationError::StaticDevice(_)))
    ));
    let stored = f.stored(0x01).await;
    assert_eq!(stored.ip, Some(Ipv4Addr::new(192, 168, 1, 1)));
    assert_eq!(stored.subnet, ungated());
    Ok(())
}

#[tokio::test]
async fn test_claim_conflict() -> Result<(), IpError> {
    let f = fixture(Pool::default());
    let a = f.dynamic(0x0a).await;
    let b = f.dynamic(0x0b).await;
    let ip = Ipv4Addr::new(192, 168, 1, 50);
    f.alloc.claim(ip, &a).await?;
    // claiming your own address again is fine
    f.alloc.claim(ip, &a).await?;
    assert!(matches!(
        f.alloc.claim(ip, &b).await,
        Err(IpError::Configuration(ConfigurationError::AddressConflict { held_by, .. })) if held_by == mac(0x0a)
    ));
    assert!(matches!(
        f.alloc.claim([10, 0, 0, 1].into(), &b).await,
        Err(IpError::Configuration(ConfigurationError::OutsideNetwork { .. }))
    ));
    assert_eq!(f.alloc.release(&ungated(), ip).await, Some(mac(0x0a)));
    f.alloc.claim(ip, &b).await?;
    Ok(())
}

#[tokio::test]
async fn test_load_conflicts() -> Result<(), IpError> {
    let f = fixture(Pool::default());
    let router = f.infrastructure(0x01, [192, 168, 1, 1]).await;
    let squatter = f.dynamic(0x20).await;
    let squatter = f
        .registry
        .update(&squatter, DevicePatch::new().ip(Some([192, 168, 1, 1].into())))
        .await?;

    // dynamic listed first, statics still win
    assert_eq!(f.alloc.load(vec![squatter, router]).await?, 1);
    assert_eq!(f.stored(0x20).await.ip, None);
    assert_eq!(
        f.alloc.holder(&ungated(), [192, 168, 1, 1].into()).await,
        Some(mac(0x01))
    );

    let other = fixture(Pool::default());
    let r1 = other.infrastructure(0x01, [192, 168, 1, 1]).await;
    let r2 = other.infrastructure(0x02, [192, 168, 1, 1]).await;
    assert!(matches!(
        other.alloc.load(vec![r1, r2]).await,
        Err(IpError::Configuration(ConfigurationError::AddressConflict { .. }))
    ));
    Ok(())
}

#[tokio::test]
async fn test_relocate_releases_address() -> Result<(), IpError> {
    let f = fixture(Pool::default());
    let dev = f.dynamic(0x0a).await;
    let (ip, dev) = f.alloc.assign(&dev).await?;

    let moved = f.alloc.relocate(&dev, gated()).await?;
    assert_eq!(moved.ip, None);
    assert_eq!(moved.subnet, gated());
    assert!(moved.pending_changes);
    assert_eq!(f.alloc.holder(&ungated(), ip).await, None);

    let (new_ip, moved) = f.alloc.assign(&moved).await?;
    assert_eq!(moved.subnet, gated());
    assert_eq!(moved.ip, Some(new_ip));
    Ok(())
}

/// memory store whose writes can be switched off
#[derive(Debug, Default)]
struct Flaky {
    inner: MemoryStore,
    offline: AtomicBool,
}

#[derive(Error, Debug)]
#[error("store offline")]
struct Offline;

#[async_trait]
impl Storage for Flaky {
    type Error = Offline;

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<String>, Offline> {
        Ok(self.inner.get(collection, key).await.unwrap())
    }
    async fn get_or_insert(
        &self,
        collection: Collection,
        key: &str,
        value: String,
    ) -> Result<(String, bool), Offline> {
        Ok(self.inner.get_or_insert(collection, key, value).await.unwrap())
    }
    async fn put(&self, collection: Collection, key: &str, value: String) -> Result<(), Offline> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Offline);
        }
        Ok(self.inner.put(collection, key, value).await.unwrap())
    }
    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, Offline> {
        Ok(self.inner.delete(collection, key).await.unwrap())
    }
    async fn select_all(&self, collection: Collection) -> Result<Vec<(String, String)>, Offline> {
        Ok(self.inner.select_all(collection).await.unwrap())
    }
}

#[tokio::test]
async fn test_failed_persist_rolls_back() -> Result<(), IpError> {
    let f = fixture_with(Flaky::default(), Pool::default());
    let dev = f.dynamic(0x0a).await;

    f.registry.store().offline.store(true, Ordering::SeqCst);
    assert!(matches!(
        f.alloc.assign(&dev).await,
        Err(IpError::Registry(RegistryError::Storage(_)))
    ));
    assert!(f.alloc.leased(&ungated()).await.is_empty());

    f.registry.store().offline.store(false, Ordering::SeqCst);
    let (ip, _) = f.alloc.assign(&dev).await?;
    assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 3));
    Ok(())
}
