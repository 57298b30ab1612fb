//! Per-device subnet overrides. A device with no override resolves against
//! the configured default subnet.
use std::{sync::Arc, time::Duration};

use config::{NetworkConfig, Policy, Subnet, SubnetTable};
use tracing::{debug, warn};

use crate::{bounded, decode, encode, Collection, Mac, RegistryError, Storage};

#[derive(Debug)]
pub struct SubnetPolicy<S> {
    store: Arc<S>,
    deadline: Duration,
    subnets: SubnetTable,
    default_policy: Policy,
}

impl<S: Storage> SubnetPolicy<S> {
    pub fn new(store: Arc<S>, deadline: Duration, cfg: &NetworkConfig) -> Self {
        Self {
            store,
            deadline,
            subnets: *cfg.subnets(),
            default_policy: cfg.default_policy(),
        }
    }

    pub fn subnets(&self) -> &SubnetTable {
        &self.subnets
    }

    /// the override for `mac`, if any
    pub async fn policy(&self, mac: &Mac) -> Result<Option<Policy>, RegistryError> {
        let key = mac.to_string();
        bounded(self.deadline, self.store.get(Collection::Policies, &key))
            .await?
            .map(|value| decode(&key, &value))
            .transpose()
    }

    /// override if one exists, otherwise the default subnet
    pub async fn resolve_subnet(&self, mac: &Mac) -> Result<Subnet, RegistryError> {
        let policy = self.policy(mac).await?.unwrap_or(self.default_policy);
        Ok(self.subnets.get(policy))
    }

    pub async fn set_override(&self, mac: &Mac, policy: Policy) -> Result<(), RegistryError> {
        let key = mac.to_string();
        bounded(
            self.deadline,
            self.store
                .put(Collection::Policies, &key, encode(&key, &policy)?),
        )
        .await?;
        debug!(?mac, %policy, "subnet override set");
        Ok(())
    }

    /// returns true if an override was removed
    pub async fn clear_override(&self, mac: &Mac) -> Result<bool, RegistryError> {
        let key = mac.to_string();
        bounded(self.deadline, self.store.delete(Collection::Policies, &key)).await
    }

    /// every override. Records whose key isn't a MAC are skipped
    pub async fn overrides(&self) -> Result<Vec<(Mac, Policy)>, RegistryError> {
        let records = bounded(self.deadline, self.store.select_all(Collection::Policies)).await?;
        let mut overrides = Vec::with_capacity(records.len());
        for (key, value) in records {
            match key.parse::<Mac>() {
                Ok(mac) => overrides.push((mac, decode(&key, &value)?)),
                Err(err) => warn!(?err, "skipping policy record"),
            }
        }
        Ok(overrides)
    }
}
