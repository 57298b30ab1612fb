use std::{collections::BTreeMap, convert::Infallible};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::storage::{Collection, Storage};

/// keeps records in memory, nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<(Collection, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    type Error = Infallible;

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<String>, Self::Error> {
        Ok(self
            .records
            .lock()
            .get(&(collection, key.to_owned()))
            .cloned())
    }

    async fn get_or_insert(
        &self,
        collection: Collection,
        key: &str,
        value: String,
    ) -> Result<(String, bool), Self::Error> {
        let mut records = self.records.lock();
        match records.get(&(collection, key.to_owned())) {
            Some(existing) => Ok((existing.clone(), false)),
            None => {
                records.insert((collection, key.to_owned()), value.clone());
                Ok((value, true))
            }
        }
    }

    async fn put(
        &self,
        collection: Collection,
        key: &str,
        value: String,
    ) -> Result<(), Self::Error> {
        self.records.lock().insert((collection, key.to_owned()), value);
        Ok(())
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, Self::Error> {
        Ok(self
            .records
            .lock()
            .remove(&(collection, key.to_owned()))
            .is_some())
    }

    async fn select_all(&self, collection: Collection) -> Result<Vec<(String, String)>, Self::Error> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|((c, _), _)| *c == collection)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }
}
