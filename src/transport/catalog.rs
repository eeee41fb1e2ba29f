use std::any::Any;

use dashmap::mapref::one::MappedRef;
use dashmap::DashMap;
use thiserror::Error;

pub type AnyConfig = Box<dyn Any + Send + Sync>;
pub type ConfigRef<'a, T> = MappedRef<'a, String, AnyConfig, T>;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Fail to downcast to a concrete type")]
    Downcast,
    #[error("Entry not found")]
    NotFound,
}

/// Shared registry of transport-specific settings and injected collaborators
/// (e.g. the collective-network transport), keyed by name. Transporters look
/// their entries up during setup; the API layer populates it before init.
pub struct TransportCatalog {
    entries: DashMap<String, AnyConfig>,
}

impl TransportCatalog {
    pub fn new() -> Self {
        TransportCatalog {
            entries: DashMap::new(),
        }
    }

    pub fn register<T>(&self, name: impl Into<String>, config: T)
    where
        T: Any + Send + Sync,
    {
        self.entries.insert(name.into(), Box::new(config));
    }

    pub fn remove(&self, name: &str) {
        self.entries.remove(name);
    }

    pub fn get<T>(&self, name: &str) -> Result<ConfigRef<T>, CatalogError>
    where
        T: Any + Send + Sync,
    {
        match self.entries.get(name) {
            Some(entry) => entry
                .try_map(|x| x.downcast_ref::<T>())
                .map_err(|_| CatalogError::Downcast),
            None => Err(CatalogError::NotFound),
        }
    }
}

impl Default for TransportCatalog {
    fn default() -> Self {
        Self::new()
    }
}
