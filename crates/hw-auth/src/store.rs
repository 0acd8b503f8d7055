use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;

use crate::errors::{Error, Result};

/// Trait for persisting token records between runs
///
/// Records are JSON objects carrying at least an `expiresAt` field. Readers must
/// not assume the expiry is in canonical form; the caches normalize it.
#[async_trait::async_trait]
pub trait TokenPersister: Send + Sync {
    /// Load a record by name. Absence is `Ok(None)`, not an error.
    async fn load(&self, name: &str) -> Result<Option<Value>>;

    /// Save a record by name, replacing any previous one
    async fn save(&self, name: &str, record: &Value) -> Result<()>;

    /// Remove a record by name; removing a missing record succeeds
    async fn clear(&self, name: &str) -> Result<()>;
}

/// Serialize `token` and save it under `name`
pub async fn persist<T: Serialize + Sync>(
    persister: &dyn TokenPersister,
    name: &str,
    token: &T,
) -> Result<()> {
    let record = serde_json::to_value(token)?;
    persister.save(name, &record).await
}

/// In-memory token persister for testing and short-lived processes
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenPersister {
    tokens: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryTokenPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TokenPersister for MemoryTokenPersister {
    async fn load(&self, name: &str) -> Result<Option<Value>> {
        Ok(self
            .tokens
            .read()
            .map_err(|_| Error::InvalidResponse("Lock poisoned".to_string()))?
            .get(name)
            .cloned())
    }

    async fn save(&self, name: &str, record: &Value) -> Result<()> {
        self.tokens
            .write()
            .map_err(|_| Error::InvalidResponse("Lock poisoned".to_string()))?
            .insert(name.to_string(), record.clone());
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<()> {
        self.tokens
            .write()
            .map_err(|_| Error::InvalidResponse("Lock poisoned".to_string()))?
            .remove(name);
        Ok(())
    }
}
