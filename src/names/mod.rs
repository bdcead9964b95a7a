use std::collections::HashMap;

use alloy::primitives::Address;
use sqlx::{PgPool, SqlitePool};

use crate::db::{local, repository};

/// Address -> display-name mapping, loaded entirely into memory at startup.
///
/// Local `ens` entries take precedence over exchange labels from the shared
/// store. Read-only for the process lifetime.
pub struct NameStore {
    names: HashMap<Address, String>,
}

impl NameStore {
    pub async fn load(local_db: &SqlitePool, shared: &PgPool) -> eyre::Result<Self> {
        let mut names = HashMap::new();
        for (address, name) in repository::load_cex_names(shared).await? {
            if let Ok(address) = address.parse::<Address>() {
                names.insert(address, name);
            }
        }
        for (address, name) in local::load_names(local_db).await? {
            if let Ok(address) = address.parse::<Address>() {
                names.insert(address, name);
            }
        }
        tracing::info!(names = names.len(), "Loaded address name store");
        Ok(Self { names })
    }

    pub fn get(&self, address: &Address) -> Option<&str> {
        self.names.get(address).map(|s| s.as_str())
    }

    /// Display name, falling back to the checksum-cased address.
    pub fn display(&self, address: &Address) -> String {
        match self.names.get(address) {
            Some(name) => name.clone(),
            None => address.to_checksum(None),
        }
    }

    #[cfg(test)]
    pub fn from_entries(entries: Vec<(Address, String)>) -> Self {
        Self {
            names: entries.into_iter().collect(),
        }
    }

    #[cfg(test)]
    pub fn empty() -> Self {
        Self {
            names: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn test_display_falls_back_to_checksum() {
        let store = NameStore::empty();
        let addr = address!("d8da6bf26964af9d7eed9e03e53415d37aa96045");
        assert_eq!(
            store.display(&addr),
            "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045"
        );
    }

    #[test]
    fn test_display_prefers_known_name() {
        let addr = address!("d8da6bf26964af9d7eed9e03e53415d37aa96045");
        let store = NameStore::from_entries(vec![(addr, "vitalik.eth".to_string())]);
        assert_eq!(store.display(&addr), "vitalik.eth");
    }
}
