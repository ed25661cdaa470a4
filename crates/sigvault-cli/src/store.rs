//! sled-backed vault records

use std::path::Path;

use sigvault::{Error, Result, VaultStore};

const TREE: &str = "vaults";

/// one sled tree, keyed by account id
pub struct SledVaultStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledVaultStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        let tree = db.open_tree(TREE).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self { db, tree })
    }

    pub fn accounts(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for key in self.tree.iter().keys() {
            let key = key.map_err(|e| Error::Storage(e.to_string()))?;
            out.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(out)
    }
}

impl VaultStore for SledVaultStore {
    fn put(&self, account: &str, record: &[u8]) -> Result<()> {
        self.tree
            .insert(account.as_bytes(), record)
            .map_err(|e| Error::Storage(e.to_string()))?;
        // records are rewritten on password change, don't lose one to a crash
        self.db.flush().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    fn get(&self, account: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tree
            .get(account.as_bytes())
            .map_err(|e| Error::Storage(e.to_string()))?
            .map(|v| v.to_vec()))
    }

    fn delete(&self, account: &str) -> Result<bool> {
        let removed = self
            .tree
            .remove(account.as_bytes())
            .map_err(|e| Error::Storage(e.to_string()))?
            .is_some();
        self.db.flush().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(removed)
    }
}
