//! Bounded peer address pool with pluggable persistence.

use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::Error;
use crate::types::{Authority, NetworkAddress};

/// Address-book persistence. The on-disk format is the storage's own.
pub trait HostStorage: Send + Sync + 'static {
    fn load(&self) -> io::Result<Vec<NetworkAddress>>;
    fn save(&self, addresses: &[NetworkAddress]) -> io::Result<()>;
}

/// No persistence; the pool starts empty and is discarded on stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralStorage;

impl HostStorage for EphemeralStorage {
    fn load(&self) -> io::Result<Vec<NetworkAddress>> {
        Ok(Vec::new())
    }

    fn save(&self, _addresses: &[NetworkAddress]) -> io::Result<()> {
        Ok(())
    }
}

/// Line-per-address text file: `ip:port,services,timestamp`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HostStorage for FileStorage {
    fn load(&self) -> io::Result<Vec<NetworkAddress>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut addresses = Vec::new();
        for line in text.lines() {
            let mut fields = line.trim().split(',');
            let entry = (|| {
                let authority: Authority = fields.next()?.parse().ok()?;
                let services: u64 = fields.next()?.parse().ok()?;
                let timestamp: u64 = fields.next()?.parse().ok()?;
                Some(NetworkAddress {
                    services,
                    ip: authority.ip,
                    port: authority.port,
                    timestamp,
                })
            })();

            match entry {
                Some(address) => addresses.push(address),
                // A malformed line loses one address, not the pool.
                None => warn!(line, "skipping malformed host entry"),
            }
        }
        Ok(addresses)
    }

    fn save(&self, addresses: &[NetworkAddress]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut text = String::new();
        for address in addresses {
            text.push_str(&format!(
                "{},{},{}\n",
                address.authority(),
                address.services,
                address.timestamp
            ));
        }
        std::fs::write(&self.path, text)
    }
}

/// Bounded set of candidate peer addresses.
///
/// Inserts beyond capacity evict a pseudo-random entry; fetch returns a
/// pseudo-random entry. Duplicate insertion (same authority) is a
/// silent no-op.
pub struct Hosts {
    capacity: usize,
    storage: Box<dyn HostStorage>,
    addresses: Mutex<Vec<NetworkAddress>>,
    rng: Mutex<fastrand::Rng>,
}

impl Hosts {
    pub fn new(capacity: usize, storage: impl HostStorage, rng: fastrand::Rng) -> Self {
        Self {
            capacity,
            storage: Box::new(storage),
            addresses: Mutex::new(Vec::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Load the persisted pool. Load failure propagates; the pool stays
    /// usable (empty) regardless.
    pub fn start(&self) -> Result<(), Error> {
        let loaded = self.storage.load().map_err(|e| {
            warn!("failed to load hosts: {e}");
            Error::OperationFailed
        })?;

        let mut addresses = self.addresses.lock().expect("hosts poisoned");
        addresses.clear();
        for address in loaded {
            if addresses.len() == self.capacity {
                break;
            }
            if Self::admissible(&address)
                && !addresses
                    .iter()
                    .any(|existing| existing.authority() == address.authority())
            {
                addresses.push(address);
            }
        }
        debug!(count = addresses.len(), "loaded host pool");
        Ok(())
    }

    /// Persist the pool.
    pub fn stop(&self) -> Result<(), Error> {
        let addresses = self.addresses.lock().expect("hosts poisoned");
        self.storage.save(&addresses).map_err(|e| {
            warn!("failed to save hosts: {e}");
            Error::OperationFailed
        })
    }

    pub fn count(&self) -> usize {
        self.addresses.lock().expect("hosts poisoned").len()
    }

    /// A pseudo-random pool entry.
    pub fn fetch(&self) -> Result<NetworkAddress, Error> {
        let addresses = self.addresses.lock().expect("hosts poisoned");
        if addresses.is_empty() {
            return Err(Error::NotFound);
        }
        let index = self.rng.lock().expect("rng poisoned").usize(..addresses.len());
        Ok(addresses[index])
    }

    /// Admit an address; duplicates and unroutable entries are dropped
    /// silently.
    pub fn store(&self, address: NetworkAddress) {
        if self.capacity == 0 || !Self::admissible(&address) {
            return;
        }

        let mut addresses = self.addresses.lock().expect("hosts poisoned");
        if addresses
            .iter()
            .any(|existing| existing.authority() == address.authority())
        {
            return;
        }

        if addresses.len() == self.capacity {
            let index = self.rng.lock().expect("rng poisoned").usize(..addresses.len());
            addresses.swap_remove(index);
        }
        addresses.push(address);
    }

    pub fn store_many<I: IntoIterator<Item = NetworkAddress>>(&self, items: I) {
        for address in items {
            self.store(address);
        }
    }

    pub fn remove(&self, address: &NetworkAddress) -> Result<(), Error> {
        let mut addresses = self.addresses.lock().expect("hosts poisoned");
        let before = addresses.len();
        addresses.retain(|existing| existing.authority() != address.authority());
        if addresses.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn admissible(address: &NetworkAddress) -> bool {
        address.port != 0 && !address.ip.is_unspecified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(ip: &str, port: u16) -> NetworkAddress {
        NetworkAddress {
            services: 1,
            ip: ip.parse().unwrap(),
            port,
            timestamp: 100,
        }
    }

    fn pool(capacity: usize) -> Hosts {
        Hosts::new(capacity, EphemeralStorage, fastrand::Rng::with_seed(7))
    }

    #[test]
    fn duplicate_store_is_noop() {
        let hosts = pool(10);
        hosts.store(address("1.2.3.4", 8333));
        hosts.store(address("1.2.3.4", 8333));
        assert_eq!(hosts.count(), 1);
    }

    #[test]
    fn fetch_empty_is_not_found() {
        let hosts = pool(10);
        assert_eq!(hosts.fetch().unwrap_err(), Error::NotFound);
    }

    #[test]
    fn capacity_evicts_rather_than_grows() {
        let hosts = pool(4);
        for i in 0..10u8 {
            hosts.store(address(&format!("1.2.3.{}", i + 1), 8333));
        }
        assert_eq!(hosts.count(), 4);
    }

    #[test]
    fn rejects_unroutable_entries() {
        let hosts = pool(10);
        hosts.store(address("1.2.3.4", 0));
        hosts.store(address("0.0.0.0", 8333));
        assert_eq!(hosts.count(), 0);
    }

    #[test]
    fn remove_round_trip() {
        let hosts = pool(10);
        let entry = address("1.2.3.4", 8333);
        hosts.store(entry);
        assert_eq!(hosts.remove(&entry), Ok(()));
        assert_eq!(hosts.remove(&entry), Err(Error::NotFound));
    }

    #[test]
    fn file_storage_round_trip() {
        let path = std::env::temp_dir().join(format!("goshawk_hosts_{}", std::process::id()));
        let storage = FileStorage::new(&path);

        let entries = vec![address("1.2.3.4", 8333), address("5.6.7.8", 18333)];
        storage.save(&entries).unwrap();
        assert_eq!(storage.load().unwrap(), entries);

        std::fs::remove_file(&path).ok();
    }
}
