use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, ErrorKind, Result};
use crate::registry::{self, HEADER_SERVERS};

/// How a single server is picked out of the current set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly random over the current set.
    Random,
    /// A monotonic cursor modulo the set size, seeded to a random starting
    /// position so multiple instances don't synchronize.
    RoundRobin,
}

/// A source of server addresses for the multi-server client.
///
/// Addresses carry their transport prefix, e.g. `"tcp@host:port"`,
/// `"unix@/path"` or `"http@host:port"`.
pub trait Discovery: Send + Sync {
    /// Re-reads the server set from its backing source, if any.
    fn refresh(&self) -> impl Future<Output = Result<()>> + Send;

    /// Replaces the server set.
    fn update(&self, servers: Vec<String>) -> impl Future<Output = Result<()>> + Send;

    /// Picks one server according to `mode`.
    fn get(&self, mode: SelectMode) -> impl Future<Output = Result<String>> + Send;

    /// Returns a copy of the whole server set.
    fn get_all(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
}

struct SelectState {
    servers: Vec<String>,
    index: usize,
    rng: SmallRng,
}

/// A discovery over an explicit server list, with no registry behind it.
pub struct MultiServersDiscovery {
    state: Mutex<SelectState>,
}

impl MultiServersDiscovery {
    #[must_use]
    pub fn new(servers: Vec<String>) -> Self {
        let mut rng = SmallRng::from_os_rng();
        let index = rng.random_range(0..u32::MAX as usize);
        Self {
            state: Mutex::new(SelectState {
                servers,
                index,
                rng,
            }),
        }
    }
}

impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.state.lock().unwrap().servers = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        let state = &mut *self.state.lock().unwrap();
        let n = state.servers.len();
        if n == 0 {
            return Err(Error::new(
                ErrorKind::NoAvailableServers,
                "rpc discovery: no available servers".to_string(),
            ));
        }
        match mode {
            SelectMode::Random => {
                let picked = state.rng.random_range(0..n);
                Ok(state.servers[picked].clone())
            }
            SelectMode::RoundRobin => {
                let picked = state.index % n;
                state.index = (picked + 1) % n;
                Ok(state.servers[picked].clone())
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().servers.clone())
    }
}

/// Default TTL for server lists fetched from a registry.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// A discovery whose server set is refreshed from a registry endpoint on a
/// TTL.
pub struct RegistryDiscovery {
    servers: MultiServersDiscovery,
    registry: String,
    update_timeout: Duration,
    last_update: Mutex<Option<Instant>>,
}

impl RegistryDiscovery {
    /// `update_timeout` of zero selects [`DEFAULT_UPDATE_TIMEOUT`].
    #[must_use]
    pub fn new(registry: impl Into<String>, update_timeout: Duration) -> Self {
        let update_timeout = if update_timeout.is_zero() {
            DEFAULT_UPDATE_TIMEOUT
        } else {
            update_timeout
        };
        Self {
            servers: MultiServersDiscovery::new(Vec::new()),
            registry: registry.into(),
            update_timeout,
            last_update: Mutex::new(None),
        }
    }
}

impl Discovery for RegistryDiscovery {
    /// Fetches the authoritative server list from the registry, unless the
    /// cached list is still within its TTL.
    async fn refresh(&self) -> Result<()> {
        if let Some(last) = *self.last_update.lock().unwrap()
            && last.elapsed() < self.update_timeout
        {
            return Ok(());
        }
        tracing::info!("rpc discovery: refresh servers from registry {}", self.registry);
        let response = registry::http_request(hyper::Method::GET, &self.registry, None)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    "rpc discovery: refresh from registry {} failed: {e}",
                    self.registry
                );
            })?;
        let servers = response
            .headers()
            .get(HEADER_SERVERS)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        self.servers.update(servers).await?;
        *self.last_update.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.servers.update(servers).await?;
        *self.last_update.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.servers.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        self.servers.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_empty_set() {
        let discovery = MultiServersDiscovery::new(Vec::new());
        let err = discovery.get(SelectMode::Random).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoAvailableServers);
        assert!(discovery.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_round_robin_coverage() {
        let servers: Vec<String> = ["tcp@a", "tcp@b", "tcp@c"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let discovery = MultiServersDiscovery::new(servers.clone());

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..servers.len() * 2 {
            let picked = discovery.get(SelectMode::RoundRobin).await.unwrap();
            *counts.entry(picked).or_default() += 1;
        }
        // each server exactly once per full cycle, regardless of offset
        for server in &servers {
            assert_eq!(counts[server], 2);
        }
    }

    #[tokio::test]
    async fn test_random_stays_in_set() {
        let servers: Vec<String> = ["tcp@a", "tcp@b"].iter().map(ToString::to_string).collect();
        let discovery = MultiServersDiscovery::new(servers.clone());
        for _ in 0..32 {
            let picked = discovery.get(SelectMode::Random).await.unwrap();
            assert!(servers.contains(&picked));
        }
    }

    #[tokio::test]
    async fn test_update_replaces() {
        let discovery = MultiServersDiscovery::new(vec!["tcp@a".to_string()]);
        discovery.update(vec!["tcp@b".to_string()]).await.unwrap();
        assert_eq!(discovery.get_all().await.unwrap(), vec!["tcp@b"]);
        assert_eq!(
            discovery.get(SelectMode::RoundRobin).await.unwrap(),
            "tcp@b"
        );
    }
}
