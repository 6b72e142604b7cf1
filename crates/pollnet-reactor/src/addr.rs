//! Host name resolution.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};

use pollnet_config::log_socket_warn;

use crate::error::{ReactorError, Result};

/// Resolve `host` (name or literal) to one address, preferring IPv4.
///
/// Blocks on the system resolver for names; literals return immediately.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| ReactorError::Resolve(format!("{}: {}", host, e)))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ReactorError::Resolve(host.to_string()))
}

/// Like [`resolve`], but an empty host means every local IPv4 address.
pub fn bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    if host.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    resolve(host, port)
}

type Cache = Arc<Mutex<HashMap<String, Option<IpAddr>>>>;

/// Non-blocking resolver front end.
///
/// The first probe for a name starts a background lookup and returns
/// `None`; later probes return the cached address once it lands. Failed
/// lookups are forgotten so the next probe retries.
#[derive(Debug, Clone, Default)]
pub struct AddrProbe {
    cache: Cache,
}

impl AddrProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }

        let mut cache = lock(&self.cache);
        if let Some(entry) = cache.get(host) {
            // None: lookup still in flight
            return *entry;
        }
        cache.insert(host.to_string(), None);
        drop(cache);

        let shared = Arc::clone(&self.cache);
        let name = host.to_string();
        let spawned = std::thread::Builder::new()
            .name("pollnet-resolve".into())
            .spawn(move || {
                let found = resolve(&name, 0).ok().map(|a| a.ip());
                let mut cache = lock(&shared);
                match found {
                    Some(ip) => {
                        cache.insert(name, Some(ip));
                    }
                    None => {
                        cache.remove(&name);
                    }
                }
            });
        if let Err(e) = spawned {
            log_socket_warn!(host, error = %e, "Cannot start resolver thread");
            lock(&self.cache).remove(host);
        }
        None
    }

    /// Cached address without starting a lookup.
    pub fn cached(&self, host: &str) -> Option<IpAddr> {
        lock(&self.cache).get(host).copied().flatten()
    }

    /// True while a lookup for `host` is running.
    pub fn is_pending(&self, host: &str) -> bool {
        matches!(lock(&self.cache).get(host), Some(None))
    }
}

fn lock(cache: &Cache) -> MutexGuard<'_, HashMap<String, Option<IpAddr>>> {
    cache.lock().unwrap_or_else(|e| e.into_inner())
}
