// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

// Config files are YAML (`.yaml` / `.yml`) or JSON, chosen by extension.
// Saving always writes pretty JSON.
pub trait Config: Serialize + DeserializeOwned {
    fn persisted(self, path: &Path) -> PersistedConfig<Self>
    where
        Self: Sized,
    {
        PersistedConfig {
            inner: self,
            path: path.to_path_buf(),
        }
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {:?}: {}", path, e))?;
        let config: Self = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

pub struct PersistedConfig<C> {
    inner: C,
    path: PathBuf,
}

impl<C: Config> PersistedConfig<C> {
    pub fn read(&self) -> Result<C> {
        C::load(&self.path)
    }

    pub fn save(&self) -> Result<()> {
        self.inner.save(&self.path)
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

pub mod local_ip_utils {
    use std::net::{IpAddr, SocketAddr, TcpListener};

    // Let the OS pick a free port by binding to port 0
    pub fn get_available_port(host: &IpAddr) -> u16 {
        let socket_addr = SocketAddr::new(*host, 0);
        let listener = TcpListener::bind(socket_addr).expect("Failed to bind to random port");
        listener
            .local_addr()
            .expect("Failed to get local address")
            .port()
    }

    pub fn get_available_ports(host: &IpAddr, count: usize) -> Vec<u16> {
        (0..count).map(|_| get_available_port(host)).collect()
    }

    pub fn localhost_for_testing() -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1))
    }
}
