use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::types::NodeId;

/// P2P configuration persisted under the data directory as
/// `p2p_config.json`. A missing file is replaced with defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct P2pConfig {
    pub listen_addresses: Vec<String>,
    pub bootstrap_peers: Vec<String>,
    pub private_key_file: String,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec!["/ip4/0.0.0.0/tcp/9000".to_string()],
            bootstrap_peers: vec![],
            private_key_file: String::new(),
        }
    }
}

impl P2pConfig {
    fn path(data_dir: &str) -> PathBuf {
        Path::new(data_dir).join("p2p_config.json")
    }

    /// Load the config from `<data_dir>/p2p_config.json`, writing the
    /// defaults first if the file does not exist.
    pub fn load(data_dir: &str) -> Result<Self> {
        let path = Self::path(data_dir);
        if !path.exists() {
            let config = Self::default();
            config.save(data_dir)?;
            return Ok(config);
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if config.listen_addresses.is_empty() {
            bail!("p2p config has no listen addresses");
        }
        Ok(config)
    }

    pub fn save(&self, data_dir: &str) -> Result<()> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir {data_dir}"))?;
        let path = Self::path(data_dir);
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, data)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Listen addresses as socket addresses.
    pub fn listen_socket_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.listen_addresses
            .iter()
            .map(|addr| multiaddr_to_socket(addr))
            .collect()
    }

    /// Bootstrap peers as socket addresses plus optional peer ids.
    pub fn bootstrap_socket_addrs(&self) -> Result<Vec<(SocketAddr, Option<NodeId>)>> {
        self.bootstrap_peers
            .iter()
            .map(|addr| parse_bootstrap_addr(addr))
            .collect()
    }
}

/// Parse a `/ip4/<host>/tcp/<port>` (or `/ip6/…`) multiaddr into a socket
/// address. Only the TCP transport is understood here.
pub fn multiaddr_to_socket(addr: &str) -> Result<SocketAddr> {
    let parts: Vec<&str> = addr.split('/').filter(|p| !p.is_empty()).collect();
    let &[family, host, proto, port] = parts.as_slice() else {
        bail!("invalid multiaddr: {addr}");
    };
    if proto != "tcp" {
        bail!("unsupported transport in multiaddr {addr}: {proto}");
    }
    let ip: IpAddr = match family {
        "ip4" | "ip6" => host
            .parse()
            .with_context(|| format!("invalid host in multiaddr {addr}"))?,
        other => bail!("unsupported address family in multiaddr {addr}: {other}"),
    };
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in multiaddr {addr}"))?;
    Ok(SocketAddr::new(ip, port))
}

/// Parse a bootstrap multiaddr, optionally carrying a trailing
/// `/p2p/<peer-id>` identity.
pub fn parse_bootstrap_addr(addr: &str) -> Result<(SocketAddr, Option<NodeId>)> {
    match addr.split_once("/p2p/") {
        Some((base, id)) if !id.is_empty() => {
            Ok((multiaddr_to_socket(base)?, Some(id.to_string())))
        }
        _ => Ok((multiaddr_to_socket(addr)?, None)),
    }
}
