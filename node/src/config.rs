use anyhow::{Context, Result};
use ini::Ini;
use std::path::{Path, PathBuf};
use tracing::*;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mochi.conf";
pub const DEFAULT_DATA_DIR: &str = "/var/lib/mochi";
pub const DEFAULT_PORT: u16 = 1443;
pub const DEFAULT_LISTEN: &str = "0.0.0.0";
pub const DEFAULT_DIRECTORY_TTL: u64 = 30 * 86_400;

/// Node configuration, read from an INI file with sections `directories`,
/// `email`, `p2p` and `web`. Only `directories` and `p2p` concern the core;
/// the other sections belong to the outer surfaces and are ignored here.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub port: u16,
    pub listen: String,
    pub peers_minimum: usize,
    pub bootstrap: Vec<String>,
    pub directory_ttl: u64,
    pub mdns: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            port: DEFAULT_PORT,
            listen: DEFAULT_LISTEN.to_owned(),
            peers_minimum: swarm::PEERS_MINIMUM,
            bootstrap: Vec::new(),
            directory_ttl: DEFAULT_DIRECTORY_TTL,
            mdns: true,
        }
    }
}

impl Config {
    /// Load the configuration. A missing file at the default location just
    /// means defaults; an explicitly named file must exist and parse.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_owned(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        if !path.exists() {
            if required {
                anyhow::bail!("configuration file {} does not exist", path.display());
            }
            debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(&path).with_context(|| format!("parsing {}", path.display()))?;
        Self::from_ini(&ini).with_context(|| format!("in {}", path.display()))
    }

    fn from_ini(ini: &Ini) -> Result<Self> {
        let mut config = Self::default();
        if let Some(directories) = ini.section(Some("directories")) {
            if let Some(data) = directories.get("data") {
                config.data_dir = PathBuf::from(data);
            }
        }
        if let Some(p2p) = ini.section(Some("p2p")) {
            if let Some(port) = p2p.get("port") {
                config.port = port.parse().with_context(|| format!("p2p.port {:?}", port))?;
            }
            if let Some(listen) = p2p.get("listen") {
                config.listen = listen.to_owned();
            }
            if let Some(minimum) = p2p.get("peers_minimum") {
                config.peers_minimum = minimum
                    .parse()
                    .with_context(|| format!("p2p.peers_minimum {:?}", minimum))?;
            }
            if let Some(bootstrap) = p2p.get("bootstrap") {
                config.bootstrap = bootstrap
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            if let Some(ttl) = p2p.get("directory_ttl") {
                config.directory_ttl = ttl.parse().with_context(|| format!("p2p.directory_ttl {:?}", ttl))?;
            }
            if let Some(mdns) = p2p.get("mdns") {
                config.mdns = matches!(mdns, "1" | "true" | "on" | "yes");
            }
        }
        Ok(config)
    }

    /// The socket addresses the transport binds. The unspecified address
    /// expands to both IPv4 and IPv6.
    pub fn listen_addrs(&self) -> Result<util::BindAddrs> {
        if self.listen == "0.0.0.0" || self.listen == "::" {
            return Ok(util::BindAddrs::unspecified(self.port));
        }
        if let Ok(ip) = self.listen.parse::<std::net::IpAddr>() {
            return Ok(std::net::SocketAddr::from((ip, self.port)).into());
        }
        util::BindAddrs::from_host(
            &self.listen,
            self.port.try_into().context("p2p.port must not be 0 for a host name")?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load(text: &str) -> Config {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        Config::load(Some(file.path())).unwrap()
    }

    #[test]
    fn defaults_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.port, 1443);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/mochi"));
    }

    #[test]
    fn sections_override_defaults() {
        let config = load(
            "[directories]\n\
             data = /tmp/mochi-test\n\
             [p2p]\n\
             port = 2443\n\
             listen = 127.0.0.1\n\
             peers_minimum = 3\n\
             bootstrap = /ip4/10.0.0.1/tcp/1443/p2p/x, /ip4/10.0.0.2/tcp/1443/p2p/y\n\
             [web]\n\
             port = 443\n",
        );
        assert_eq!(config.data_dir, PathBuf::from("/tmp/mochi-test"));
        assert_eq!(config.port, 2443);
        assert_eq!(config.listen, "127.0.0.1");
        assert_eq!(config.peers_minimum, 3);
        assert_eq!(config.bootstrap.len(), 2);
        assert_eq!(config.directory_ttl, DEFAULT_DIRECTORY_TTL);
    }

    #[test]
    fn bad_port_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[p2p]\nport = not-a-port\n").unwrap();
        assert!(Config::load(Some(file.path())).is_err());
    }

    #[test]
    fn missing_explicit_file_is_fatal() {
        assert!(Config::load(Some(Path::new("/does/not/exist.conf"))).is_err());
    }

    #[test]
    fn unspecified_listen_covers_both_families() {
        let config = Config::default();
        assert_eq!(config.listen_addrs().unwrap().iter().count(), 2);
    }
}
