use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Server configuration. Defaults match the documented control-plane contract;
/// `cao serve` overrides individual fields from CLI flags.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Reader pane-poll cadence.
    pub poll_interval: Duration,
    /// How long a freshly launched terminal may take to show its ready prompt.
    pub startup_timeout: Duration,
    /// How long a BUSY terminal may go without any recognizable output before
    /// the reader marks it errored.
    pub idle_timeout: Duration,
    /// Optional bound on the whole handoff wait. `None` means unbounded.
    pub handoff_timeout: Option<Duration>,
    pub scheduler_tick: Duration,
    /// Pane lines captured per poll.
    pub history_lines: usize,
    pub flows_dir: PathBuf,
    pub profiles_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let home = cao_home();
        Self {
            host: IpAddr::from([127, 0, 0, 1]),
            port: 9889,
            poll_interval: Duration::from_millis(500),
            startup_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(24 * 60 * 60),
            handoff_timeout: None,
            scheduler_tick: Duration::from_secs(30),
            history_lines: 200,
            flows_dir: home.join("flows"),
            profiles_dir: home.join("agents"),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> (IpAddr, u16) {
        (self.host, self.port)
    }
}

/// User-scoped state directory (`~/.cao`). Falls back to a relative `.cao`
/// when the home directory cannot be resolved.
pub fn cao_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".cao"))
        .unwrap_or_else(|| PathBuf::from(".cao"))
}

#[cfg(test)]
mod tests {
    use super::ServerConfig;

    #[test]
    fn defaults_match_contract() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 9889);
        assert!(cfg.host.is_loopback());
        assert_eq!(cfg.poll_interval.as_millis(), 500);
        assert_eq!(cfg.startup_timeout.as_secs(), 60);
        assert_eq!(cfg.idle_timeout.as_secs(), 86_400);
        assert_eq!(cfg.scheduler_tick.as_secs(), 30);
        assert!(cfg.handoff_timeout.is_none());
    }
}
