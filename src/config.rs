use std::{fs::File, io::BufReader, net::Ipv4Addr, path::Path};

use advmac::MacAddr6;
use compact_str::CompactString;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Node network settings. Read once per link-up.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeConfig {
    pub hwaddr: MacAddr6,
    #[serde(default)]
    pub hostname: CompactString,
    #[serde(default = "default_true")]
    pub use_dhcp: bool,
    /// Probe and defend addresses. When off, addresses are used unverified.
    #[serde(default = "default_true")]
    pub acd: bool,
    /// Used when DHCP is disabled, and as the first fallback when no server
    /// answers.
    #[serde(default)]
    pub static_address: Option<StaticAddress>,
    #[serde(default = "default_true")]
    pub link_local_fallback: bool,
    #[serde(default = "default_fallback_after_tries")]
    pub fallback_after_tries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct StaticAddress {
    pub address: Ipv4Net,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
}

fn default_true() -> bool {
    true
}

fn default_fallback_after_tries() -> u32 {
    4
}

impl NodeConfig {
    /// DHCP with every fallback enabled.
    pub fn new(hwaddr: MacAddr6, hostname: &str) -> Self {
        Self {
            hwaddr,
            hostname: hostname.into(),
            use_dhcp: true,
            acd: true,
            static_address: None,
            link_local_fallback: true,
            fallback_after_tries: default_fallback_after_tries(),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        let config: NodeConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hwaddr == MacAddr6::nil() || self.hwaddr.is_multicast() {
            return Err(ConfigError::InvalidHwaddr(self.hwaddr));
        }
        if !self.use_dhcp && self.static_address.is_none() {
            return Err(ConfigError::MissingStaticAddress);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let config: NodeConfig = serde_json::from_str(r#"{"hwaddr": "02:00:00:00:00:01"}"#).unwrap();
        assert!(config.use_dhcp);
        assert!(config.acd);
        assert!(config.link_local_fallback);
        assert_eq!(config.fallback_after_tries, 4);
        assert_eq!(config.hostname, "");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation() {
        let mut config = NodeConfig::new(MacAddr6::nil(), "node");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHwaddr(_))
        ));

        config.hwaddr = MacAddr6::new([0x01, 0, 0x5e, 0, 0, 1]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHwaddr(_))
        ));

        config.hwaddr = MacAddr6::new([0x02, 0, 0, 0, 0, 1]);
        config.use_dhcp = false;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingStaticAddress)
        ));

        config.static_address = Some(StaticAddress {
            address: "192.168.1.50/24".parse().unwrap(),
            gateway: None,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_json_is_a_parse_error() {
        let err = serde_json::from_str::<NodeConfig>(r#"{"hwaddr": 5}"#).unwrap_err();
        assert!(matches!(ConfigError::from(err), ConfigError::Parse(_)));
    }
}
