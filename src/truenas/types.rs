//! Wire types for the TrueNAS middleware API. Deserialization is tolerant:
//! fields we do not consume are ignored, fields the server omits default.

use serde::Deserialize;

/// TrueNAS SCALE release version, used for method-name dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }

    /// Parses versions like "25.04.1" or "TrueNAS-SCALE-25.04.0".
    pub fn parse(raw: &str) -> Option<Version> {
        let digits = raw.trim_start_matches(|c: char| !c.is_ascii_digit());
        let mut parts = digits.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some(Version { major, minor })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtInstance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub aliases: Vec<VirtAlias>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VirtAlias {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub snapshot_name: String,
    #[serde(default)]
    pub dataset: String,
    /// Referenced bytes, for checkpoint listings.
    #[serde(default)]
    pub referenced: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VirtGlobalConfig {
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub dataset: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub state: InterfaceState,
    #[serde(default)]
    pub aliases: Vec<InterfaceAlias>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterfaceState {
    #[serde(default)]
    pub link_state: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterfaceAlias {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub netmask: u32,
}

/// NIC device attached at container creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicOpts {
    /// "MACVLAN" or "BRIDGED".
    pub nic_type: String,
    /// Host interface the NIC hangs off (e.g. "eno1", "br0").
    pub parent: String,
}

#[derive(Debug, Clone)]
pub struct CreateInstanceOpts {
    pub name: String,
    pub image: String,
    pub cpu: String,
    /// Memory in bytes.
    pub memory: i64,
    pub autostart: bool,
    pub nic: Option<NicOpts>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parse_variants() {
        assert_eq!(Version::parse("25.04.1"), Some(Version { major: 25, minor: 4 }));
        assert_eq!(Version::parse("TrueNAS-SCALE-25.10.0"), Some(Version { major: 25, minor: 10 }));
        assert_eq!(Version::parse("garbage"), None);
    }

    #[test]
    fn version_ordering() {
        let v = Version { major: 25, minor: 4 };
        assert!(v.at_least(25, 4));
        assert!(v.at_least(24, 10));
        assert!(!v.at_least(25, 10));
        assert!(!v.at_least(26, 0));
    }

    #[test]
    fn instance_tolerates_unknown_fields() {
        let inst: VirtInstance = serde_json::from_str(
            r#"{"name":"px-a","status":"RUNNING","cpu":"2","unknown":{"x":1},
                "aliases":[{"type":"INET","address":"10.0.0.9","netmask":24}]}"#,
        )
        .unwrap();
        assert_eq!(inst.name, "px-a");
        assert_eq!(inst.aliases[0].address, "10.0.0.9");
    }
}
