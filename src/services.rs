//! Service table and write routing
//!
//! A device exposes several logical services, each a pair of
//! characteristics: one the host writes commands to and one the device
//! notifies responses on. Which service a payload belongs to is decided by
//! marker bytes inside the payload itself; [`ServiceMap::route`] applies the
//! configured rules so callers never name a service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ble::char_uuid::CharUuid;

/// The characteristics of one logical service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub write: CharUuid,
    pub notify: CharUuid,
}

/// Sends payloads carrying `marker` at `offset` to `service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(with = "hex_bytes")]
    pub marker: Vec<u8>,
    #[serde(default)]
    pub offset: usize,
    pub service: String,
}

impl RouteRule {
    pub fn prefix(marker: &[u8], service: impl Into<String>) -> Self {
        Self {
            marker: marker.to_vec(),
            offset: 0,
            service: service.into(),
        }
    }

    /// End of the marker window, or `None` if it lies past `usize::MAX`.
    pub fn marker_end(&self) -> Option<usize> {
        self.offset.checked_add(self.marker.len())
    }

    pub fn matches(&self, payload: &[u8]) -> bool {
        self.marker_end()
            .and_then(|end| payload.get(self.offset..end))
            .is_some_and(|window| window == self.marker.as_slice())
    }
}

/// Name of the primary command service in the built-in table.
pub const COMMAND_SERVICE: &str = "MMP";
/// Name of the secondary bulk/control service in the built-in table.
pub const CONTROL_SERVICE: &str = "BCP";
/// Payloads starting with these bytes belong to the control service.
pub const CONTROL_MARKER: [u8; 8] = [0x04, 0x0f, 0x00, 0x0d, 0x60, 0x00, 0x00, 0x1f];

/// Service name to characteristics, plus the routing rules over them.
///
/// Built once at session construction and read-only afterwards. Whether
/// every rule names a known service is checked by
/// [`ClientConfig::validate`](crate::config::ClientConfig::validate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMap {
    services: BTreeMap<String, ServiceEntry>,
    routes: Vec<RouteRule>,
    default_service: String,
}

impl ServiceMap {
    pub fn new(
        services: BTreeMap<String, ServiceEntry>,
        routes: Vec<RouteRule>,
        default_service: impl Into<String>,
    ) -> Self {
        Self {
            services,
            routes,
            default_service: default_service.into(),
        }
    }

    /// The two-service table of the reference device.
    pub fn builtin() -> Self {
        let vendor = |hi: u128, lo: u128| {
            CharUuid::Custom(uuid::Uuid::from_u128(
                (hi << 96) | (lo << 80) | 0x1000_8000_0080_5f9b_aaaa,
            ))
        };
        let mut services = BTreeMap::new();
        services.insert(
            COMMAND_SERVICE.to_string(),
            ServiceEntry {
                write: vendor(0x1000_0000, 0x1000),
                notify: vendor(0x1000_0000, 0x2000),
            },
        );
        services.insert(
            CONTROL_SERVICE.to_string(),
            ServiceEntry {
                write: vendor(0x4000_0000, 0x1000),
                notify: vendor(0x4000_0000, 0x2000),
            },
        );
        Self::new(
            services,
            vec![RouteRule::prefix(&CONTROL_MARKER, CONTROL_SERVICE)],
            COMMAND_SERVICE,
        )
    }

    pub fn get(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServiceEntry)> {
        self.services.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn routes(&self) -> &[RouteRule] {
        &self.routes
    }

    pub fn default_service(&self) -> &str {
        &self.default_service
    }

    /// Every notify characteristic, in service-name order.
    pub fn notify_characteristics(&self) -> Vec<CharUuid> {
        self.services.values().map(|entry| entry.notify).collect()
    }

    /// The service a payload is written to: the first matching rule, else
    /// the default service.
    pub fn route(&self, payload: &[u8]) -> &str {
        self.routes
            .iter()
            .find(|rule| rule.matches(payload))
            .map(|rule| rule.service.as_str())
            .unwrap_or(&self.default_service)
    }
}

/// Markers are written as hex strings (`"040f000d6000001f"`, spaces allowed).
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        hex::decode(compact).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_uuids() {
        let map = ServiceMap::builtin();
        let mmp = map.get(COMMAND_SERVICE).unwrap();
        assert_eq!(mmp.write.to_string(), "10000000-1000-1000-8000-00805f9baaaa");
        assert_eq!(mmp.notify.to_string(), "10000000-2000-1000-8000-00805f9baaaa");
        let bcp = map.get(CONTROL_SERVICE).unwrap();
        assert_eq!(bcp.write.to_string(), "40000000-1000-1000-8000-00805f9baaaa");
        assert_eq!(bcp.notify.to_string(), "40000000-2000-1000-8000-00805f9baaaa");
    }

    #[test]
    fn test_marker_routes_to_control_service() {
        let map = ServiceMap::builtin();
        let mut control = CONTROL_MARKER.to_vec();
        control.extend_from_slice(&[0x01, 0x02]);
        assert_eq!(map.route(&control), CONTROL_SERVICE);
        assert_eq!(map.route(&CONTROL_MARKER), CONTROL_SERVICE);
    }

    #[test]
    fn test_other_payloads_route_to_default() {
        let map = ServiceMap::builtin();
        assert_eq!(map.route(&[0xAA, 0x0E, 0x01, 0x02, 0x03, 0x01, 0x0E]), COMMAND_SERVICE);
        assert_eq!(map.route(&CONTROL_MARKER[..7]), COMMAND_SERVICE);
        assert_eq!(map.route(&[]), COMMAND_SERVICE);
    }

    #[test]
    fn test_offset_rule() {
        let rule = RouteRule {
            marker: vec![0xBE, 0xEF],
            offset: 2,
            service: "X".into(),
        };
        assert!(rule.matches(&[0, 0, 0xBE, 0xEF]));
        assert!(!rule.matches(&[0xBE, 0xEF, 0, 0]));
        assert!(!rule.matches(&[0, 0, 0xBE]));
    }

    #[test]
    fn test_offset_past_address_space_never_matches() {
        let rule = RouteRule {
            marker: vec![0x01],
            offset: usize::MAX,
            service: CONTROL_SERVICE.into(),
        };
        assert_eq!(rule.marker_end(), None);
        assert!(!rule.matches(&[0xAA]));
        assert!(!rule.matches(&[]));

        let map = ServiceMap::new(
            ServiceMap::builtin().iter().map(|(n, e)| (n.to_string(), *e)).collect(),
            vec![rule],
            COMMAND_SERVICE,
        );
        assert_eq!(map.route(&[0xAA]), COMMAND_SERVICE);
    }

    #[test]
    fn test_rule_marker_as_hex() {
        let rule: RouteRule =
            serde_json::from_str(r#"{"marker": "04 0f 00 0d 60 00 00 1f", "service": "BCP"}"#)
                .unwrap();
        assert_eq!(rule, RouteRule::prefix(&CONTROL_MARKER, "BCP"));
        let json = serde_json::to_string(&rule).unwrap();
        assert!(json.contains("\"040f000d6000001f\""));
    }

    #[test]
    fn test_notify_characteristics_in_name_order() {
        let map = ServiceMap::builtin();
        let notify = map.notify_characteristics();
        assert_eq!(notify.len(), 2);
        assert_eq!(notify[0], map.get(CONTROL_SERVICE).unwrap().notify);
    }
}
