//! Core types for snapshots.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Payload shape tag written into every new snapshot.
pub const SCHEMA_VERSION: &str = "1.0";

/// Length of the random suffix appended to snapshot ids.
const ID_SUFFIX_LEN: usize = 9;

/// Unique identifier for a snapshot.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    /// Generate a fresh id from the given creation instant and a random suffix.
    pub fn generate(at: Timestamp) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ID_SUFFIX_LEN)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        SnapshotId(format!("backup_{}_{}", at.0, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        SnapshotId(s.to_string())
    }
}

impl fmt::Debug for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotId({})", self.0)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A named category of persisted application data.
///
/// The storage key of each domain is its serialized name. The set is
/// closed: snapshots only ever capture these keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Domain {
    Assets,
    People,
    Categories,
    Sectors,
    Locations,
    AccountingAccounts,
    DepreciationAccounts,
    FiscalCreditAccounts,
    Rentals,
    Commitments,
    MaintenanceRecords,
    RevaluationRecords,
    GeneralSettings,
    CompanySettings,
    InterfaceSettings,
    NotificationSettings,
}

impl Domain {
    /// Every domain captured by a snapshot, in capture order.
    pub const ALL: [Domain; 16] = [
        Domain::Assets,
        Domain::People,
        Domain::Categories,
        Domain::Sectors,
        Domain::Locations,
        Domain::AccountingAccounts,
        Domain::DepreciationAccounts,
        Domain::FiscalCreditAccounts,
        Domain::Rentals,
        Domain::Commitments,
        Domain::MaintenanceRecords,
        Domain::RevaluationRecords,
        Domain::GeneralSettings,
        Domain::CompanySettings,
        Domain::InterfaceSettings,
        Domain::NotificationSettings,
    ];

    /// Key under which this domain lives in the key-value store.
    pub fn storage_key(self) -> &'static str {
        match self {
            Domain::Assets => "assets",
            Domain::People => "people",
            Domain::Categories => "categories",
            Domain::Sectors => "sectors",
            Domain::Locations => "locations",
            Domain::AccountingAccounts => "accounting-accounts",
            Domain::DepreciationAccounts => "depreciation-accounts",
            Domain::FiscalCreditAccounts => "fiscal-credit-accounts",
            Domain::Rentals => "rentals",
            Domain::Commitments => "commitments",
            Domain::MaintenanceRecords => "maintenance-records",
            Domain::RevaluationRecords => "revaluation-records",
            Domain::GeneralSettings => "general-settings",
            Domain::CompanySettings => "company-settings",
            Domain::InterfaceSettings => "interface-settings",
            Domain::NotificationSettings => "notification-settings",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.storage_key())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .iter()
            .copied()
            .find(|d| d.storage_key() == s)
            .ok_or_else(|| format!("unknown domain: {}", s))
    }
}

/// Captured domain data: the exact string each domain key held.
pub type SnapshotPayload = BTreeMap<Domain, String>;

/// An immutable point-in-time capture of all domain data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: SnapshotId,

    pub created_at: Timestamp,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub payload: SnapshotPayload,

    /// Identifies the payload's shape.
    pub schema_version: String,
}

impl Snapshot {
    /// Total bytes of captured domain data.
    pub fn payload_bytes(&self) -> usize {
        self.payload.values().map(String::len).sum()
    }

    /// Domains captured by this snapshot.
    pub fn domains(&self) -> impl Iterator<Item = Domain> + '_ {
        self.payload.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_differ() {
        let at = Timestamp(1_700_000_000_000_000);
        let a = SnapshotId::generate(at);
        let b = SnapshotId::generate(at);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("backup_1700000000000000_"));
        assert_eq!(a.as_str().len(), "backup_1700000000000000_".len() + ID_SUFFIX_LEN);
    }

    #[test]
    fn test_domain_keys_roundtrip() {
        for domain in Domain::ALL {
            let parsed: Domain = domain.storage_key().parse().unwrap();
            assert_eq!(parsed, domain);

            let json = serde_json::to_string(&domain).unwrap();
            assert_eq!(json, format!("\"{}\"", domain.storage_key()));
        }
        assert!("furniture".parse::<Domain>().is_err());
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut payload = SnapshotPayload::new();
        payload.insert(Domain::FiscalCreditAccounts, "[]".to_string());

        let snapshot = Snapshot {
            id: SnapshotId::from("backup_1_abc"),
            created_at: Timestamp(42),
            description: None,
            payload,
            schema_version: SCHEMA_VERSION.to_string(),
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["id"], "backup_1_abc");
        assert_eq!(value["createdAt"], 42);
        assert_eq!(value["schemaVersion"], "1.0");
        assert_eq!(value["payload"]["fiscal-credit-accounts"], "[]");
        assert!(value.get("description").is_none());

        let back: Snapshot = serde_json::from_value(value).unwrap();
        assert_eq!(back, snapshot);
        assert_eq!(back.payload_bytes(), 2);
    }
}
