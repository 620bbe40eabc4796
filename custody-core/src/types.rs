//! Core types for the custody ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode snapshots, hash-chained events)
//! - Exclusive states (one role per account, tagged variants over flags)
//! - Exact integer quantities (no fractional custody)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Point in time a command was issued at
pub type Timestamp = DateTime<Utc>;

/// Account address (20 bytes, rendered as `0x`-prefixed hex)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    /// The all-zero address; never a valid command target
    pub const ZERO: Address = Address([0u8; 20]);

    /// Create from raw bytes
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Deterministic test/demo address whose last byte is `n`
    pub const fn from_low_u64(n: u64) -> Self {
        let mut bytes = [0u8; 20];
        let be = n.to_be_bytes();
        let mut i = 0;
        while i < 8 {
            bytes[12 + i] = be[i];
            i += 1;
        }
        Self(bytes)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// True for the zero address
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);

        let decoded = hex::decode(digits)
            .map_err(|e| crate::Error::InvalidInput(format!("malformed address {:?}: {}", s, e)))?;

        let bytes: [u8; 20] = decoded.try_into().map_err(|v: Vec<u8>| {
            crate::Error::InvalidInput(format!(
                "address must be 20 bytes, got {} in {:?}",
                v.len(),
                s
            ))
        })?;

        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Batch identifier (monotonic, never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Violation identifier (monotonic, never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViolationId(pub u64);

impl fmt::Display for ViolationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account role
///
/// Exactly one per account. The reseller cap lives inside the variant, so a
/// non-reseller has no cap to get out of sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Role {
    /// No role (initial state, and the state after any removal)
    #[default]
    None,
    /// Administers roles, policy and the blacklist
    Admin,
    /// Creates batches
    Producer,
    /// Receives and forwards stock, up to `max_quantity` held at once
    Reseller {
        /// Reseller cap
        max_quantity: u64,
    },
}

impl Role {
    /// Field-less discriminant
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::None => RoleKind::None,
            Role::Admin => RoleKind::Admin,
            Role::Producer => RoleKind::Producer,
            Role::Reseller { .. } => RoleKind::Reseller,
        }
    }

    /// Reseller cap, 0 for every other role
    pub fn max_quantity(&self) -> u64 {
        match self {
            Role::Reseller { max_quantity } => *max_quantity,
            _ => 0,
        }
    }

    /// Producers and resellers may move stock out
    pub fn can_hold_stock(&self) -> bool {
        matches!(self, Role::Producer | Role::Reseller { .. })
    }
}

/// Role discriminant without the reseller cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleKind {
    /// No role
    None,
    /// Admin
    Admin,
    /// Producer
    Producer,
    /// Reseller
    Reseller,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoleKind::None => "none",
            RoleKind::Admin => "admin",
            RoleKind::Producer => "producer",
            RoleKind::Reseller => "reseller",
        };
        f.write_str(s)
    }
}

/// A discrete quantity of commodity with tracked provenance and custody
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Batch ID
    pub id: BatchId,
    /// Original producer (immutable, inherited by split batches)
    pub producer: Address,
    /// Remaining quantity (always > 0 for a batch that exists)
    pub quantity: u64,
    /// Production time (inherited by split batches)
    pub created_at: Timestamp,
    /// Current custodian
    pub current_owner: Address,
    /// Set by the storage scan once the batch outlives the policy
    pub expired: bool,
    /// Batch this one was split from on a partial transfer
    pub parent: Option<BatchId>,
}

impl Batch {
    /// Storage age at `now` (zero if `now` precedes creation)
    pub fn age(&self, now: Timestamp) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }
}

/// Policy breach category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    /// Batch held beyond the storage duration, or holder above the storage threshold
    ExcessiveStorage,
    /// Reseller holding more than its cap
    QuantityOverflow,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::ExcessiveStorage => f.write_str("excessive_storage"),
            ViolationKind::QuantityOverflow => f.write_str("quantity_overflow"),
        }
    }
}

/// Recorded policy breach tied to a holder and batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Violation ID
    pub id: ViolationId,
    /// Offending holder
    pub holder: Address,
    /// Batch the breach was attributed to
    pub batch_id: BatchId,
    /// Breach category
    pub kind: ViolationKind,
    /// Detection time
    pub detected_at: Timestamp,
    /// Resolved by an admin
    pub resolved: bool,
    /// Resolution time
    pub resolved_at: Option<Timestamp>,
}

impl Violation {
    /// Unresolved violations count towards auto-blacklisting
    pub fn is_active(&self) -> bool {
        !self.resolved
    }
}

/// Aggregate view of one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Address
    pub address: Address,
    /// Display label, if an admin set one
    pub label: Option<String>,
    /// Current role
    pub role: Role,
    /// Aggregate balance
    pub stock_balance: u64,
    /// Reseller cap (0 for non-resellers)
    pub max_quantity: u64,
    /// Blacklist status
    pub blacklisted: bool,
    /// Number of batches currently owned
    pub batch_count: usize,
    /// Number of unresolved violations
    pub active_violations: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_address_roundtrip_display() {
        let addr: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        assert_eq!(addr, Address::from_low_u64(0xaa));
        assert_eq!(addr.to_string(), "0x00000000000000000000000000000000000000aa");
    }

    #[test]
    fn test_address_without_prefix() {
        let addr: Address = "00000000000000000000000000000000000000ff".parse().unwrap();
        assert_eq!(addr, Address::from_low_u64(0xff));
    }

    #[test]
    fn test_malformed_address_rejected() {
        assert!("0x1234".parse::<Address>().is_err());
        assert!("0xzz00000000000000000000000000000000000000".parse::<Address>().is_err());
    }

    #[test]
    fn test_zero_address() {
        assert!(Address::ZERO.is_zero());
        assert!(!Address::from_low_u64(1).is_zero());
    }

    #[test]
    fn test_role_cap_is_structural() {
        assert_eq!(Role::Reseller { max_quantity: 50 }.max_quantity(), 50);
        assert_eq!(Role::Producer.max_quantity(), 0);
        assert_eq!(Role::Admin.kind(), RoleKind::Admin);
        assert!(!Role::Admin.can_hold_stock());
        assert!(Role::Producer.can_hold_stock());
    }

    #[test]
    fn test_batch_age_never_negative() {
        let created = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let batch = Batch {
            id: BatchId(1),
            producer: Address::from_low_u64(1),
            quantity: 10,
            created_at: created,
            current_owner: Address::from_low_u64(1),
            expired: false,
            parent: None,
        };

        assert_eq!(batch.age(created - Duration::days(1)), Duration::zero());
        assert_eq!(batch.age(created + Duration::days(3)), Duration::days(3));
    }

    #[test]
    fn test_address_serde_as_hex_string() {
        let addr = Address::from_low_u64(7);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"0x0000000000000000000000000000000000000007\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
