//! # Pharmacy Lookup Store
//!
//! Read-only in-memory index over the pharmacy dataset (members, orders,
//! prescriptions). The snapshot is loaded once at process start and never
//! mutated, so it can be shared across all connection actors without locking.
//!
//! ## Load-time guarantees:
//! - Identifiers are normalized before indexing, so lookups only ever deal
//!   in canonical keys
//! - Normalized identifiers are unique within their entity set
//! - Every order references an existing member (the process refuses to start
//!   on a dangling reference)
//!
//! Write paths intentionally do not exist; a real deployment would back this
//! with the pharmacy's actual data systems.

use crate::pharmacy::normalize::normalize_id;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A registered pharmacy member (immutable reference data).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub member_id: String,
    pub name: String,
}

/// A single prescription line within an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prescription {
    pub rx_id: String,
    pub name: String,
    pub refills_remaining: u32,
}

/// A prescription order belonging to exactly one member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub member_id: String,
    pub status: String,
    pub expected_pickup_time: String,
    pub prescriptions: Vec<Prescription>,
}

/// On-disk shape of the dataset.
#[derive(Debug, Deserialize)]
struct PharmacyData {
    members: Vec<Member>,
    orders: Vec<Order>,
}

/// Dataset bundled into the binary, used when no data file is configured.
/// Doubles as the fixture for tests.
const BUNDLED_DATA: &str = include_str!("../../data/pharmacy-data.json");

/// Immutable snapshot of the pharmacy dataset, indexed by normalized ID.
pub struct PharmacyStore {
    members: HashMap<String, Member>,
    orders: HashMap<String, Order>,
    /// Normalized member ID → normalized order IDs, in dataset order
    member_orders: HashMap<String, Vec<String>>,
}

impl PharmacyStore {
    /// Load the snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pharmacy data from {}", path.display()))?;
        Self::from_json(&raw)
    }

    /// Load the dataset bundled into the binary.
    pub fn bundled() -> Result<Self> {
        Self::from_json(BUNDLED_DATA)
    }

    /// Build the indexed snapshot from raw JSON, validating invariants.
    pub fn from_json(raw: &str) -> Result<Self> {
        let data: PharmacyData =
            serde_json::from_str(raw).context("Pharmacy data is not valid JSON")?;

        let mut members = HashMap::new();
        for member in data.members {
            let key = normalize_id(&member.member_id)
                .map_err(|e| anyhow!("Bad member ID in dataset: {}", e))?;
            if members.insert(key.clone(), member).is_some() {
                return Err(anyhow!("Duplicate member ID '{}' in dataset", key));
            }
        }

        let mut orders = HashMap::new();
        let mut member_orders: HashMap<String, Vec<String>> = HashMap::new();
        for order in data.orders {
            let order_key = normalize_id(&order.order_id)
                .map_err(|e| anyhow!("Bad order ID in dataset: {}", e))?;
            let member_key = normalize_id(&order.member_id)
                .map_err(|e| anyhow!("Bad member reference in dataset: {}", e))?;

            if !members.contains_key(&member_key) {
                return Err(anyhow!(
                    "Order '{}' references unknown member '{}'",
                    order_key,
                    member_key
                ));
            }

            member_orders
                .entry(member_key)
                .or_default()
                .push(order_key.clone());

            if orders.insert(order_key.clone(), order).is_some() {
                return Err(anyhow!("Duplicate order ID '{}' in dataset", order_key));
            }
        }

        Ok(Self {
            members,
            orders,
            member_orders,
        })
    }

    /// Look up a member by canonical ID.
    pub fn find_member(&self, member_id: &str) -> Option<&Member> {
        self.members.get(member_id)
    }

    /// All orders belonging to a member, in dataset order. Empty when the
    /// member is unknown or has no orders.
    pub fn list_orders(&self, member_id: &str) -> Vec<&Order> {
        self.member_orders
            .get(member_id)
            .map(|ids| ids.iter().filter_map(|id| self.orders.get(id)).collect())
            .unwrap_or_default()
    }

    /// Look up an order by canonical ID.
    pub fn get_order(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    /// Total refills remaining across all prescriptions in an order.
    pub fn get_refills(&self, order_id: &str) -> Option<u32> {
        self.orders
            .get(order_id)
            .map(|o| o.prescriptions.iter().map(|rx| rx.refills_remaining).sum())
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PharmacyStore {
        PharmacyStore::bundled().expect("bundled dataset must load")
    }

    #[test]
    fn test_bundled_dataset_loads() {
        let store = store();
        assert!(store.member_count() >= 3);
        assert!(store.order_count() >= 4);
    }

    #[test]
    fn test_find_member() {
        let store = store();
        let member = store.find_member("M1001").expect("M1001 exists");
        assert_eq!(member.name, "Sarah Mitchell");
        assert!(store.find_member("M9999").is_none());
    }

    #[test]
    fn test_list_orders_referential_invariant() {
        let store = store();
        // No order returned for a member may belong to anyone else
        for member_id in ["M1001", "M1002", "M1003"] {
            for order in store.list_orders(member_id) {
                assert_eq!(normalize_id(&order.member_id).unwrap(), member_id);
            }
        }
        assert!(store.list_orders("M9999").is_empty());
    }

    #[test]
    fn test_spec_scenario_member_orders() {
        let store = store();
        assert!(store.find_member("M1001").is_some());

        let orders = store.list_orders("M1001");
        assert!(!orders.is_empty());

        let processing = orders
            .iter()
            .find(|o| o.status == "processing")
            .expect("M1001 has a processing order");
        assert!(processing
            .prescriptions
            .iter()
            .any(|rx| rx.name == "Amoxicillin 500mg"));
    }

    #[test]
    fn test_get_refills_sums_prescriptions() {
        let store = store();
        // ORD001 carries 2 + 0 refills across its two prescriptions
        assert_eq!(store.get_refills("ORD001"), Some(2));
        assert_eq!(store.get_refills("ORD999"), None);
    }

    #[test]
    fn test_dangling_member_reference_rejected() {
        let raw = r#"{
            "members": [{"member_id": "M1", "name": "A"}],
            "orders": [{
                "order_id": "ORD1", "member_id": "M2", "status": "processing",
                "expected_pickup_time": "2025-01-01T00:00:00Z", "prescriptions": []
            }]
        }"#;
        assert!(PharmacyStore::from_json(raw).is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let raw = r#"{
            "members": [
                {"member_id": "M1", "name": "A"},
                {"member_id": "m 1", "name": "B"}
            ],
            "orders": []
        }"#;
        // "m 1" normalizes to the same key as "M1"
        assert!(PharmacyStore::from_json(raw).is_err());
    }
}
