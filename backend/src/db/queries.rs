//! # Database Queries
//!
//! Typed accessors over the key-value [`Store`]. Each function reads or
//! writes one record family; services never build keys by hand.
//!
//! ## Query Organization
//!
//! - `*_case*` - Case records
//! - `*_zone*` / `*_geofence_status*` - Geofence records
//! - `*_volunteer*` - Volunteer records
//! - `*_match*` - Match records
//! - `put_audit_record` - Audit trail
//!
//! ## Error Handling
//!
//! All queries return `Result<T, StoreError>`. A missing record is
//! `Ok(None)`, never an error.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::{Store, StoreError};

// ============================================
// KEYS
// ============================================

pub const CASE_PREFIX: &str = "case:";
pub const VOLUNTEER_PREFIX: &str = "volunteer:";
pub const MATCH_PREFIX: &str = "match:";
pub const ZONE_PREFIX: &str = "zone:";
pub const GEOSTATUS_PREFIX: &str = "geostatus:";
pub const AUDIT_PREFIX: &str = "audit:";

pub fn case_key(id: &Uuid) -> String {
    format!("{}{}", CASE_PREFIX, id)
}

pub fn volunteer_key(id: &str) -> String {
    format!("{}{}", VOLUNTEER_PREFIX, id)
}

pub fn match_key(id: &Uuid) -> String {
    format!("{}{}", MATCH_PREFIX, id)
}

pub fn zone_key(id: &Uuid) -> String {
    format!("{}{}", ZONE_PREFIX, id)
}

pub fn geofence_status_key(subject_id: &str, zone_id: &Uuid) -> String {
    format!("{}{}:{}", GEOSTATUS_PREFIX, subject_id, zone_id)
}

// ============================================
// HELPER FUNCTIONS
// ============================================

async fn load<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::Serialization {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

async fn save<T: Serialize>(store: &dyn Store, key: &str, record: &T) -> Result<(), StoreError> {
    let value = serde_json::to_value(record).map_err(|e| StoreError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    store.put(key, value).await
}

async fn load_all<T: DeserializeOwned>(store: &dyn Store, prefix: &str) -> Result<Vec<T>, StoreError> {
    store
        .scan(prefix)
        .await?
        .into_iter()
        .map(|(key, value)| {
            serde_json::from_value(value).map_err(|e| StoreError::Serialization {
                key,
                reason: e.to_string(),
            })
        })
        .collect()
}

// ============================================
// CASE QUERIES
// ============================================

pub async fn get_case(store: &dyn Store, id: &Uuid) -> Result<Option<Case>, StoreError> {
    load(store, &case_key(id)).await
}

pub async fn put_case(store: &dyn Store, case: &Case) -> Result<(), StoreError> {
    debug!("Saving case {} ({})", case.id, case.status);
    save(store, &case_key(&case.id), case).await
}

/// All cases in creation order.
pub async fn list_cases(store: &dyn Store) -> Result<Vec<Case>, StoreError> {
    load_all(store, CASE_PREFIX).await
}

/// The most recent open case linked to a monitored subject.
pub async fn find_open_case_for_subject(
    store: &dyn Store,
    subject_id: &str,
) -> Result<Option<Case>, StoreError> {
    let cases = list_cases(store).await?;
    Ok(cases
        .into_iter()
        .rev()
        .find(|c| c.status.is_open() && c.subject_id.as_deref() == Some(subject_id)))
}

// ============================================
// GEOFENCE QUERIES
// ============================================

pub async fn get_zone(store: &dyn Store, id: &Uuid) -> Result<Option<GeofenceZone>, StoreError> {
    load(store, &zone_key(id)).await
}

pub async fn put_zone(store: &dyn Store, zone: &GeofenceZone) -> Result<(), StoreError> {
    save(store, &zone_key(&zone.id), zone).await
}

pub async fn list_zones_for_subject(
    store: &dyn Store,
    subject_id: &str,
) -> Result<Vec<GeofenceZone>, StoreError> {
    let zones: Vec<GeofenceZone> = load_all(store, ZONE_PREFIX).await?;
    Ok(zones.into_iter().filter(|z| z.subject_id == subject_id).collect())
}

pub async fn get_geofence_status(
    store: &dyn Store,
    subject_id: &str,
    zone_id: &Uuid,
) -> Result<Option<GeofenceStatus>, StoreError> {
    load(store, &geofence_status_key(subject_id, zone_id)).await
}

pub async fn put_geofence_status(store: &dyn Store, status: &GeofenceStatus) -> Result<(), StoreError> {
    save(
        store,
        &geofence_status_key(&status.subject_id, &status.zone_id),
        status,
    )
    .await
}

pub async fn delete_geofence_status(
    store: &dyn Store,
    subject_id: &str,
    zone_id: &Uuid,
) -> Result<(), StoreError> {
    store.delete(&geofence_status_key(subject_id, zone_id)).await
}

// ============================================
// VOLUNTEER QUERIES
// ============================================

pub async fn get_volunteer(store: &dyn Store, id: &str) -> Result<Option<Volunteer>, StoreError> {
    load(store, &volunteer_key(id)).await
}

pub async fn put_volunteer(store: &dyn Store, volunteer: &Volunteer) -> Result<(), StoreError> {
    save(store, &volunteer_key(&volunteer.id), volunteer).await
}

pub async fn list_volunteers(store: &dyn Store) -> Result<Vec<Volunteer>, StoreError> {
    load_all(store, VOLUNTEER_PREFIX).await
}

// ============================================
// MATCH QUERIES
// ============================================

pub async fn get_match(store: &dyn Store, id: &Uuid) -> Result<Option<Match>, StoreError> {
    load(store, &match_key(id)).await
}

pub async fn put_match(store: &dyn Store, record: &Match) -> Result<(), StoreError> {
    save(store, &match_key(&record.id), record).await
}

pub async fn delete_match(store: &dyn Store, id: &Uuid) -> Result<(), StoreError> {
    store.delete(&match_key(id)).await
}

pub async fn list_matches(store: &dyn Store) -> Result<Vec<Match>, StoreError> {
    load_all(store, MATCH_PREFIX).await
}

pub async fn list_matches_for_case(store: &dyn Store, case_id: &Uuid) -> Result<Vec<Match>, StoreError> {
    let matches = list_matches(store).await?;
    Ok(matches.into_iter().filter(|m| &m.case_id == case_id).collect())
}

// ============================================
// AUDIT QUERIES
// ============================================

pub async fn put_audit_record(store: &dyn Store, record: &AuditRecord) -> Result<(), StoreError> {
    save(store, &format!("{}{}", AUDIT_PREFIX, record.id), record).await
}

pub async fn list_audit_records(store: &dyn Store) -> Result<Vec<AuditRecord>, StoreError> {
    load_all(store, AUDIT_PREFIX).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use chrono::Utc;

    fn zone(subject: &str) -> GeofenceZone {
        GeofenceZone {
            id: Uuid::new_v4(),
            subject_id: subject.to_string(),
            name: "Home".to_string(),
            center: GeoPoint::new(24.8067, 120.9687),
            radius_meters: 100.0,
            alert_on_enter: false,
            alert_on_exit: true,
            active: true,
            emergency_contacts: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_key_is_composite() {
        let id = Uuid::nil();
        assert_eq!(
            geofence_status_key("p-1", &id),
            format!("geostatus:p-1:{}", id)
        );
    }

    #[tokio::test]
    async fn test_zones_are_filtered_by_subject() {
        let store = MemoryStore::new();
        put_zone(&store, &zone("p-1")).await.unwrap();
        put_zone(&store, &zone("p-2")).await.unwrap();

        let zones = list_zones_for_subject(&store, "p-1").await.unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].subject_id, "p-1");
    }

    #[tokio::test]
    async fn test_corrupt_record_reports_key() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store
            .put(&zone_key(&id), serde_json::json!({"bogus": true}))
            .await
            .unwrap();

        let err = get_zone(&store, &id).await.unwrap_err();
        assert!(err.to_string().contains(&zone_key(&id)));
    }
}
