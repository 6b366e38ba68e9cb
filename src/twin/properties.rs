//! Local mirror of device-twin properties.
//!
//! The store is the single owner of local property state. Local writes are
//! optimistic and marked pending until the cloud confirms them; inbound
//! cloud updates are authoritative and clear any pending marker for the
//! same id (last authoritative write wins, not last-writer-wins by time).

use crate::cloud::{PROPERTY_COMPONENT, Twin};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertySource {
    /// Local write awaiting cloud confirmation.
    LocalPending,
    /// Value confirmed (or dictated) by the cloud twin.
    CloudAcknowledged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub id: String,
    pub value: Value,
    pub source: PropertySource,
}

/// Upload capability the store uses for local writes; implemented by the
/// connection session.
#[async_trait]
pub trait PropertyUplink: Send + Sync {
    async fn upload_property(&self, patch: Value) -> Result<()>;
}

pub struct PropertyStore {
    props: Mutex<BTreeMap<String, Property>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self {
            props: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Property> {
        self.props.lock().get(id).cloned()
    }

    /// Snapshot of all properties, ordered by id.
    pub fn snapshot(&self) -> Vec<Property> {
        self.props.lock().values().cloned().collect()
    }

    /// Seed the mirror from a freshly fetched twin. Desired values are
    /// authoritative and land acknowledged; reported values confirm a
    /// matching pending write and fill ids not otherwise present.
    pub fn seed_from_twin(&self, twin: &Twin) {
        let mut props = self.props.lock();

        for (name, value) in flatten_twin_section(&twin.reported) {
            match props.get_mut(&name) {
                Some(existing) => {
                    if existing.source == PropertySource::LocalPending && existing.value == value {
                        existing.source = PropertySource::CloudAcknowledged;
                    }
                }
                None => {
                    props.insert(
                        name.clone(),
                        Property {
                            id: name,
                            value,
                            source: PropertySource::CloudAcknowledged,
                        },
                    );
                }
            }
        }

        for (name, value) in flatten_twin_section(&twin.desired) {
            props.insert(
                name.clone(),
                Property {
                    id: name,
                    value,
                    source: PropertySource::CloudAcknowledged,
                },
            );
        }

        debug!("[Properties] Seeded {} properties from twin", props.len());
    }

    /// Apply a cloud-originated update. The raw value may arrive wrapped in
    /// a named component (`{"__t":"c", name: value}`); exactly one inner
    /// pair is unwrapped, more than one is a fatal validation error. Returns
    /// the applied pair for acknowledgement.
    pub fn apply_cloud_update(&self, name: &str, value: &Value) -> Result<(String, Value)> {
        let (name, value) = unwrap_component(name, value)?;
        let mut props = self.props.lock();
        // Cloud is authoritative on conflict: a pending local write for the
        // same id is superseded and its marker cleared.
        props.insert(
            name.clone(),
            Property {
                id: name.clone(),
                value: value.clone(),
                source: PropertySource::CloudAcknowledged,
            },
        );
        info!("[Properties] {} <- {} (cloud)", name, value);
        Ok((name, value))
    }

    /// Local (UI-initiated) write: mark pending, upload through the session.
    /// On upload failure the property reverts to its last acknowledged value
    /// and the error is returned. On success it stays pending until a cloud
    /// acknowledgement or the next full twin fetch confirms it.
    pub async fn write(&self, id: &str, value: Value, uplink: &dyn PropertyUplink) -> Result<()> {
        let previous = {
            let mut props = self.props.lock();
            if let Some(existing) = props.get(id)
                && existing.source == PropertySource::LocalPending
            {
                return Err(AgentError::PropertyWritePending(id.to_string()));
            }
            let previous = props.get(id).cloned();
            props.insert(
                id.to_string(),
                Property {
                    id: id.to_string(),
                    value: value.clone(),
                    source: PropertySource::LocalPending,
                },
            );
            previous
        };

        match uplink.upload_property(json!({ id: value })).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut props = self.props.lock();
                // Revert only if the pending write is still ours; a cloud
                // update that raced in already won.
                let still_pending = props
                    .get(id)
                    .map(|p| p.source == PropertySource::LocalPending)
                    .unwrap_or(false);
                if still_pending {
                    match previous {
                        Some(prev) => {
                            props.insert(id.to_string(), prev);
                        }
                        None => {
                            props.remove(id);
                        }
                    }
                }
                Err(AgentError::PropertyUploadFailed(e.to_string()))
            }
        }
    }

    /// Component-wrapped patch carrying the full current local set, used to
    /// reconcile cloud state on (re)connect.
    pub fn reported_patch(&self) -> Value {
        let mut component = Map::new();
        component.insert("__t".to_string(), Value::String("c".to_string()));
        for property in self.props.lock().values() {
            component.insert(property.id.clone(), property.value.clone());
        }
        json!({ PROPERTY_COMPONENT: component })
    }
}

impl Default for PropertyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Unwrap a component-wrapped `(name, value)` pair. Per-message updates
/// carry exactly one inner pair; anything else is rejected.
fn unwrap_component(name: &str, value: &Value) -> Result<(String, Value)> {
    if let Value::Object(map) = value
        && map.get("__t").and_then(Value::as_str) == Some("c")
    {
        let inner: Vec<(&String, &Value)> = map
            .iter()
            .filter(|(k, _)| *k != "__t" && !k.starts_with('$'))
            .collect();
        if inner.len() != 1 {
            return Err(AgentError::InvalidPropertyUpdate(format!(
                "component update for {} carries {} inner values, expected 1",
                name,
                inner.len()
            )));
        }
        return Ok((inner[0].0.clone(), inner[0].1.clone()));
    }
    Ok((name.to_string(), value.clone()))
}

/// Flatten a twin section, expanding component wrappers. Full documents may
/// legitimately carry several members per component; the single-pair rule
/// applies to per-message updates only.
fn flatten_twin_section(section: &Map<String, Value>) -> Vec<(String, Value)> {
    let mut flat = Vec::new();
    for (name, value) in section {
        if name.starts_with('$') {
            continue;
        }
        if let Value::Object(map) = value
            && map.get("__t").and_then(Value::as_str) == Some("c")
        {
            for (inner_name, inner_value) in map {
                if inner_name != "__t" && !inner_name.starts_with('$') {
                    flat.push((inner_name.clone(), inner_value.clone()));
                }
            }
        } else {
            flat.push((name.clone(), value.clone()));
        }
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubUplink {
        fail: AtomicBool,
        sent: Mutex<Vec<Value>>,
    }

    impl StubUplink {
        fn new() -> Self {
            Self {
                fail: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PropertyUplink for StubUplink {
        async fn upload_property(&self, patch: Value) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AgentError::SendFailed("stub".into()));
            }
            self.sent.lock().push(patch);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cloud_update_supersedes_pending_write() {
        let store = PropertyStore::new();
        let uplink = StubUplink::new();

        store.write("fanSpeed", json!(1), &uplink).await.unwrap();
        assert_eq!(store.get("fanSpeed").unwrap().source, PropertySource::LocalPending);

        // Cloud update for the same id arrives before any acknowledgement.
        store.apply_cloud_update("fanSpeed", &json!(2)).unwrap();

        let property = store.get("fanSpeed").unwrap();
        assert_eq!(property.value, json!(2));
        assert_eq!(property.source, PropertySource::CloudAcknowledged);
    }

    #[tokio::test]
    async fn test_failed_write_reverts_to_acknowledged_value() {
        let store = PropertyStore::new();
        let uplink = StubUplink::new();

        store.apply_cloud_update("brightness", &json!(40)).unwrap();

        uplink.fail.store(true, Ordering::SeqCst);
        let result = store.write("brightness", json!(90), &uplink).await;
        assert!(result.is_err());

        let property = store.get("brightness").unwrap();
        assert_eq!(property.value, json!(40));
        assert_eq!(property.source, PropertySource::CloudAcknowledged);
    }

    #[tokio::test]
    async fn test_failed_write_of_new_property_removes_it() {
        let store = PropertyStore::new();
        let uplink = StubUplink::new();
        uplink.fail.store(true, Ordering::SeqCst);

        assert!(store.write("label", json!("x"), &uplink).await.is_err());
        assert!(store.get("label").is_none());
    }

    #[tokio::test]
    async fn test_second_write_while_pending_is_rejected() {
        let store = PropertyStore::new();
        let uplink = StubUplink::new();

        store.write("fanSpeed", json!(1), &uplink).await.unwrap();
        let second = store.write("fanSpeed", json!(3), &uplink).await;
        assert!(matches!(second, Err(AgentError::PropertyWritePending(_))));
    }

    #[test]
    fn test_component_wrapper_unwraps_single_pair() {
        let store = PropertyStore::new();
        let wrapped = json!({"__t": "c", "fanSpeed": 3});
        let (name, value) = store.apply_cloud_update("settings", &wrapped).unwrap();
        assert_eq!(name, "fanSpeed");
        assert_eq!(value, json!(3));
        assert_eq!(store.get("fanSpeed").unwrap().value, json!(3));
    }

    #[test]
    fn test_component_wrapper_with_multiple_pairs_is_fatal() {
        let store = PropertyStore::new();
        let wrapped = json!({"__t": "c", "fanSpeed": 3, "brightness": 50});
        let result = store.apply_cloud_update("settings", &wrapped);
        assert!(matches!(result, Err(AgentError::InvalidPropertyUpdate(_))));
        assert!(store.get("fanSpeed").is_none());
    }

    #[tokio::test]
    async fn test_twin_fetch_confirms_matching_pending_write() {
        let store = PropertyStore::new();
        let uplink = StubUplink::new();
        store.write("fanSpeed", json!(4), &uplink).await.unwrap();

        let mut reported = Map::new();
        reported.insert("fanSpeed".to_string(), json!(4));
        let twin = Twin {
            reported,
            ..Twin::default()
        };
        store.seed_from_twin(&twin);

        assert_eq!(
            store.get("fanSpeed").unwrap().source,
            PropertySource::CloudAcknowledged
        );
    }

    #[test]
    fn test_seed_expands_component_members() {
        let store = PropertyStore::new();
        let mut desired = Map::new();
        desired.insert(
            "settings".to_string(),
            json!({"__t": "c", "fanSpeed": 2, "brightness": 70}),
        );
        desired.insert("$version".to_string(), json!(7));
        let twin = Twin {
            desired,
            ..Twin::default()
        };
        store.seed_from_twin(&twin);

        assert_eq!(store.get("fanSpeed").unwrap().value, json!(2));
        assert_eq!(store.get("brightness").unwrap().value, json!(70));
        assert!(store.get("$version").is_none());
    }

    #[test]
    fn test_reported_patch_is_component_wrapped() {
        let store = PropertyStore::new();
        store.apply_cloud_update("fanSpeed", &json!(2)).unwrap();

        let patch = store.reported_patch();
        let component = patch.get(PROPERTY_COMPONENT).unwrap();
        assert_eq!(component.get("__t").unwrap(), "c");
        assert_eq!(component.get("fanSpeed").unwrap(), &json!(2));
    }
}
