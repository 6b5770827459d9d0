//! The object store interface used by the handlers, and an in-memory
//! implementation with compare-and-swap semantics.
use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject, ObjectMeta, TypeMeta};
use serde_json::json;
use snafu::ensure;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{
    AlreadyExistsSnafu, NotFoundSnafu, Result, ResourceVersionMismatchSnafu,
    ResourceVersionOnCreateSnafu, RetriesExhaustedSnafu,
};

/// Identifies a stored object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<impl Into<String>>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.map(Into::into),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Computes the object to persist from the currently stored one.
///
/// The store passes an empty object without UID if nothing is stored yet.
/// Implementations are called again with a fresh object whenever the store
/// detects a concurrent modification, so they must not carry state from one
/// call to the next.
#[async_trait]
pub trait UpdateObject: Send + Sync {
    async fn updated_object(&self, current: &DynamicObject) -> Result<DynamicObject>;
}

#[async_trait]
impl<F> UpdateObject for F
where
    F: Fn(&DynamicObject) -> Result<DynamicObject> + Send + Sync,
{
    async fn updated_object(&self, current: &DynamicObject) -> Result<DynamicObject> {
        self(current)
    }
}

/// Validation which runs right before an object is written.
#[async_trait]
pub trait ValidateObject: Send + Sync {
    async fn validate_create(&self, object: &DynamicObject) -> Result<()>;

    async fn validate_update(&self, object: &DynamicObject, old_object: &DynamicObject)
    -> Result<()>;
}

/// Skips validation entirely.
#[derive(Clone, Copy, Debug, Default)]
pub struct SkipValidation;

#[async_trait]
impl ValidateObject for SkipValidation {
    async fn validate_create(&self, _object: &DynamicObject) -> Result<()> {
        Ok(())
    }

    async fn validate_update(
        &self,
        _object: &DynamicObject,
        _old_object: &DynamicObject,
    ) -> Result<()> {
        Ok(())
    }
}

/// The result of a successful write.
#[derive(Clone, Debug, PartialEq)]
pub struct Written {
    pub object: DynamicObject,
    pub created: bool,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// The resource of the objects kept in this store.
    fn resource(&self) -> &ApiResource;

    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// Persists a new object. Fails if an object with the same key exists.
    async fn create(
        &self,
        key: &ObjectKey,
        object: DynamicObject,
        validation: &dyn ValidateObject,
        dry_run: bool,
    ) -> Result<DynamicObject>;

    /// Reads the current object, computes the new one using `update` and
    /// writes it if the object was not modified in the meantime.
    ///
    /// On a concurrent modification the whole cycle is repeated, up to the
    /// store's retry bound. Any error returned by `update` or `validation`
    /// aborts immediately.
    ///
    /// If no object exists, `update` is called with an empty object and the
    /// result is created, provided `allow_create` is set.
    async fn guaranteed_update(
        &self,
        key: &ObjectKey,
        update: &dyn UpdateObject,
        validation: &dyn ValidateObject,
        allow_create: bool,
        dry_run: bool,
    ) -> Result<Written>;
}

/// How often and how fast an update is retried after a version race.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The total number of attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    resource_version: u64,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// An [`ObjectStore`] keeping all objects of a single resource in memory.
///
/// Every write assigns a new, monotonically increasing resource version.
/// Updates only succeed if the resource version is still the one the update
/// was computed from.
#[derive(Debug)]
pub struct InMemoryStore {
    resource: ApiResource,
    retry_policy: RetryPolicy,
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new(resource: ApiResource) -> Self {
        Self {
            resource,
            retry_policy: RetryPolicy::default(),
            state: Mutex::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Writes `object` unconditionally, as an external writer would.
    ///
    /// A UID is assigned if the object doesn't carry one already.
    pub async fn insert(&self, mut object: DynamicObject) -> DynamicObject {
        let key = ObjectKey::new(
            object.metadata.namespace.clone(),
            object.metadata.name.clone().unwrap_or_default(),
        );

        let mut state = self.state.lock().await;
        let existing_generation = state
            .objects
            .get(&key)
            .and_then(|existing| existing.metadata.generation);

        object.metadata.uid.get_or_insert_with(new_uid);
        object.metadata.generation = Some(existing_generation.map_or(1, |g| g + 1));
        object.metadata.resource_version = Some(state.next_resource_version());
        state.objects.insert(key, object.clone());
        object
    }

    /// An empty object of the store's resource, passed to updates if nothing
    /// is stored yet.
    fn empty_object(&self) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: self.resource.api_version.clone(),
                kind: self.resource.kind.clone(),
            }),
            metadata: ObjectMeta::default(),
            data: json!({}),
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    fn resource(&self) -> &ApiResource {
        &self.resource
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        Ok(self.state.lock().await.objects.get(key).cloned())
    }

    #[tracing::instrument(skip_all, fields(k8s.object.key = %key, dry_run = dry_run))]
    async fn create(
        &self,
        key: &ObjectKey,
        mut object: DynamicObject,
        validation: &dyn ValidateObject,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        ensure!(
            object.metadata.resource_version.is_none(),
            ResourceVersionOnCreateSnafu
        );
        ensure!(
            self.get(key).await?.is_none(),
            AlreadyExistsSnafu {
                resource: &self.resource.plural,
                name: &key.name,
            }
        );

        validation.validate_create(&object).await?;
        if dry_run {
            return Ok(object);
        }

        let mut state = self.state.lock().await;
        // Another writer might have been faster while validating
        ensure!(
            !state.objects.contains_key(key),
            AlreadyExistsSnafu {
                resource: &self.resource.plural,
                name: &key.name,
            }
        );

        object.metadata.uid = Some(new_uid());
        object.metadata.generation = Some(1);
        object.metadata.resource_version = Some(state.next_resource_version());
        state.objects.insert(key.clone(), object.clone());

        tracing::debug!(k8s.object.uid = ?object.metadata.uid, "created object");
        Ok(object)
    }

    #[tracing::instrument(skip_all, fields(k8s.object.key = %key, allow_create = allow_create, dry_run = dry_run))]
    async fn guaranteed_update(
        &self,
        key: &ObjectKey,
        update: &dyn UpdateObject,
        validation: &dyn ValidateObject,
        allow_create: bool,
        dry_run: bool,
    ) -> Result<Written> {
        let max_attempts = self.retry_policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let existing = self.get(key).await?;
            let current = existing.clone().unwrap_or_else(|| self.empty_object());
            let read_version = current.metadata.resource_version.clone();

            tracing::debug!(attempt, "computing updated object");
            let mut candidate = update.updated_object(&current).await?;

            match &existing {
                None => {
                    ensure!(
                        allow_create,
                        NotFoundSnafu {
                            resource: &self.resource.plural,
                            name: &key.name,
                        }
                    );
                    validation.validate_create(&candidate).await?;
                }
                Some(existing) => {
                    // A resourceVersion on the candidate is a precondition
                    // set by the client, violating it is not a race.
                    if let (Some(expected), Some(found)) = (
                        &existing.metadata.resource_version,
                        &candidate.metadata.resource_version,
                    ) {
                        ensure!(
                            expected == found,
                            ResourceVersionMismatchSnafu {
                                resource: &self.resource.plural,
                                name: &key.name,
                                expected,
                                found,
                            }
                        );
                    }
                    validation.validate_update(&candidate, existing).await?;
                }
            }

            if dry_run {
                return Ok(Written {
                    object: candidate,
                    created: existing.is_none(),
                });
            }

            let mut state = self.state.lock().await;
            let stored_version = state
                .objects
                .get(key)
                .and_then(|stored| stored.metadata.resource_version.clone());

            if stored_version != read_version {
                drop(state);
                tracing::debug!(
                    attempt,
                    ?read_version,
                    ?stored_version,
                    "object was modified concurrently, retrying"
                );
                if !self.retry_policy.backoff.is_zero() {
                    tokio::time::sleep(self.retry_policy.backoff).await;
                }
                continue;
            }

            let created = existing.is_none();
            match &existing {
                None => {
                    candidate.metadata.uid.get_or_insert_with(new_uid);
                    candidate.metadata.generation = Some(1);
                }
                Some(existing) => {
                    let generation = existing.metadata.generation.unwrap_or(1);
                    candidate.metadata.generation = Some(if existing.data == candidate.data {
                        generation
                    } else {
                        generation + 1
                    });
                }
            }
            candidate.metadata.resource_version = Some(state.next_resource_version());
            state.objects.insert(key.clone(), candidate.clone());

            tracing::debug!(
                attempt,
                created,
                k8s.object.resource_version = ?candidate.metadata.resource_version,
                "stored object"
            );
            return Ok(Written {
                object: candidate,
                created,
            });
        }

        tracing::warn!(
            attempts = max_attempts,
            "giving up after repeated concurrent modifications"
        );
        RetriesExhaustedSnafu {
            resource: &self.resource.plural,
            name: &key.name,
            attempts: max_attempts,
        }
        .fail()
    }
}

fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use kube::core::GroupVersionKind;
    use serde_json::json;

    use super::*;

    fn store() -> InMemoryStore {
        InMemoryStore::new(ApiResource::from_gvk(&GroupVersionKind::gvk(
            "", "v1", "ConfigMap",
        )))
    }

    fn config_map(name: &str, data: serde_json::Value) -> DynamicObject {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        DynamicObject::new(name, &resource)
            .within("default")
            .data(json!({ "data": data }))
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(Some("default"), name)
    }

    #[tokio::test]
    async fn create_assigns_identity() {
        let store = store();
        let created = store
            .create(&key("cm"), config_map("cm", json!({})), &SkipValidation, false)
            .await
            .expect("create succeeds");

        let uid = created.metadata.uid.as_deref().expect("uid is assigned");
        let uid = Uuid::parse_str(uid).expect("uid is a UUID");
        assert_eq!(uid.get_version(), Some(uuid::Version::Random));
        assert_eq!(created.metadata.generation, Some(1));
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

        let err = store
            .create(&key("cm"), config_map("cm", json!({})), &SkipValidation, false)
            .await
            .expect_err("second create conflicts");
        assert!(matches!(err, crate::Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn dry_run_create_is_not_persisted() {
        let store = store();
        store
            .create(&key("cm"), config_map("cm", json!({})), &SkipValidation, true)
            .await
            .expect("create succeeds");

        assert_eq!(store.get(&key("cm")).await.expect("get succeeds"), None);
    }

    #[tokio::test]
    async fn update_bumps_versions() {
        let store = store();
        let stored = store.insert(config_map("cm", json!({"a": "1"}))).await;

        let update = |current: &DynamicObject| -> Result<DynamicObject> {
            let mut next = current.clone();
            next.data["data"]["a"] = json!("2");
            Ok(next)
        };
        let written = store
            .guaranteed_update(&key("cm"), &update, &SkipValidation, false, false)
            .await
            .expect("update succeeds");

        assert!(!written.created);
        assert_eq!(written.object.metadata.uid, stored.metadata.uid);
        assert_eq!(written.object.metadata.generation, Some(2));
        assert_eq!(written.object.metadata.resource_version.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn update_without_create_is_not_found() {
        let update = |current: &DynamicObject| -> Result<DynamicObject> { Ok(current.clone()) };
        let err = store()
            .guaranteed_update(&key("cm"), &update, &SkipValidation, false, false)
            .await
            .expect_err("nothing to update");

        assert!(matches!(err, crate::Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn stale_resource_version_is_a_conflict() {
        let store = store();
        store.insert(config_map("cm", json!({"a": "1"}))).await;

        let update = |current: &DynamicObject| -> Result<DynamicObject> {
            let mut next = current.clone();
            next.metadata.resource_version = Some("0".to_owned());
            Ok(next)
        };
        let err = store
            .guaranteed_update(&key("cm"), &update, &SkipValidation, false, false)
            .await
            .expect_err("stale precondition");

        assert!(matches!(err, crate::Error::ResourceVersionMismatch { .. }));
    }
}
