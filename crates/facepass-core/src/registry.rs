//! In-memory roster of enrolled identities backed by an injected
//! persistence port.
//!
//! Readers take an `Arc` snapshot of the whole roster; writers build a new
//! roster, persist it, then swap the snapshot. A match in progress therefore
//! sees either the old or the new roster, never a half-written identity.

use crate::types::{normalize_email, EncodedImage, Embedding, EnrollmentRequest, Identity};
use chrono::{SecondsFormat, Utc};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("roster backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("stored roster is invalid: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("an identity with email {0} is already enrolled")]
    DuplicateEmail(String),
    #[error("no identity with id {0}")]
    NotFound(String),
    #[error("invalid profile: {0}")]
    InvalidProfile(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Durable key-value surface for the roster and the active identity.
pub trait RosterStore: Send + Sync {
    fn load_roster(&self) -> Result<Vec<Identity>, PersistenceError>;
    fn save_roster(&self, roster: &[Identity]) -> Result<(), PersistenceError>;
    fn load_active_identity_id(&self) -> Result<Option<String>, PersistenceError>;
    fn save_active_identity_id(&self, id: Option<&str>) -> Result<(), PersistenceError>;
}

impl<S: RosterStore + ?Sized> RosterStore for Arc<S> {
    fn load_roster(&self) -> Result<Vec<Identity>, PersistenceError> {
        (**self).load_roster()
    }

    fn save_roster(&self, roster: &[Identity]) -> Result<(), PersistenceError> {
        (**self).save_roster(roster)
    }

    fn load_active_identity_id(&self) -> Result<Option<String>, PersistenceError> {
        (**self).load_active_identity_id()
    }

    fn save_active_identity_id(&self, id: Option<&str>) -> Result<(), PersistenceError> {
        (**self).save_active_identity_id(id)
    }
}

/// Process-local store, for tests and UI prototypes without durable storage.
#[derive(Debug, Default)]
pub struct MemoryRosterStore {
    roster: Mutex<Vec<Identity>>,
    active: Mutex<Option<String>>,
}

impl MemoryRosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roster(roster: Vec<Identity>) -> Self {
        Self {
            roster: Mutex::new(roster),
            active: Mutex::new(None),
        }
    }
}

impl RosterStore for MemoryRosterStore {
    fn load_roster(&self) -> Result<Vec<Identity>, PersistenceError> {
        Ok(self.roster.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save_roster(&self, roster: &[Identity]) -> Result<(), PersistenceError> {
        *self.roster.lock().unwrap_or_else(PoisonError::into_inner) = roster.to_vec();
        Ok(())
    }

    fn load_active_identity_id(&self) -> Result<Option<String>, PersistenceError> {
        Ok(self.active.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save_active_identity_id(&self, id: Option<&str>) -> Result<(), PersistenceError> {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = id.map(str::to_string);
        Ok(())
    }
}

/// Immutable view of the roster at one point in time.
#[derive(Debug, Clone)]
pub struct RosterSnapshot {
    identities: Arc<Vec<Identity>>,
}

impl RosterSnapshot {
    /// `(id, embedding)` pairs in enrollment order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Embedding)> + '_ {
        self.identities
            .iter()
            .map(|identity| (identity.id.as_str(), &identity.embedding))
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn get(&self, id: &str) -> Option<&Identity> {
        self.identities.iter().find(|identity| identity.id == id)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

pub struct EnrollmentRegistry<S> {
    store: S,
    current: RwLock<Arc<Vec<Identity>>>,
    active: RwLock<Option<String>>,
    /// Serializes read-modify-persist-swap sequences.
    writer: Mutex<()>,
}

impl<S: RosterStore> EnrollmentRegistry<S> {
    /// Load the persisted roster and active identity.
    pub fn load(store: S) -> Result<Self, RegistryError> {
        let roster = store.load_roster()?;
        let mut active = store.load_active_identity_id()?;
        if let Some(id) = &active {
            if !roster.iter().any(|identity| &identity.id == id) {
                tracing::warn!(identity = %id, "active identity no longer enrolled; clearing");
                active = None;
            }
        }
        tracing::info!(enrolled = roster.len(), active = ?active, "roster loaded");

        Ok(Self {
            store,
            current: RwLock::new(Arc::new(roster)),
            active: RwLock::new(active),
            writer: Mutex::new(()),
        })
    }

    /// Enroll a new identity. The first identity in an empty roster becomes
    /// privileged; the emptiness check and the insertion happen under the
    /// same writer lock.
    pub fn add(&self, request: EnrollmentRequest) -> Result<Identity, RegistryError> {
        let display_name = request.display_name.trim().to_string();
        let email = request.email.trim().to_string();
        if display_name.is_empty() {
            return Err(RegistryError::InvalidProfile("display name is empty".into()));
        }
        if !email.contains('@') {
            return Err(RegistryError::InvalidProfile(format!(
                "'{email}' is not an email address"
            )));
        }

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot_arc();

        let key = normalize_email(&email);
        if current.iter().any(|identity| normalize_email(&identity.email) == key) {
            return Err(RegistryError::DuplicateEmail(email));
        }

        let identity = Identity {
            id: Uuid::new_v4().to_string(),
            display_name,
            email,
            raw_image: request.raw_image,
            enhanced_image: request.enhanced_image,
            embedding: request.embedding,
            is_privileged: current.is_empty(),
            enrolled_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(identity.clone());
        self.commit(next)?;

        tracing::info!(
            identity = %identity.id,
            privileged = identity.is_privileged,
            "identity enrolled"
        );
        Ok(identity)
    }

    /// Replace the embedding and images of an enrolled identity.
    pub fn update_embedding(
        &self,
        id: &str,
        embedding: Embedding,
        raw_image: EncodedImage,
        enhanced_image: EncodedImage,
    ) -> Result<Identity, RegistryError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<Identity> = self.snapshot_arc().as_ref().clone();

        let identity = next
            .iter_mut()
            .find(|identity| identity.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        identity.embedding = embedding;
        identity.raw_image = raw_image;
        identity.enhanced_image = enhanced_image;
        let updated = identity.clone();

        self.commit(next)?;
        tracing::info!(identity = %id, "identity embedding updated");
        Ok(updated)
    }

    /// Delete an identity. The privileged flag is fixed at enrollment and is
    /// not handed to anyone else.
    pub fn remove(&self, id: &str) -> Result<Identity, RegistryError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<Identity> = self.snapshot_arc().as_ref().clone();

        let pos = next
            .iter()
            .position(|identity| identity.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let removed = next.remove(pos);

        // Clear the persisted active id before the roster drops the identity,
        // so a failure at either step leaves the identity enrolled.
        let was_active = read(&self.active).as_deref() == Some(id);
        if was_active {
            self.store.save_active_identity_id(None)?;
        }
        if let Err(err) = self.commit(next) {
            if was_active {
                if let Err(restore) = self.store.save_active_identity_id(Some(id)) {
                    tracing::warn!(identity = %id, error = %restore, "failed to restore active identity");
                }
            }
            return Err(err);
        }
        if was_active {
            *write(&self.active) = None;
        }

        tracing::info!(identity = %id, "identity removed");
        Ok(removed)
    }

    /// Snapshot of `(id, embedding)` pairs in enrollment order.
    pub fn list_roster(&self) -> RosterSnapshot {
        RosterSnapshot {
            identities: self.snapshot_arc(),
        }
    }

    /// Informational only: `add` re-checks under its own lock.
    pub fn is_first_enrollment(&self) -> bool {
        self.snapshot_arc().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Identity> {
        self.list_roster().get(id).cloned()
    }

    /// The identity currently logged in, if any.
    pub fn active(&self) -> Option<Identity> {
        let id = read(&self.active).clone()?;
        self.get(&id)
    }

    /// Set (login) or clear (logout) the active identity.
    pub fn set_active(&self, id: Option<&str>) -> Result<(), RegistryError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = id {
            if !self.snapshot_arc().iter().any(|identity| identity.id == id) {
                return Err(RegistryError::NotFound(id.to_string()));
            }
        }
        self.store.save_active_identity_id(id)?;
        *write(&self.active) = id.map(str::to_string);
        tracing::debug!(active = ?id, "active identity changed");
        Ok(())
    }

    fn snapshot_arc(&self) -> Arc<Vec<Identity>> {
        Arc::clone(&read(&self.current))
    }

    /// Persist first; only a successful save is published to readers.
    fn commit(&self, next: Vec<Identity>) -> Result<(), RegistryError> {
        self.store.save_roster(&next)?;
        *write(&self.current) = Arc::new(next);
        Ok(())
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn request(email: &str, values: &[f32]) -> EnrollmentRequest {
        EnrollmentRequest {
            display_name: "Test User".into(),
            email: email.into(),
            raw_image: EncodedImage::png(vec![1, 2, 3]),
            enhanced_image: EncodedImage::png(vec![4, 5, 6]),
            embedding: Embedding::new(values.to_vec()),
        }
    }

    fn registry() -> EnrollmentRegistry<Arc<MemoryRosterStore>> {
        EnrollmentRegistry::load(Arc::new(MemoryRosterStore::new())).unwrap()
    }

    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryRosterStore,
        fail: AtomicBool,
        fail_active: AtomicBool,
    }

    impl RosterStore for FlakyStore {
        fn load_roster(&self) -> Result<Vec<Identity>, PersistenceError> {
            self.inner.load_roster()
        }

        fn save_roster(&self, roster: &[Identity]) -> Result<(), PersistenceError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PersistenceError::Backend("disk full".into()));
            }
            self.inner.save_roster(roster)
        }

        fn load_active_identity_id(&self) -> Result<Option<String>, PersistenceError> {
            self.inner.load_active_identity_id()
        }

        fn save_active_identity_id(&self, id: Option<&str>) -> Result<(), PersistenceError> {
            if self.fail_active.load(Ordering::SeqCst) {
                return Err(PersistenceError::Backend("settings table locked".into()));
            }
            self.inner.save_active_identity_id(id)
        }
    }

    #[test]
    fn test_first_enrollment_is_privileged() {
        let reg = registry();
        assert!(reg.is_first_enrollment());
        let first = reg.add(request("a@example.com", &[0.1])).unwrap();
        let second = reg.add(request("b@example.com", &[0.2])).unwrap();
        assert!(first.is_privileged);
        assert!(!second.is_privileged);
        assert!(!reg.is_first_enrollment());
    }

    #[test]
    fn test_duplicate_email_leaves_roster_unchanged() {
        let reg = registry();
        reg.add(request("a@example.com", &[0.1])).unwrap();
        let before = reg.list_roster();

        let err = reg.add(request(" A@Example.com ", &[0.9])).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateEmail(_)));

        let after = reg.list_roster();
        assert_eq!(after.identities(), before.identities());
    }

    #[test]
    fn test_add_rejects_blank_profile() {
        let reg = registry();
        let mut req = request("a@example.com", &[0.1]);
        req.display_name = "   ".into();
        assert!(matches!(reg.add(req), Err(RegistryError::InvalidProfile(_))));
        assert!(matches!(
            reg.add(request("not-an-email", &[0.1])),
            Err(RegistryError::InvalidProfile(_))
        ));
    }

    #[test]
    fn test_add_persists_through_store() {
        let store = Arc::new(MemoryRosterStore::new());
        let reg = EnrollmentRegistry::load(Arc::clone(&store)).unwrap();
        let added = reg.add(request("a@example.com", &[0.1])).unwrap();

        let persisted = store.load_roster().unwrap();
        assert_eq!(persisted, vec![added.clone()]);

        let reloaded = EnrollmentRegistry::load(Arc::clone(&store)).unwrap();
        assert_eq!(reloaded.get(&added.id), Some(added));
    }

    #[test]
    fn test_roster_iterates_in_insertion_order() {
        let reg = registry();
        let ids: Vec<String> = ["c@x.io", "a@x.io", "b@x.io"]
            .iter()
            .enumerate()
            .map(|(i, email)| reg.add(request(email, &[i as f32])).unwrap().id)
            .collect();

        let snapshot = reg.list_roster();
        let listed: Vec<&str> = snapshot.iter().map(|(id, _)| id).collect();
        assert_eq!(listed, ids.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn test_snapshot_is_stable_across_writes() {
        let reg = registry();
        reg.add(request("a@example.com", &[0.1])).unwrap();
        let snapshot = reg.list_roster();
        reg.add(request("b@example.com", &[0.2])).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(reg.list_roster().len(), 2);
    }

    #[test]
    fn test_update_embedding() {
        let reg = registry();
        let added = reg.add(request("a@example.com", &[0.1, 0.1])).unwrap();
        let updated = reg
            .update_embedding(
                &added.id,
                Embedding::new(vec![0.7, 0.7]),
                EncodedImage::png(vec![9]),
                EncodedImage::png(vec![8]),
            )
            .unwrap();
        assert_eq!(updated.embedding.as_slice(), &[0.7, 0.7]);
        assert_eq!(updated.is_privileged, added.is_privileged);
        assert_eq!(reg.get(&added.id).unwrap().raw_image.bytes, vec![9]);
    }

    #[test]
    fn test_update_unknown_id() {
        let reg = registry();
        let err = reg
            .update_embedding(
                "missing",
                Embedding::new(vec![0.0]),
                EncodedImage::png(vec![]),
                EncodedImage::png(vec![]),
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(id) if id == "missing"));
    }

    #[test]
    fn test_failed_save_is_not_published() {
        let store = Arc::new(FlakyStore::default());
        let reg = EnrollmentRegistry::load(Arc::clone(&store)).unwrap();
        reg.add(request("a@example.com", &[0.1])).unwrap();

        store.fail.store(true, Ordering::SeqCst);
        let err = reg.add(request("b@example.com", &[0.2])).unwrap_err();
        assert!(matches!(err, RegistryError::Persistence(_)));
        assert_eq!(reg.list_roster().len(), 1);
    }

    #[test]
    fn test_remove_of_active_identity_is_all_or_nothing() {
        let store = Arc::new(FlakyStore::default());
        let reg = EnrollmentRegistry::load(Arc::clone(&store)).unwrap();
        let alice = reg.add(request("a@example.com", &[0.1])).unwrap();
        reg.set_active(Some(&alice.id)).unwrap();

        store.fail_active.store(true, Ordering::SeqCst);
        assert!(matches!(reg.remove(&alice.id), Err(RegistryError::Persistence(_))));
        assert_eq!(reg.list_roster().len(), 1);
        assert_eq!(store.inner.load_roster().unwrap().len(), 1);
        assert_eq!(reg.active().map(|i| i.id), Some(alice.id.clone()));

        store.fail_active.store(false, Ordering::SeqCst);
        store.fail.store(true, Ordering::SeqCst);
        assert!(matches!(reg.remove(&alice.id), Err(RegistryError::Persistence(_))));
        assert_eq!(reg.list_roster().len(), 1);
        assert_eq!(
            store.inner.load_active_identity_id().unwrap(),
            Some(alice.id.clone())
        );

        store.fail.store(false, Ordering::SeqCst);
        reg.remove(&alice.id).unwrap();
        assert!(reg.list_roster().is_empty());
        assert_eq!(reg.active(), None);
        assert_eq!(store.inner.load_active_identity_id().unwrap(), None);
    }

    #[test]
    fn test_remove_clears_active_and_keeps_privilege_fixed() {
        let reg = registry();
        let admin = reg.add(request("admin@example.com", &[0.1])).unwrap();
        let other = reg.add(request("other@example.com", &[0.2])).unwrap();
        reg.set_active(Some(&admin.id)).unwrap();

        reg.remove(&admin.id).unwrap();
        assert_eq!(reg.active(), None);
        assert!(!reg.get(&other.id).unwrap().is_privileged);
        assert!(matches!(reg.remove(&admin.id), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_set_active_requires_enrolled_identity() {
        let reg = registry();
        assert!(matches!(
            reg.set_active(Some("ghost")),
            Err(RegistryError::NotFound(_))
        ));
        let added = reg.add(request("a@example.com", &[0.1])).unwrap();
        reg.set_active(Some(&added.id)).unwrap();
        assert_eq!(reg.active().map(|i| i.id), Some(added.id));
        reg.set_active(None).unwrap();
        assert_eq!(reg.active(), None);
    }

    #[test]
    fn test_load_drops_dangling_active_id() {
        let store = MemoryRosterStore::new();
        store.save_active_identity_id(Some("gone")).unwrap();
        let reg = EnrollmentRegistry::load(store).unwrap();
        assert_eq!(reg.active(), None);
    }

    #[test]
    fn test_concurrent_first_enrollments_single_privileged() {
        let reg = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    reg.add(request(&format!("user{i}@example.com"), &[i as f32]))
                        .unwrap()
                })
            })
            .collect();
        let added: Vec<Identity> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(added.iter().filter(|i| i.is_privileged).count(), 1);
        assert_eq!(reg.list_roster().len(), 8);
    }
}
