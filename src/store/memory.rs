//! In-process store engine.
//!
//! Reference implementation of the [`Store`] trait: everything lives in
//! RwLock-guarded maps, updates take the write guard so per-document
//! mutations are atomic, and listings sort the way the secondary indexes of
//! a real document store would.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{
    Application, ApplicationStatus, AuditEvent, EmbeddingRecord, Identity, IdentityStatus, User,
};

use super::{
    paginate, ApplicationMutator, AuditQuery, IdentityMutator, Page, Store, StoreError,
    UserMutator,
};

#[derive(Default)]
struct Collections {
    applications: HashMap<Uuid, Application>,
    identities: HashMap<Uuid, Identity>,
    embeddings: HashMap<Uuid, EmbeddingRecord>,
    audit_events: Vec<AuditEvent>,
    users: HashMap<Uuid, User>,
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    data: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            data: RwLock::new(Collections::default()),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_application(&self, application: Application) -> Result<(), StoreError> {
        let mut data = self.data.write().expect("store lock poisoned");
        if data.applications.contains_key(&application.application_id) {
            return Err(StoreError::AlreadyExists(
                application.application_id.to_string(),
            ));
        }
        data.applications
            .insert(application.application_id, application);
        Ok(())
    }

    async fn get_application(&self, id: Uuid) -> Result<Option<Application>, StoreError> {
        let data = self.data.read().expect("store lock poisoned");
        Ok(data.applications.get(&id).cloned())
    }

    async fn modify_application(
        &self,
        id: Uuid,
        mutate: ApplicationMutator,
    ) -> Result<Application, StoreError> {
        let mut data = self.data.write().expect("store lock poisoned");
        let application = data
            .applications
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        mutate(application);
        application.updated_at = self.clock.now();
        Ok(application.clone())
    }

    async fn list_applications(
        &self,
        status: Option<ApplicationStatus>,
        page: usize,
        size: usize,
    ) -> Result<Page<Application>, StoreError> {
        let data = self.data.read().expect("store lock poisoned");
        let mut items: Vec<Application> = data
            .applications
            .values()
            .filter(|a| status.map_or(true, |s| a.processing.status == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(&items, page, size))
    }

    async fn applications_by_identity(
        &self,
        identity_id: Uuid,
    ) -> Result<Vec<Application>, StoreError> {
        let data = self.data.read().expect("store lock poisoned");
        let mut items: Vec<Application> = data
            .applications
            .values()
            .filter(|a| a.result.identity_id == Some(identity_id))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    async fn count_applications(
        &self,
        status: Option<ApplicationStatus>,
        is_duplicate: Option<bool>,
    ) -> Result<u64, StoreError> {
        let data = self.data.read().expect("store lock poisoned");
        Ok(data
            .applications
            .values()
            .filter(|a| status.map_or(true, |s| a.processing.status == s))
            .filter(|a| is_duplicate.map_or(true, |d| a.result.is_duplicate == d))
            .count() as u64)
    }

    async fn insert_identity(&self, identity: Identity) -> Result<(), StoreError> {
        let mut data = self.data.write().expect("store lock poisoned");
        if data.identities.contains_key(&identity.identity_id) {
            return Err(StoreError::AlreadyExists(identity.identity_id.to_string()));
        }
        data.identities.insert(identity.identity_id, identity);
        Ok(())
    }

    async fn get_identity(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
        let data = self.data.read().expect("store lock poisoned");
        Ok(data.identities.get(&id).cloned())
    }

    async fn modify_identity(
        &self,
        id: Uuid,
        mutate: IdentityMutator,
    ) -> Result<Identity, StoreError> {
        let mut data = self.data.write().expect("store lock poisoned");
        let identity = data
            .identities
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        mutate(identity);
        identity.updated_at = self.clock.now();
        Ok(identity.clone())
    }

    async fn list_identities(
        &self,
        status: Option<IdentityStatus>,
        page: usize,
        size: usize,
    ) -> Result<Page<Identity>, StoreError> {
        let data = self.data.read().expect("store lock poisoned");
        let mut items: Vec<Identity> = data
            .identities
            .values()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(&items, page, size))
    }

    async fn insert_embedding(&self, record: EmbeddingRecord) -> Result<(), StoreError> {
        let mut data = self.data.write().expect("store lock poisoned");
        if data.embeddings.contains_key(&record.application_id) {
            return Err(StoreError::AlreadyExists(record.application_id.to_string()));
        }
        data.embeddings.insert(record.application_id, record);
        Ok(())
    }

    async fn get_embedding(
        &self,
        application_id: Uuid,
    ) -> Result<Option<EmbeddingRecord>, StoreError> {
        let data = self.data.read().expect("store lock poisoned");
        Ok(data.embeddings.get(&application_id).cloned())
    }

    async fn embeddings_by_identity(
        &self,
        identity_id: Uuid,
    ) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let data = self.data.read().expect("store lock poisoned");
        let mut items: Vec<EmbeddingRecord> = data
            .embeddings
            .values()
            .filter(|e| e.identity_id == identity_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    async fn rebind_embedding(
        &self,
        application_id: Uuid,
        identity_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut data = self.data.write().expect("store lock poisoned");
        let record = data
            .embeddings
            .get_mut(&application_id)
            .ok_or_else(|| StoreError::NotFound(application_id.to_string()))?;
        record.identity_id = identity_id;
        Ok(())
    }

    async fn count_embeddings(&self) -> Result<u64, StoreError> {
        let data = self.data.read().expect("store lock poisoned");
        Ok(data.embeddings.len() as u64)
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<(), StoreError> {
        let mut data = self.data.write().expect("store lock poisoned");
        data.audit_events.push(event);
        Ok(())
    }

    async fn query_audit(
        &self,
        filter: AuditQuery,
        page: usize,
        size: usize,
    ) -> Result<Page<AuditEvent>, StoreError> {
        let data = self.data.read().expect("store lock poisoned");
        let mut items: Vec<AuditEvent> = data
            .audit_events
            .iter()
            .filter(|e| {
                filter
                    .resource_id
                    .as_ref()
                    .map_or(true, |r| &e.resource_id == r)
            })
            .filter(|e| filter.actor_id.as_ref().map_or(true, |a| &e.actor_id == a))
            .filter(|e| filter.event_kind.map_or(true, |k| e.event_kind == k))
            .filter(|e| filter.from.map_or(true, |t| e.timestamp >= t))
            .filter(|e| filter.to.map_or(true, |t| e.timestamp <= t))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(paginate(&items, page, size))
    }

    async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        let mut data = self.data.write().expect("store lock poisoned");
        if data.users.contains_key(&user.user_id)
            || data.users.values().any(|u| u.username == user.username)
        {
            return Err(StoreError::AlreadyExists(user.username));
        }
        data.users.insert(user.user_id, user);
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let data = self.data.read().expect("store lock poisoned");
        Ok(data.users.get(&id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let data = self.data.read().expect("store lock poisoned");
        Ok(data.users.values().find(|u| u.username == username).cloned())
    }

    async fn modify_user(&self, id: Uuid, mutate: UserMutator) -> Result<User, StoreError> {
        let mut data = self.data.write().expect("store lock poisoned");
        let user = data
            .users
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        mutate(user);
        user.updated_at = self.clock.now();
        Ok(user.clone())
    }

    async fn list_users(&self, page: usize, size: usize) -> Result<Page<User>, StoreError> {
        let data = self.data.read().expect("store lock poisoned");
        let mut items: Vec<User> = data.users.values().cloned().collect();
        items.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(paginate(&items, page, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::models::{ApplicantData, PhotoRef};
    use chrono::{NaiveDate, Utc};
    use std::time::Duration;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(SystemClock))
    }

    fn application(now: chrono::DateTime<Utc>) -> Application {
        Application::new(
            Uuid::new_v4(),
            ApplicantData {
                name: "Test Applicant".to_string(),
                date_of_birth: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
                email: None,
                phone: None,
                address: None,
                demographics: HashMap::new(),
            },
            PhotoRef {
                format: "jpg".to_string(),
                byte_size: 1024,
                ..PhotoRef::default()
            },
            now,
        )
    }

    #[tokio::test]
    async fn application_round_trip_and_modify() {
        let store = store();
        let app = application(Utc::now());
        let id = app.application_id;
        store.insert_application(app).await.unwrap();

        assert!(store
            .insert_application(store.get_application(id).await.unwrap().unwrap())
            .await
            .is_err());

        let updated = store
            .modify_application(
                id,
                Box::new(|a| a.processing.status = ApplicationStatus::Processing),
            )
            .await
            .unwrap();
        assert_eq!(updated.processing.status, ApplicationStatus::Processing);
    }

    #[tokio::test]
    async fn modify_bumps_updated_at() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryStore::new(clock.clone());
        let app = application(clock.now());
        let id = app.application_id;
        let created = app.updated_at;
        store.insert_application(app).await.unwrap();

        clock.advance(Duration::from_secs(5));
        let updated = store.modify_application(id, Box::new(|_| {})).await.unwrap();
        assert!(updated.updated_at > created);
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_paged() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryStore::new(clock.clone());
        let mut newest = None;
        for _ in 0..5 {
            clock.advance(Duration::from_secs(60));
            let app = application(clock.now());
            newest = Some(app.application_id);
            store.insert_application(app).await.unwrap();
        }

        let page = store.list_applications(None, 1, 2).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].application_id, newest.unwrap());

        let last = store.list_applications(None, 3, 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
    }

    #[tokio::test]
    async fn embedding_is_one_to_one() {
        let store = store();
        let app_id = Uuid::new_v4();
        let record = EmbeddingRecord {
            application_id: app_id,
            identity_id: Uuid::new_v4(),
            vector: vec![1.0],
            model_version: "stub-1".to_string(),
            quality_score: 0.9,
            face_box: Default::default(),
            created_at: Utc::now(),
        };
        store.insert_embedding(record.clone()).await.unwrap();
        assert!(matches!(
            store.insert_embedding(record).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn username_is_unique() {
        let store = store();
        let user = User::new("reviewer1", "r1@example.org", vec![], Utc::now());
        store.insert_user(user).await.unwrap();
        let dup = User::new("reviewer1", "other@example.org", vec![], Utc::now());
        assert!(store.insert_user(dup).await.is_err());
    }
}
