//! Append-only audit journal.
//!
//! Every event is timestamped by the journal's clock at append time;
//! [`crate::models::NewAuditEvent`] has no timestamp field, so callers
//! cannot supply one. There is no update or delete operation anywhere on
//! this surface or on the store trait beneath it.

use std::sync::Arc;

use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{AuditEvent, NewAuditEvent};
use crate::store::{AuditQuery, Page, Store, StoreError};

/// Stable CSV column order for exports.
const CSV_HEADER: &str =
    "timestamp,event_kind,actor_id,actor_kind,resource_id,resource_kind,action,success,ip,error,details";

pub struct AuditJournal {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl AuditJournal {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Write one immutable event and return its id.
    pub async fn append(&self, event: NewAuditEvent) -> Result<Uuid, StoreError> {
        let event_id = Uuid::new_v4();
        let stored = AuditEvent {
            event_id,
            event_kind: event.event_kind,
            timestamp: self.clock.now(),
            actor_id: event.actor_id,
            actor_kind: event.actor_kind,
            resource_id: event.resource_id,
            resource_kind: event.resource_kind,
            action: event.action,
            details: event.details,
            ip_address: event.ip_address,
            user_agent: event.user_agent,
            success: event.success,
            error_message: event.error_message,
        };
        tracing::debug!(
            event_kind = %stored.event_kind,
            resource_id = %stored.resource_id,
            "audit event appended"
        );
        self.store.append_audit(stored).await?;
        Ok(event_id)
    }

    /// Matching events, newest first, plus the total count.
    pub async fn query(
        &self,
        filter: AuditQuery,
        page: usize,
        size: usize,
    ) -> Result<Page<AuditEvent>, StoreError> {
        self.store.query_audit(filter, page, size).await
    }

    /// Export every matching event as CSV with a stable column order.
    pub async fn export_csv(&self, filter: AuditQuery) -> Result<String, StoreError> {
        let mut out = String::from(CSV_HEADER);
        out.push('\n');

        let mut page = 1;
        loop {
            let batch = self.store.query_audit(filter.clone(), page, 500).await?;
            if batch.items.is_empty() {
                break;
            }
            let fetched = batch.items.len();
            for event in batch.items {
                out.push_str(&csv_row(&event));
                out.push('\n');
            }
            if (page * 500) as u64 >= batch.total || fetched < 500 {
                break;
            }
            page += 1;
        }
        Ok(out)
    }
}

fn csv_row(event: &AuditEvent) -> String {
    let details = if event.details.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&event.details).unwrap_or_default()
    };
    [
        event.timestamp.to_rfc3339(),
        event.event_kind.to_string(),
        event.actor_id.clone(),
        event.actor_kind.to_string(),
        event.resource_id.clone(),
        event.resource_kind.to_string(),
        event.action.clone(),
        if event.success { "Yes" } else { "No" }.to_string(),
        event.ip_address.clone().unwrap_or_default(),
        event.error_message.clone().unwrap_or_default(),
        details,
    ]
    .into_iter()
    .map(|field| csv_escape(&field))
    .collect::<Vec<_>>()
    .join(",")
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{AuditEventKind, ResourceKind};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::time::Duration;

    fn journal() -> (AuditJournal, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (AuditJournal::new(store, clock.clone()), clock)
    }

    fn event(kind: AuditEventKind, resource: &str) -> NewAuditEvent {
        NewAuditEvent::system(kind, resource, ResourceKind::Application, "test action")
    }

    #[tokio::test]
    async fn append_stamps_journal_time() {
        let (journal, clock) = journal();
        let before = clock.now();
        journal
            .append(event(AuditEventKind::Submitted, "app-1"))
            .await
            .unwrap();

        let page = journal.query(AuditQuery::default(), 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].timestamp, before);
    }

    #[tokio::test]
    async fn query_filters_and_orders_newest_first() {
        let (journal, clock) = journal();
        journal
            .append(event(AuditEventKind::Submitted, "app-1"))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(10));
        journal
            .append(event(AuditEventKind::IdentityIssued, "app-1"))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(10));
        journal
            .append(event(AuditEventKind::Submitted, "app-2"))
            .await
            .unwrap();

        let all = journal.query(AuditQuery::default(), 1, 10).await.unwrap();
        assert_eq!(all.total, 3);
        assert!(all.items[0].timestamp > all.items[2].timestamp);

        let filtered = journal
            .query(
                AuditQuery {
                    resource_id: Some("app-1".to_string()),
                    event_kind: Some(AuditEventKind::IdentityIssued),
                    ..AuditQuery::default()
                },
                1,
                10,
            )
            .await
            .unwrap();
        assert_eq!(filtered.total, 1);
    }

    #[tokio::test]
    async fn csv_has_stable_columns_and_escaping() {
        let (journal, _clock) = journal();
        let mut e = event(AuditEventKind::OverrideDecision, "app-1");
        e.action = "decision, with \"quotes\"".to_string();
        e = e.detail("before", serde_json::json!("duplicate"));
        journal.append(e).await.unwrap();

        let csv = journal.export_csv(AuditQuery::default()).await.unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next().unwrap(), CSV_HEADER);
        let row = lines.next().unwrap();
        assert!(row.contains("override_decision"));
        assert!(row.contains("\"decision, with \"\"quotes\"\"\""));
        assert!(row.contains("Yes"));
    }
}
