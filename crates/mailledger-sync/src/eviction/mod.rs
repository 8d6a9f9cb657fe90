//! Storage quota enforcement.
//!
//! Payload classes are evicted in a fixed order: attachment blobs, then
//! search index snapshots, then message bodies. Metadata, manifests and the
//! outbox are never evicted, and neither is anything belonging to a message
//! with unresolved outbox entries.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::store::{EvictionClass, StorageUsage, StoreHandle};
use crate::{Error, Result};

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionReport {
    /// Bytes the pass tried to free.
    pub requested: u64,
    /// Bytes actually freed.
    pub freed: u64,
    /// Bytes freed per class, in eviction order.
    pub by_class: Vec<(EvictionClass, u64)>,
}

impl EvictionReport {
    /// Returns true if the pass freed everything it was asked to.
    #[must_use]
    pub const fn satisfied(&self) -> bool {
        self.freed >= self.requested
    }
}

/// Frees payload storage when usage crosses the high watermark.
#[derive(Debug, Clone)]
pub struct EvictionManager {
    store: StoreHandle,
    high_watermark: f64,
    low_watermark: f64,
}

impl EvictionManager {
    /// Create a manager with the given watermarks (fractions of the quota).
    #[must_use]
    pub const fn new(store: StoreHandle, high_watermark: f64, low_watermark: f64) -> Self {
        Self {
            store,
            high_watermark,
            low_watermark,
        }
    }

    /// Current payload usage.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn usage(&self) -> Result<StorageUsage> {
        self.store.usage().await
    }

    /// Evict down to the low watermark if usage is above the high watermark.
    ///
    /// Returns `None` when no pass was needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn check(&self) -> Result<Option<EvictionReport>> {
        let usage = self.usage().await?;
        let total = usage.total();
        if total <= fraction_of(usage.quota, self.high_watermark) {
            return Ok(None);
        }

        let target = fraction_of(usage.quota, self.low_watermark);
        info!(
            "Storage at {total} of {} bytes, evicting down to {target}",
            usage.quota
        );
        self.free(total - target).await.map(Some)
    }

    /// Free at least `bytes`, walking the classes in eviction order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn free(&self, bytes: u64) -> Result<EvictionReport> {
        let mut report = EvictionReport {
            requested: bytes,
            ..EvictionReport::default()
        };

        for class in EvictionClass::ORDER {
            if report.satisfied() {
                break;
            }
            let freed = self
                .store
                .evict(class, bytes - report.freed, None)
                .await?;
            if freed > 0 {
                debug!("Evicted {freed} bytes of {class:?}");
                report.by_class.push((class, freed));
                report.freed += freed;
            }
        }

        if !report.satisfied() {
            warn!(
                "Eviction freed {} of {} requested bytes",
                report.freed, report.requested
            );
        }
        Ok(report)
    }

    /// Run a write, freeing space and retrying once if it hits the quota.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QuotaExceeded`] if eviction could not make room, or
    /// whatever error the write produced.
    pub async fn guarded<T, F, Fut>(&self, mut write: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match write().await {
            Err(Error::QuotaExceeded { needed, available }) => {
                let report = self.free(needed).await?;
                if !report.satisfied() {
                    return Err(Error::QuotaExceeded {
                        needed: needed - report.freed,
                        available: available + report.freed,
                    });
                }
                write().await
            }
            other => other,
        }
    }

    /// Check usage periodically until the task is aborted.
    pub async fn run(self, period: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.check().await {
                Ok(Some(report)) => debug!("Eviction pass: {report:?}"),
                Ok(None) => {}
                Err(Error::UnitUnavailable(_)) => break,
                Err(e) => warn!("Eviction check failed: {e}"),
            }
        }
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn fraction_of(quota: u64, fraction: f64) -> u64 {
    (quota as f64 * fraction) as u64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use mailledger_remote::{AccountId, MessageId};

    use super::*;
    use crate::store::{
        AuxNamespace, CacheEntry, IndexPayload, Key, MessageBody, PrimaryStore, Record,
        spawn_store,
    };

    const ACCOUNT: AccountId = AccountId(1);

    async fn manager(quota: u64) -> EvictionManager {
        let store = PrimaryStore::in_memory(quota).await.unwrap();
        let (store, _) = spawn_store(store, Duration::from_secs(5));
        EvictionManager::new(store, 0.9, 0.5)
    }

    fn body(id: &str, bytes: usize) -> Record {
        Record::Body(MessageBody {
            account_id: ACCOUNT,
            id: MessageId::from(id),
            text: Some("b".repeat(bytes)),
            html: None,
            attachments: Vec::new(),
            cached_at: Utc::now(),
        })
    }

    fn blob(key: &str, bytes: usize) -> Record {
        Record::Aux(CacheEntry {
            namespace: AuxNamespace::AttachmentBlob,
            key: key.into(),
            value: vec![0; bytes - key.len()],
            owner: None,
            cached_at: Utc::now(),
        })
    }

    #[test]
    fn test_fraction_of() {
        assert_eq!(fraction_of(1000, 0.9), 900);
        assert_eq!(fraction_of(0, 0.5), 0);
    }

    #[tokio::test]
    async fn test_blobs_go_before_index_before_bodies() {
        let evictor = manager(1000).await;
        evictor
            .store
            .bulk_put(vec![
                blob("att-1", 200),
                Record::IndexPayload(IndexPayload {
                    account_id: ACCOUNT,
                    payload: "i".repeat(200),
                    cached_at: Utc::now(),
                }),
                body("m1", 300),
            ])
            .await
            .unwrap();

        let report = evictor.free(300).await.unwrap();
        assert!(report.satisfied());
        assert_eq!(
            report.by_class,
            vec![
                (EvictionClass::AttachmentBlobs, 200),
                (EvictionClass::IndexPayloads, 200)
            ]
        );
        assert!(
            evictor
                .store
                .get(Key::Body(ACCOUNT, MessageId::from("m1")))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_check_only_acts_above_high_watermark() {
        let evictor = manager(1000).await;
        evictor.store.bulk_put(vec![body("m1", 400), body("m2", 400)]).await.unwrap();
        assert!(evictor.check().await.unwrap().is_none());

        evictor.store.put(body("m3", 150)).await.unwrap();
        let report = evictor.check().await.unwrap().unwrap();
        assert_eq!(report.requested, 450);
        assert!(evictor.usage().await.unwrap().total() <= 500);
    }

    #[tokio::test]
    async fn test_guarded_write_evicts_and_retries() {
        let evictor = manager(1000).await;
        evictor.store.put(body("old", 800)).await.unwrap();

        let store = evictor.store.clone();
        evictor
            .guarded(|| store.put(body("new", 500)))
            .await
            .unwrap();

        assert!(store.get(Key::Body(ACCOUNT, MessageId::from("old"))).await.unwrap().is_none());
        assert!(store.get(Key::Body(ACCOUNT, MessageId::from("new"))).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_guarded_write_fails_when_nothing_can_go() {
        let evictor = manager(100).await;
        let store = evictor.store.clone();
        let err = evictor
            .guarded(|| store.put(body("huge", 500)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));
    }
}
