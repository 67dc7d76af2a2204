//! Per-card image job status.
//!
//! Status moves `generating -> completed | failed | cancelled` and terminal
//! states are sticky. Every entry owns a `watch` channel carrying the job
//! snapshot so the streaming service can await the outcome instead of polling.
//!
//! Each `begin` opens a new generation for the card. Transitions made by a
//! job are tagged with its generation and ignored once a newer job has taken
//! over the card, so a superseded job can never finish its replacement.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use cardstream_types::{CardId, ImageAsset, ImageMetadata, ImageStatus};

/// Snapshot of one card's image job, as served to pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageJobStatus {
    pub card_id: CardId,
    pub status: ImageStatus,
    pub provider: String,
    pub prompt: String,
    pub aspect_ratio: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ImageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImageJobStatus {
    /// The finished asset, if the job completed.
    pub fn asset(&self) -> Option<ImageAsset> {
        match (&self.url, &self.metadata) {
            (Some(url), Some(metadata)) if self.status == ImageStatus::Completed => {
                Some(ImageAsset {
                    url: url.clone(),
                    metadata: metadata.clone(),
                })
            }
            _ => None,
        }
    }
}

/// Identifies one `begin` of a card's job.
pub type Generation = u64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_provider: BTreeMap<String, usize>,
}

struct Entry {
    generation: Generation,
    job: watch::Sender<ImageJobStatus>,
}

#[derive(Default)]
pub struct ImageStatusTracker {
    entries: Mutex<HashMap<CardId, Entry>>,
    next_generation: AtomicU64,
}

impl ImageStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CardId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a job as `generating` and return its generation. Replaces any
    /// previous job for the card (regeneration) but keeps existing waiters
    /// subscribed.
    pub fn begin(
        &self,
        card_id: &CardId,
        provider: &str,
        prompt: &str,
        aspect_ratio: &str,
    ) -> Generation {
        let now = Utc::now();
        let job = ImageJobStatus {
            card_id: card_id.clone(),
            status: ImageStatus::Generating,
            provider: provider.to_string(),
            prompt: prompt.to_string(),
            aspect_ratio: aspect_ratio.to_string(),
            url: None,
            metadata: None,
            error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entries = self.lock();
        match entries.get_mut(card_id) {
            Some(entry) => {
                entry.generation = generation;
                entry.job.send_replace(job);
            }
            None => {
                let (tx, _) = watch::channel(job);
                entries.insert(card_id.clone(), Entry { generation, job: tx });
            }
        }
        tracing::debug!(card = %card_id, provider, generation, "Image generation started");
        generation
    }

    /// Move the card's job to `completed` if it is still `generation` and
    /// generating. Returns `false` otherwise.
    pub fn complete(&self, card_id: &CardId, generation: Generation, asset: ImageAsset) -> bool {
        self.finish(card_id, Some(generation), ImageStatus::Completed, |job| {
            job.provider = asset.metadata.provider.clone();
            job.url = Some(asset.url);
            job.metadata = Some(asset.metadata);
        })
    }

    pub fn fail(&self, card_id: &CardId, generation: Generation, error: impl Into<String>) -> bool {
        let error = error.into();
        self.finish(card_id, Some(generation), ImageStatus::Failed, |job| {
            job.error = Some(error)
        })
    }

    /// Cancel whatever job the card currently has.
    pub fn cancel(&self, card_id: &CardId) -> bool {
        self.finish(card_id, None, ImageStatus::Cancelled, cancelled)
    }

    /// Cancel the card's job only if it is still `generation`.
    pub fn cancel_generation(&self, card_id: &CardId, generation: Generation) -> bool {
        self.finish(card_id, Some(generation), ImageStatus::Cancelled, cancelled)
    }

    fn finish(
        &self,
        card_id: &CardId,
        generation: Option<Generation>,
        status: ImageStatus,
        apply: impl FnOnce(&mut ImageJobStatus),
    ) -> bool {
        let entries = self.lock();
        let Some(entry) = entries.get(card_id) else {
            return false;
        };
        if generation.is_some_and(|g| g != entry.generation) {
            tracing::debug!(
                card = %card_id,
                current = entry.generation,
                requested = status.as_str(),
                "Ignoring transition from a superseded image job"
            );
            return false;
        }
        entry.job.send_if_modified(|job| {
            if job.status != ImageStatus::Generating {
                tracing::debug!(
                    card = %card_id,
                    current = job.status.as_str(),
                    requested = status.as_str(),
                    "Ignoring transition out of terminal image state"
                );
                return false;
            }
            let now = Utc::now();
            apply(job);
            job.status = status;
            job.updated_at = now;
            job.completed_at = Some(now);
            true
        })
    }

    pub fn get(&self, card_id: &CardId) -> Option<ImageJobStatus> {
        self.lock().get(card_id).map(|e| (*e.job.borrow()).clone())
    }

    /// Drop a card's entry. Pending waiters resolve to `None`.
    pub fn remove(&self, card_id: &CardId) -> bool {
        self.lock().remove(card_id).is_some()
    }

    /// Wait until the card's job reaches a terminal state and return that
    /// terminal snapshot. Resolves immediately if it already has; `None` if the
    /// card is unknown or removed while waiting.
    pub async fn wait_terminal(&self, card_id: &CardId) -> Option<ImageJobStatus> {
        let mut rx = self.lock().get(card_id)?.job.subscribe();
        let job = rx.wait_for(|job| job.status.is_terminal()).await.ok()?;
        Some((*job).clone())
    }

    /// Remove terminal entries not updated within `max_age`. Returns how many
    /// were removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| {
            let job = e.job.borrow();
            job.status == ImageStatus::Generating || job.updated_at > cutoff
        });
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "Cleaned up image status entries");
        }
        removed
    }

    pub fn stats(&self) -> TrackerStats {
        let entries = self.lock();
        let mut stats = TrackerStats {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            let job = entry.job.borrow();
            *stats
                .by_status
                .entry(job.status.as_str().to_string())
                .or_default() += 1;
            *stats.by_provider.entry(job.provider.clone()).or_default() += 1;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn cancelled(job: &mut ImageJobStatus) {
    job.error = Some("Generation cancelled".into());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn asset(provider: &str) -> ImageAsset {
        ImageAsset {
            url: "data:image/svg+xml;base64,AA==".into(),
            metadata: ImageMetadata {
                provider: provider.into(),
                aspect_ratio: Some("16:9".into()),
                placeholder_type: None,
                generated_at: None,
            },
        }
    }

    #[test]
    fn begin_then_complete() {
        let tracker = ImageStatusTracker::new();
        let card = CardId::from("c1");
        let generation = tracker.begin(&card, "placeholder", "a prompt", "16:9");
        assert_eq!(tracker.get(&card).unwrap().status, ImageStatus::Generating);

        assert!(tracker.complete(&card, generation, asset("placeholder")));
        let job = tracker.get(&card).unwrap();
        assert_eq!(job.status, ImageStatus::Completed);
        assert!(job.url.is_some());
        assert_eq!(job.metadata.as_ref().unwrap().provider, "placeholder");
        assert!(job.completed_at.is_some());
        assert!(job.asset().is_some());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let tracker = ImageStatusTracker::new();
        let card = CardId::from("c1");
        let generation = tracker.begin(&card, "placeholder", "p", "4:3");
        assert!(tracker.fail(&card, generation, "backend down"));
        assert!(!tracker.complete(&card, generation, asset("placeholder")));
        assert!(!tracker.cancel(&card));
        let job = tracker.get(&card).unwrap();
        assert_eq!(job.status, ImageStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("backend down"));
        assert!(job.asset().is_none());
    }

    #[test]
    fn unknown_card_transitions_are_rejected() {
        let tracker = ImageStatusTracker::new();
        assert!(!tracker.cancel(&CardId::from("nope")));
        assert!(tracker.get(&CardId::from("nope")).is_none());
    }

    #[test]
    fn begin_again_restarts_a_finished_job() {
        let tracker = ImageStatusTracker::new();
        let card = CardId::from("c1");
        tracker.begin(&card, "placeholder", "p", "4:3");
        tracker.cancel(&card);
        tracker.begin(&card, "placeholder", "p", "4:3");
        let job = tracker.get(&card).unwrap();
        assert_eq!(job.status, ImageStatus::Generating);
        assert!(job.error.is_none());
    }

    #[test]
    fn superseded_job_cannot_finish_its_replacement() {
        let tracker = ImageStatusTracker::new();
        let card = CardId::from("c1");
        let first = tracker.begin(&card, "slow", "p", "4:3");
        let second = tracker.begin(&card, "placeholder", "p", "4:3");
        assert_ne!(first, second);

        assert!(!tracker.cancel_generation(&card, first));
        assert!(!tracker.fail(&card, first, "late failure"));
        assert_eq!(tracker.get(&card).unwrap().status, ImageStatus::Generating);

        assert!(tracker.complete(&card, second, asset("placeholder")));
        assert_eq!(tracker.get(&card).unwrap().status, ImageStatus::Completed);
    }

    #[tokio::test]
    async fn waiter_sees_the_terminal_snapshot_even_after_a_restart() {
        let tracker = Arc::new(ImageStatusTracker::new());
        let card = CardId::from("c1");
        let generation = tracker.begin(&card, "placeholder", "p", "4:3");

        let waiter = {
            let tracker = tracker.clone();
            let card = card.clone();
            tokio::spawn(async move { tracker.wait_terminal(&card).await })
        };
        tokio::task::yield_now().await;
        tracker.fail(&card, generation, "backend down");
        tokio::task::yield_now().await;
        tracker.begin(&card, "placeholder", "p", "4:3");

        let job = waiter.await.unwrap().unwrap();
        assert_eq!(job.status, ImageStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("backend down"));
    }

    #[test]
    fn serializes_camel_case_without_empty_fields() {
        let tracker = ImageStatusTracker::new();
        let card = CardId::from("c1");
        tracker.begin(&card, "placeholder", "p", "4:3");
        let json = serde_json::to_value(tracker.get(&card).unwrap()).unwrap();
        assert_eq!(json["cardId"], "c1");
        assert_eq!(json["status"], "generating");
        assert!(json.get("url").is_none());
        assert!(json.get("startedAt").is_some());
    }

    #[test]
    fn stats_count_by_status_and_provider() {
        let tracker = ImageStatusTracker::new();
        let generations: Vec<Generation> = [("a", "placeholder"), ("b", "placeholder"), ("c", "mock")]
            .into_iter()
            .map(|(id, provider)| tracker.begin(&CardId::from(id), provider, "p", "4:3"))
            .collect();
        tracker.complete(&CardId::from("a"), generations[0], asset("placeholder"));
        tracker.fail(&CardId::from("c"), generations[2], "x");

        let stats = tracker.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status["completed"], 1);
        assert_eq!(stats.by_status["generating"], 1);
        assert_eq!(stats.by_status["failed"], 1);
        assert_eq!(stats.by_provider["placeholder"], 2);
        assert_eq!(stats.by_provider["mock"], 1);
    }

    #[test]
    fn cleanup_keeps_running_jobs() {
        let tracker = ImageStatusTracker::new();
        tracker.begin(&CardId::from("a"), "placeholder", "p", "4:3");
        let generation = tracker.begin(&CardId::from("b"), "placeholder", "p", "4:3");
        tracker.complete(&CardId::from("b"), generation, asset("placeholder"));

        assert_eq!(tracker.cleanup(Duration::from_secs(1800)), 0);
        assert_eq!(tracker.cleanup(Duration::ZERO), 1);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get(&CardId::from("a")).is_some());
    }

    #[tokio::test]
    async fn wait_terminal_resolves_on_completion() {
        let tracker = Arc::new(ImageStatusTracker::new());
        let card = CardId::from("c1");
        tracker.begin(&card, "placeholder", "p", "4:3");

        let waiter = {
            let tracker = tracker.clone();
            let card = card.clone();
            tokio::spawn(async move { tracker.wait_terminal(&card).await })
        };
        tokio::task::yield_now().await;
        tracker.cancel(&card);

        let job = waiter.await.unwrap().unwrap();
        assert_eq!(job.status, ImageStatus::Cancelled);
    }

    #[tokio::test]
    async fn wait_terminal_returns_immediately_when_done() {
        let tracker = ImageStatusTracker::new();
        let card = CardId::from("c1");
        let generation = tracker.begin(&card, "placeholder", "p", "4:3");
        tracker.complete(&card, generation, asset("placeholder"));
        let job = tracker.wait_terminal(&card).await.unwrap();
        assert_eq!(job.status, ImageStatus::Completed);
    }

    #[tokio::test]
    async fn wait_terminal_on_removed_card_is_none() {
        let tracker = Arc::new(ImageStatusTracker::new());
        let card = CardId::from("c1");
        assert!(tracker.wait_terminal(&card).await.is_none());

        tracker.begin(&card, "placeholder", "p", "4:3");
        let waiter = {
            let tracker = tracker.clone();
            let card = card.clone();
            tokio::spawn(async move { tracker.wait_terminal(&card).await })
        };
        tokio::task::yield_now().await;
        tracker.remove(&card);
        assert!(waiter.await.unwrap().is_none());
    }
}
