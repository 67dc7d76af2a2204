//! Background image generation over a provider fallback chain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cardstream_types::{CardId, ImageAsset, Result, StreamError};

use crate::placeholder::PlaceholderProvider;
use crate::provider::{ImageProvider, ImageRequest};
use crate::retry::{execute_with_retry, BackoffPolicy};
use crate::tracker::{Generation, ImageStatusTracker};

#[derive(Debug, Clone)]
pub struct ImageServiceConfig {
    /// Providers tried after the requested one, in order.
    pub fallback_chain: Vec<String>,
    pub fallback_enabled: bool,
    /// Retries per provider before moving down the chain.
    pub max_retries: usize,
    pub backoff: BackoffPolicy,
    /// How long finished job statuses stay pollable.
    pub retention: Duration,
}

impl Default for ImageServiceConfig {
    fn default() -> Self {
        Self {
            fallback_chain: vec![PlaceholderProvider::NAME.to_string()],
            fallback_enabled: true,
            max_retries: 2,
            backoff: BackoffPolicy::default(),
            retention: Duration::from_secs(30 * 60),
        }
    }
}

impl ImageServiceConfig {
    /// Defaults overridden by `IMAGE_FALLBACK_ENABLED`, `IMAGE_FALLBACK_CHAIN`
    /// (comma separated) and `IMAGE_MAX_RETRIES`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("IMAGE_FALLBACK_ENABLED") {
            config.fallback_enabled = value.trim() != "false";
        }
        if let Ok(value) = std::env::var("IMAGE_FALLBACK_CHAIN") {
            let chain: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !chain.is_empty() {
                config.fallback_chain = chain;
            }
        }
        if let Ok(value) = std::env::var("IMAGE_MAX_RETRIES") {
            match value.trim().parse() {
                Ok(n) => config.max_retries = n,
                Err(_) => tracing::warn!(value = %value, "Ignoring invalid IMAGE_MAX_RETRIES"),
            }
        }
        config
    }
}

struct Job {
    generation: Generation,
    cancel: CancellationToken,
}

pub struct ImageGenerationService {
    providers: HashMap<String, Arc<dyn ImageProvider>>,
    config: ImageServiceConfig,
    tracker: Arc<ImageStatusTracker>,
    jobs: Mutex<HashMap<CardId, Job>>,
}

impl ImageGenerationService {
    /// Service with the placeholder provider registered.
    pub fn new(config: ImageServiceConfig, tracker: Arc<ImageStatusTracker>) -> Self {
        let mut providers: HashMap<String, Arc<dyn ImageProvider>> = HashMap::new();
        providers.insert(
            PlaceholderProvider::NAME.to_string(),
            Arc::new(PlaceholderProvider::new()),
        );
        Self {
            providers,
            config,
            tracker,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_provider(mut self, provider: impl ImageProvider + 'static) -> Self {
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
        self
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tracker(&self) -> &Arc<ImageStatusTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &ImageServiceConfig {
        &self.config
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<CardId, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject a provider name that can never produce an image. With fallback
    /// enabled an unknown name is tolerated since the chain still runs.
    pub fn check_provider(&self, name: &str) -> Result<()> {
        if self.providers.contains_key(name) || self.config.fallback_enabled {
            return Ok(());
        }
        Err(StreamError::UnknownProvider {
            provider: name.to_string(),
            available: self.provider_names(),
        })
    }

    fn chain_for(&self, preferred: &str) -> Vec<String> {
        let mut chain = vec![preferred.to_string()];
        if self.config.fallback_enabled {
            for name in &self.config.fallback_chain {
                if !chain.contains(name) {
                    chain.push(name.clone());
                }
            }
        }
        chain
    }

    /// Try `preferred`, then the configured chain, retrying each provider
    /// according to the backoff policy.
    pub async fn generate_with_fallback(
        &self,
        request: &ImageRequest,
        preferred: &str,
    ) -> Result<ImageAsset> {
        let mut errors = Vec::new();

        for name in self.chain_for(preferred) {
            let Some(provider) = self.providers.get(&name) else {
                if !self.config.fallback_enabled {
                    return Err(StreamError::UnknownProvider {
                        provider: name,
                        available: self.provider_names(),
                    });
                }
                tracing::warn!(provider = %name, "Skipping unregistered image provider");
                errors.push(format!("{name}: not registered"));
                continue;
            };

            tracing::debug!(card = %request.card_id, provider = %name, "Trying image provider");
            let result = execute_with_retry(
                || provider.generate(request),
                self.config.max_retries,
                &self.config.backoff,
                &name,
            )
            .await;

            match result {
                Ok(asset) => return Ok(asset),
                Err(e) => {
                    tracing::warn!(card = %request.card_id, provider = %name, error = %e, "Image provider failed");
                    if !self.config.fallback_enabled {
                        return Err(e);
                    }
                    errors.push(format!("{name}: {e}"));
                }
            }
        }

        Err(StreamError::ImageGenerationFailure {
            card: request.card_id.clone(),
            message: format!("All providers failed: {}", errors.join("; ")),
        })
    }

    /// Record the card as `generating` and run the job in the background.
    /// The job is cancelled when `parent` is, or through [`Self::cancel`].
    /// A job already running for the card is superseded: its token is
    /// cancelled and its late transitions are dropped by the tracker.
    pub fn start(
        self: &Arc<Self>,
        request: ImageRequest,
        provider: &str,
        parent: &CancellationToken,
    ) -> Result<()> {
        self.check_provider(provider)?;

        let card_id = request.card_id.clone();
        let token = parent.child_token();
        let generation = {
            let mut jobs = self.jobs();
            let generation =
                self.tracker
                    .begin(&card_id, provider, &request.prompt, &request.aspect_ratio);
            let job = Job {
                generation,
                cancel: token.clone(),
            };
            if let Some(previous) = jobs.insert(card_id.clone(), job) {
                tracing::debug!(card = %card_id, superseded = previous.generation, "Replacing running image job");
                previous.cancel.cancel();
            }
            generation
        };

        let service = Arc::clone(self);
        let provider = provider.to_string();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    if service.tracker.cancel_generation(&card_id, generation) {
                        tracing::info!(card = %card_id, "Image generation cancelled");
                    }
                }
                result = service.generate_with_fallback(&request, &provider) => match result {
                    Ok(asset) => {
                        tracing::info!(card = %card_id, provider = %asset.metadata.provider, "Image generation completed");
                        service.tracker.complete(&card_id, generation, asset);
                    }
                    Err(e) => {
                        tracing::warn!(card = %card_id, error = %e, "Image generation failed");
                        service.tracker.fail(&card_id, generation, e.to_string());
                    }
                },
            }
            service.finish_job(&card_id, generation);
        });
        Ok(())
    }

    fn finish_job(&self, card_id: &CardId, generation: Generation) {
        let mut jobs = self.jobs();
        if jobs.get(card_id).is_some_and(|job| job.generation == generation) {
            jobs.remove(card_id);
        }
    }

    /// Cancel a running job. Returns `false` if the card had no job in the
    /// `generating` state.
    pub fn cancel(&self, card_id: &CardId) -> bool {
        if let Some(job) = self.jobs().remove(card_id) {
            job.cancel.cancel();
        }
        self.tracker.cancel(card_id)
    }

    /// Start over for a card that already has a job, reusing its prompt.
    /// `provider` defaults to the one the previous job used. A job still in
    /// flight is superseded without ever reporting `cancelled`, so waiters
    /// see the new job's outcome.
    pub fn regenerate(self: &Arc<Self>, card_id: &CardId, provider: Option<&str>) -> Result<()> {
        let previous = self
            .tracker
            .get(card_id)
            .ok_or_else(|| StreamError::ImageNotFound(card_id.clone()))?;
        let provider = provider.unwrap_or(&previous.provider).to_string();

        let request = ImageRequest {
            card_id: card_id.clone(),
            prompt: previous.prompt,
            aspect_ratio: previous.aspect_ratio,
            style: "professional".into(),
        };
        tracing::info!(card = %card_id, provider = %provider, "Regenerating image");
        self.start(request, &provider, &CancellationToken::new())
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs().len()
    }

    /// Drop finished statuses older than the retention window.
    pub fn cleanup(&self) -> usize {
        self.tracker.cleanup(self.config.retention)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
