//! Drives analyze/save calls for the session with bounded linear retry.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Utc;
use shared::{
    domain::{ChildProfile, SlotId},
    error::ApiException,
    protocol::{AnalysisResult, AnalyzeRequest, ImagePayload, SaveAnalysisRequest},
};
use tokio::{
    sync::{broadcast, Mutex},
    time::Instant,
};
use tracing::{error, info, warn};

use crate::{
    config::{ClientSettings, RetryPolicy},
    error::{MediaError, NormalizationError, SubmissionError, TransitionError},
    media::{ImagePipeline, PipelineOptions},
    services::{AnalysisService, ImageSource, ImageSourceProvider, QuotaStatus},
    session::{reduce, SessionAction, Step, SubmissionSession},
};

const QUOTA_MARKER: &str = "quota";
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionEvent {
    AttemptStarted {
        submission_id: u64,
        attempt: u32,
    },
    LowQuotaAdvisory,
    RetryScheduled {
        retry: u32,
        delay: Duration,
    },
    /// Present the blocking usage-limit flow.
    QuotaExceeded {
        message: String,
    },
    /// Offer a manual retry from zero or leaving the workflow.
    TerminalFailure {
        message: String,
        attempts: u32,
    },
    Feedback(Feedback),
    Succeeded {
        submission_id: u64,
    },
}

/// Fixed metadata sent with every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMetadata {
    pub locale: String,
    pub role: String,
    pub features: Vec<String>,
    pub model_id: String,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub retry: RetryPolicy,
    pub pipeline: PipelineOptions,
    pub metadata: RequestMetadata,
    pub profile: ChildProfile,
}

impl ControllerOptions {
    pub fn from_settings(settings: &ClientSettings, profile: ChildProfile) -> Self {
        Self {
            retry: settings.retry_policy(),
            pipeline: settings.pipeline_options(),
            metadata: RequestMetadata {
                locale: settings.locale.clone(),
                role: settings.role.clone(),
                features: settings.features.clone(),
                model_id: settings.model_id.clone(),
            },
            profile,
        }
    }
}

struct ControllerState {
    session: SubmissionSession,
    low_quota_checked: bool,
}

pub struct SubmissionController {
    inner: Mutex<ControllerState>,
    in_flight: AtomicBool,
    analysis: Arc<dyn AnalysisService>,
    quota: Arc<dyn QuotaStatus>,
    pipeline: ImagePipeline,
    retry: RetryPolicy,
    metadata: RequestMetadata,
    profile: ChildProfile,
    events: broadcast::Sender<SubmissionEvent>,
}

/// How a failed attempt is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    QuotaExceeded,
    Transient,
}

/// Local image failures are never quota failures, whatever their text says.
pub fn classify_failure(err: &anyhow::Error) -> FailureClass {
    let local = err
        .chain()
        .any(|cause| cause.is::<NormalizationError>() || cause.is::<MediaError>());
    if local {
        return FailureClass::Transient;
    }
    let coded_quota = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<ApiException>())
        .any(ApiException::is_quota_exceeded);
    if coded_quota || format!("{err:#}").to_ascii_lowercase().contains(QUOTA_MARKER) {
        FailureClass::QuotaExceeded
    } else {
        FailureClass::Transient
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SubmissionController {
    pub fn new(
        analysis: Arc<dyn AnalysisService>,
        quota: Arc<dyn QuotaStatus>,
        options: ControllerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(ControllerState {
                session: SubmissionSession::new(&options.profile),
                low_quota_checked: false,
            }),
            in_flight: AtomicBool::new(false),
            analysis,
            quota,
            pipeline: ImagePipeline::new(options.pipeline),
            retry: options.retry,
            metadata: options.metadata,
            profile: options.profile,
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SubmissionEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> SubmissionSession {
        self.inner.lock().await.session.clone()
    }

    /// Applies one reducer transition to the live session.
    pub async fn dispatch(&self, action: SessionAction) -> Result<SubmissionSession, TransitionError> {
        let mut guard = self.inner.lock().await;
        let next = reduce(&guard.session, action)?;
        guard.session = next.clone();
        Ok(next)
    }

    /// Fills `slot` from a platform picker. Returns `false` when the user cancelled.
    pub async fn attach_from(
        &self,
        provider: &dyn ImageSourceProvider,
        source: ImageSource,
        slot: SlotId,
    ) -> Result<bool> {
        let Some(image) = provider.acquire(source).await? else {
            info!(slot = %slot, ?source, "image selection cancelled");
            return Ok(false);
        };
        self.dispatch(SessionAction::SetImage { slot, image })
            .await
            .context("failed to attach image")?;
        Ok(true)
    }

    pub async fn submit(&self) -> Result<AnalysisResult, SubmissionError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            let step = self.inner.lock().await.session.step();
            return Err(SubmissionError::Busy(TransitionError::NotAllowed {
                action: "submit",
                step,
            }));
        }
        let _guard = InFlightGuard(&self.in_flight);

        let mut attempt = 0;
        loop {
            let session = match self.dispatch(SessionAction::BeginSubmission).await {
                Ok(session) => session,
                Err(err @ TransitionError::MissingImage { .. }) => {
                    let message = err.to_string();
                    info!(error = %message, "submission blocked by validation");
                    self.dispatch(SessionAction::ValidationFailed(message.clone()))
                        .await
                        .map_err(SubmissionError::Busy)?;
                    return Err(SubmissionError::Validation(message));
                }
                Err(err) if attempt == 0 => return Err(SubmissionError::Busy(err)),
                Err(err) => {
                    info!(attempt, error = %err, "scheduled retry no longer applicable");
                    return Err(SubmissionError::Superseded);
                }
            };
            let submission_id = session.submission_id();
            info!(
                submission_id,
                attempt,
                max_retries = self.retry.max_retries,
                protocol = %session.protocol(),
                "analysis attempt started"
            );
            let _ = self.events.send(SubmissionEvent::AttemptStarted {
                submission_id,
                attempt,
            });

            if attempt == 0 {
                self.maybe_advise_low_quota().await;
            }

            let started = Instant::now();
            let outcome = self.run_attempt(&session).await;

            let err = match outcome {
                Ok(result) => {
                    return self
                        .complete(&session, submission_id, result, started.elapsed())
                        .await
                }
                Err(err) => err,
            };

            match classify_failure(&err) {
                FailureClass::QuotaExceeded => {
                    let message = format!("{err:#}");
                    warn!(submission_id, attempt, error = %message, "analysis quota exceeded");
                    self.record_failure(submission_id, message.clone(), 0)
                        .await?;
                    let _ = self.events.send(SubmissionEvent::QuotaExceeded {
                        message: message.clone(),
                    });
                    if let Err(refresh_err) = self.quota.refetch().await {
                        warn!(error = %refresh_err, "failed to refresh quota status");
                    }
                    let _ = self.events.send(SubmissionEvent::Feedback(Feedback::Failure));
                    return Err(SubmissionError::QuotaExceeded(message));
                }
                FailureClass::Transient if self.retry.allows_retry_after(attempt) => {
                    let retry = attempt + 1;
                    let message = format!(
                        "{err:#} (attempt {retry}/{max})",
                        max = self.retry.max_retries
                    );
                    let delay = self.retry.delay_for(retry);
                    warn!(
                        submission_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %message,
                        "analysis attempt failed; retry scheduled"
                    );
                    self.record_failure(submission_id, message, retry).await?;
                    let _ = self
                        .events
                        .send(SubmissionEvent::RetryScheduled { retry, delay });

                    tokio::time::sleep(delay).await;
                    if !self.still_awaiting_retry(submission_id).await {
                        info!(submission_id, "session changed during backoff; retry abandoned");
                        return Err(SubmissionError::Superseded);
                    }
                    attempt = retry;
                }
                FailureClass::Transient => {
                    let message = format!("{err:#}");
                    error!(
                        submission_id,
                        attempt,
                        error = %message,
                        "analysis failed; retry budget exhausted"
                    );
                    self.record_failure(submission_id, message.clone(), attempt)
                        .await?;
                    let _ = self.events.send(SubmissionEvent::TerminalFailure {
                        message: message.clone(),
                        attempts: attempt + 1,
                    });
                    let _ = self.events.send(SubmissionEvent::Feedback(Feedback::Failure));
                    return Err(SubmissionError::Terminal {
                        message,
                        attempts: attempt + 1,
                    });
                }
            }
        }
    }

    async fn run_attempt(&self, session: &SubmissionSession) -> Result<AnalysisResult> {
        let payloads = self
            .pipeline
            .normalize(session.protocol(), session.image_slots())
            .await?;
        let request = self.analyze_request(session, payloads);
        self.analysis.analyze(request).await
    }

    fn analyze_request(
        &self,
        session: &SubmissionSession,
        mut payloads: Vec<ImagePayload>,
    ) -> AnalyzeRequest {
        let (images, single_image_encoded_bytes) = if payloads.len() == 1 {
            (None, payloads.pop().map(|payload| payload.encoded_bytes))
        } else {
            (Some(payloads), None)
        };
        AnalyzeRequest {
            protocol_id: session.protocol(),
            child_age: session.child_age(),
            images,
            single_image_encoded_bytes,
            locale: self.metadata.locale.clone(),
            role: self.metadata.role.clone(),
            features: self.metadata.features.clone(),
        }
    }

    async fn complete(
        &self,
        session: &SubmissionSession,
        submission_id: u64,
        result: AnalysisResult,
        elapsed: Duration,
    ) -> Result<AnalysisResult, SubmissionError> {
        if !self.is_current_attempt(submission_id).await {
            info!(submission_id, "discarding result of superseded attempt");
            return Err(SubmissionError::Superseded);
        }

        let save = SaveAnalysisRequest {
            protocol_id: session.protocol(),
            child_age: session.child_age(),
            child_name: self.profile.name.clone(),
            original_image_ref: session.primary_image().cloned(),
            child_quote: session.child_quote().map(str::to_string),
            result: result.clone(),
            model_id: self.metadata.model_id.clone(),
            confidence: result.confidence(),
            processing_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            locale: self.metadata.locale.clone(),
            submitted_at: Utc::now(),
        };
        // TODO: queue unsaved results for a later sync once the storage service offers one.
        if let Err(err) = self.analysis.save(save).await {
            warn!(submission_id, error = %format!("{err:#}"), "failed to save analysis result");
        }

        self.dispatch(SessionAction::SubmissionSucceeded {
            submission_id,
            result: result.clone(),
        })
        .await
        .map_err(|err| {
            info!(submission_id, error = %err, "discarding result of superseded attempt");
            SubmissionError::Superseded
        })?;

        info!(submission_id, insights = result.insights.len(), "analysis succeeded");
        let _ = self.events.send(SubmissionEvent::Feedback(Feedback::Success));
        let _ = self.events.send(SubmissionEvent::Succeeded { submission_id });
        Ok(result)
    }

    async fn record_failure(
        &self,
        submission_id: u64,
        message: String,
        retry_count: u32,
    ) -> Result<(), SubmissionError> {
        self.dispatch(SessionAction::SubmissionFailed {
            submission_id,
            message,
            retry_count,
        })
        .await
        .map(|_| ())
        .map_err(|err| {
            info!(submission_id, error = %err, "discarding failure of superseded attempt");
            SubmissionError::Superseded
        })
    }

    async fn is_current_attempt(&self, submission_id: u64) -> bool {
        let guard = self.inner.lock().await;
        guard.session.step() == Step::Analyzing && guard.session.submission_id() == submission_id
    }

    async fn still_awaiting_retry(&self, submission_id: u64) -> bool {
        let guard = self.inner.lock().await;
        let session = &guard.session;
        session.step() == Step::Selecting
            && session.submission_id() == submission_id
            && session.error().is_some()
    }

    async fn maybe_advise_low_quota(&self) {
        {
            let mut guard = self.inner.lock().await;
            if guard.low_quota_checked {
                return;
            }
            guard.low_quota_checked = true;
        }
        match self.quota.should_warn_low().await {
            Ok(true) => {
                info!("quota running low; advising user");
                let _ = self.events.send(SubmissionEvent::LowQuotaAdvisory);
            }
            Ok(false) => {}
            Err(err) => warn!(error = %err, "failed to read quota status"),
        }
    }
}

#[cfg(test)]
#[path = "tests/submission_tests.rs"]
mod tests;
