//! Application state of one verification session.
//!
//! Every external occurrence (input change, fetch completion, model
//! readiness, capture tick) arrives as an [`Event`]. [`Session::apply`] is
//! the only mutator; it returns the [`Effect`]s the engine must carry out.

use chrono::{DateTime, Utc};
use faceverify_core::{DetectionSet, MatchPair, MatchPolicy, Matcher, ReferenceSet};
use faceverify_io::{AcquisitionError, ModelInfo};
use serde::Serialize;
use std::fmt;

/// Model and capture readiness: `ModelLoading → ModelReady → CaptureActive`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Readiness {
    ModelLoading,
    ModelReady,
    CaptureActive,
    ModelFailed { reason: String },
}

/// State of the reference fetch for the current identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Acquisition {
    Idle,
    InFlight { generation: u64 },
    Succeeded { generation: u64 },
    Failed { generation: u64, error: String },
}

/// What the user is shown after each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No fetch has completed yet, or capture has not produced a tick.
    Pending,
    /// Every fetch so far failed; there is nothing to compare against.
    Unavailable,
    Matched,
    NotMatched,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pending => "pending",
            Verdict::Unavailable => "unavailable",
            Verdict::Matched => "matched",
            Verdict::NotMatched => "not_matched",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum Event {
    /// The identifier input changed. Fetches references for a non-empty value.
    IdentifierChanged(String),
    /// The identifier was submitted. Always refetches and requests capture.
    Submitted(String),
    /// The session ended; forget the identifier and its references.
    Cleared,
    ModelLoaded(ModelInfo),
    ModelFailed(String),
    FetchCompleted {
        generation: u64,
        matric_number: String,
        result: Result<ReferenceSet, AcquisitionError>,
    },
    DetectionsCaptured(DetectionSet),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartFetch {
        generation: u64,
        matric_number: String,
    },
    StartCapture,
}

/// Summary of the reference set in effect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceSummary {
    pub matric_number: String,
    pub records: usize,
    pub usable: usize,
    pub fetched_at: DateTime<Utc>,
}

/// Snapshot served by `Status()`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub readiness: Readiness,
    pub model: Option<String>,
    pub identifier: String,
    pub generation: u64,
    pub acquisition: Acquisition,
    pub references: Option<ReferenceSummary>,
    pub verdict: Verdict,
    pub last_match: Option<MatchPair>,
    pub last_error: Option<String>,
    pub ticks: u64,
    pub threshold: f32,
    pub policy: MatchPolicy,
}

pub struct Session {
    readiness: Readiness,
    model: Option<ModelInfo>,
    identifier: String,
    /// Bumped on every identifier change; tags fetches so late replies can be recognised.
    generation: u64,
    references: Option<ReferenceSet>,
    acquisition: Acquisition,
    /// At least one fetch for the current identifier has completed.
    attempted: bool,
    capture_requested: bool,
    verdict: Verdict,
    last_match: Option<MatchPair>,
    last_error: Option<String>,
    ticks: u64,
    threshold: f32,
    policy: MatchPolicy,
    matcher: Box<dyn Matcher + Send + Sync>,
}

impl Session {
    pub fn new(threshold: f32, policy: MatchPolicy) -> Self {
        Self {
            readiness: Readiness::ModelLoading,
            model: None,
            identifier: String::new(),
            generation: 0,
            references: None,
            acquisition: Acquisition::Idle,
            attempted: false,
            capture_requested: false,
            verdict: Verdict::Pending,
            last_match: None,
            last_error: None,
            ticks: 0,
            threshold,
            policy,
            matcher: policy.matcher(),
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn references(&self) -> Option<&ReferenceSet> {
        self.references.as_ref()
    }

    pub fn apply(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::IdentifierChanged(raw) => {
                let matric_number = raw.trim();
                if matric_number == self.identifier {
                    return Vec::new();
                }
                self.switch_identifier(matric_number).into_iter().collect()
            }
            Event::Submitted(raw) => {
                let matric_number = raw.trim();
                if matric_number.is_empty() {
                    tracing::debug!("ignoring empty submission");
                    return Vec::new();
                }
                let mut effects: Vec<Effect> =
                    self.switch_identifier(matric_number).into_iter().collect();
                self.capture_requested = true;
                effects.extend(self.maybe_start_capture());
                effects
            }
            Event::Cleared => {
                self.generation += 1;
                self.identifier.clear();
                self.references = None;
                self.acquisition = Acquisition::Idle;
                self.attempted = false;
                self.verdict = Verdict::Pending;
                self.last_match = None;
                self.last_error = None;
                tracing::info!(generation = self.generation, "session cleared");
                Vec::new()
            }
            Event::ModelLoaded(info) => {
                if self.readiness != Readiness::ModelLoading {
                    tracing::warn!(readiness = ?self.readiness, "unexpected model load notification");
                    return Vec::new();
                }
                tracing::info!(model = %info.name, descriptor_len = ?info.descriptor_len, "model ready");
                self.model = Some(info);
                self.readiness = Readiness::ModelReady;
                self.maybe_start_capture().into_iter().collect()
            }
            Event::ModelFailed(reason) => {
                tracing::error!(%reason, "model failed to load");
                self.readiness = Readiness::ModelFailed { reason };
                Vec::new()
            }
            Event::FetchCompleted {
                generation,
                matric_number,
                result,
            } => {
                self.complete_fetch(generation, matric_number, result);
                Vec::new()
            }
            Event::DetectionsCaptured(detections) => {
                self.evaluate_tick(&detections);
                Vec::new()
            }
        }
    }

    /// Start tracking a new identifier. Any fetch still in flight becomes stale
    /// and the verdict goes back to pending until the new identifier is evaluated.
    fn switch_identifier(&mut self, matric_number: &str) -> Option<Effect> {
        self.generation += 1;
        self.identifier = matric_number.to_string();
        self.attempted = false;
        self.verdict = Verdict::Pending;
        self.last_match = None;

        if matric_number.is_empty() {
            self.acquisition = Acquisition::Idle;
            return None;
        }

        tracing::info!(matric_number, generation = self.generation, "fetching reference set");
        self.acquisition = Acquisition::InFlight {
            generation: self.generation,
        };
        Some(Effect::StartFetch {
            generation: self.generation,
            matric_number: matric_number.to_string(),
        })
    }

    fn maybe_start_capture(&mut self) -> Option<Effect> {
        if self.capture_requested && self.readiness == Readiness::ModelReady {
            tracing::info!("capture active");
            self.readiness = Readiness::CaptureActive;
            return Some(Effect::StartCapture);
        }
        None
    }

    fn complete_fetch(
        &mut self,
        generation: u64,
        matric_number: String,
        result: Result<ReferenceSet, AcquisitionError>,
    ) {
        if generation != self.generation || matric_number != self.identifier {
            tracing::debug!(
                %matric_number,
                generation,
                current = self.generation,
                "discarding stale reference fetch"
            );
            return;
        }

        self.attempted = true;
        match result {
            Ok(set) => {
                tracing::info!(
                    %matric_number,
                    records = set.len(),
                    usable = set.usable(),
                    "reference set replaced"
                );
                self.acquisition = Acquisition::Succeeded { generation };
                self.last_error = None;
                self.references = Some(set);
                if self.verdict == Verdict::Unavailable {
                    self.verdict = Verdict::Pending;
                }
            }
            Err(err) => {
                let error = err.to_string();
                tracing::warn!(%matric_number, %error, "reference fetch failed; keeping previous set");
                self.acquisition = Acquisition::Failed {
                    generation,
                    error: error.clone(),
                };
                self.last_error = Some(error);
                if self.references.is_none() {
                    self.verdict = Verdict::Unavailable;
                }
            }
        }
    }

    /// An empty detection set is evaluated too and yields `NotMatched`, so the
    /// verdict follows the camera instead of holding the last result.
    fn evaluate_tick(&mut self, detections: &DetectionSet) {
        if self.readiness != Readiness::CaptureActive {
            tracing::debug!(readiness = ?self.readiness, "dropping detections before capture is active");
            return;
        }
        self.ticks += 1;

        if !self.attempted {
            return;
        }
        let Some(references) = self.references.as_ref() else {
            self.verdict = Verdict::Unavailable;
            return;
        };

        match self.matcher.evaluate(detections, references, self.threshold) {
            Ok(result) => {
                tracing::trace!(
                    tick = self.ticks,
                    faces = detections.len(),
                    comparisons = result.comparisons,
                    matched = result.matched,
                    "tick evaluated"
                );
                if result.matched != (self.verdict == Verdict::Matched) {
                    tracing::info!(matched = result.matched, pair = ?result.pair, "verdict changed");
                }
                self.verdict = if result.matched {
                    Verdict::Matched
                } else {
                    Verdict::NotMatched
                };
                self.last_match = result.pair;
            }
            Err(mismatch) => {
                tracing::warn!(tick = self.ticks, %mismatch, "skipping tick");
            }
        }
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            readiness: self.readiness().clone(),
            model: self.model.as_ref().map(|m| m.name.clone()),
            identifier: self.identifier.clone(),
            generation: self.generation,
            acquisition: self.acquisition.clone(),
            references: self.references().map(|set| ReferenceSummary {
                matric_number: set.matric_number.clone(),
                records: set.len(),
                usable: set.usable(),
                fetched_at: set.fetched_at,
            }),
            verdict: self.verdict(),
            last_match: self.last_match,
            last_error: self.last_error.clone(),
            ticks: self.ticks,
            threshold: self.threshold,
            policy: self.policy,
        }
    }
}
