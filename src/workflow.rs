//! Per-user workflow state: two image slots, the current result, and the single in-flight marker.
//!
//! Every transition is synchronous. Service calls happen between a `begin_*` that hands out a
//! ticket and the matching `finish_*` that consumes it, so the caller never holds the session
//! across an `.await`.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::data_uri::DataUri;
use crate::gemini::GeminiError;
use crate::models::{GenerationResult, OptimizedPrompt, Phase, Proposal, SessionView};

pub const MISSING_IMAGES_MESSAGE: &str = "Please upload both a model portrait and a product image.";
pub const OPTIMIZE_FAILED_MESSAGE: &str = "Failed to optimize prompt. Please try again.";
pub const PREVIEW_FAILED_MESSAGE: &str = "Image generation failed. Try a different prompt.";

/// How long a copied proposal stays flagged in the view.
pub const COPY_FEEDBACK_MILLIS: i64 = 2_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("{}", MISSING_IMAGES_MESSAGE)] MissingImages,
    #[error("another generation request is already in progress")] Busy,
    #[error("no proposals yet, run optimize first")] NoResult,
    #[error("unknown proposal {0}")] UnknownProposal(Uuid),
    #[error("inputs changed while the request was in flight; result discarded")] Stale,
    #[error("{}", OPTIMIZE_FAILED_MESSAGE)] OptimizeFailed,
    #[error("{}", PREVIEW_FAILED_MESSAGE)] PreviewFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSlot {
    Portrait,
    Product,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlight {
    Optimize { revision: u64 },
    Preview { result_id: Uuid, proposal_id: Uuid },
}

/// Inputs captured when an optimize call starts.
#[derive(Debug)]
pub struct OptimizeTicket {
    revision: u64,
    pub portrait: DataUri,
    pub product: DataUri,
}

/// Inputs captured when a preview call starts.
#[derive(Debug)]
pub struct PreviewTicket {
    result_id: Uuid,
    pub proposal_id: Uuid,
    pub portrait: DataUri,
    pub prompt: String,
}

#[derive(Debug, Clone)]
struct CopyFeedback {
    proposal_id: Uuid,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    portrait: Option<DataUri>,
    product: Option<DataUri>,
    revision: u64,
    result: Option<GenerationResult>,
    in_flight: Option<InFlight>,
    error: Option<String>,
    copied: Option<CopyFeedback>,
    updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            portrait: None,
            product: None,
            revision: 0,
            result: None,
            in_flight: None,
            error: None,
            copied: None,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid { self.id }

    pub fn result(&self) -> Option<&GenerationResult> { self.result.as_ref() }

    pub fn error(&self) -> Option<&str> { self.error.as_deref() }

    /// A call that started before the latest upload still blocks new calls, but it no longer
    /// describes the session's inputs, so the phase ignores it.
    pub fn phase(&self) -> Phase {
        if self.optimizing() {
            return Phase::Optimizing;
        }
        if self.generating_proposal_id().is_some() {
            return Phase::GeneratingPreview;
        }
        match &self.result {
            Some(r) if r.generated_image.is_some() => Phase::HasPreview,
            Some(_) => Phase::HasResults,
            None if self.portrait.is_some() && self.product.is_some() => Phase::Ready,
            None => Phase::Empty,
        }
    }

    fn optimizing(&self) -> bool {
        matches!(self.in_flight, Some(InFlight::Optimize { revision }) if revision == self.revision)
    }

    fn generating_proposal_id(&self) -> Option<Uuid> {
        match self.in_flight {
            Some(InFlight::Preview { result_id, proposal_id })
                if self.result.as_ref().is_some_and(|r| r.id == result_id) => Some(proposal_id),
            _ => None,
        }
    }

    /// True when nothing is in flight and the session hasn't changed for at least `ttl`.
    pub fn is_idle(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.in_flight.is_none() && now - self.updated_at >= ttl
    }

    /// Stores an image. Any existing result was derived from the old inputs and is dropped.
    pub fn upload(&mut self, slot: ImageSlot, image: DataUri) {
        match slot {
            ImageSlot::Portrait => self.portrait = Some(image),
            ImageSlot::Product => self.product = Some(image),
        }
        self.revision += 1;
        if self.result.take().is_some() {
            info!("🔄 Session {} inputs changed, clearing previous result", self.id);
        }
        self.error = None;
        self.copied = None;
        self.touch();
    }

    pub fn begin_optimize(&mut self) -> Result<OptimizeTicket, WorkflowError> {
        if self.portrait.is_none() || self.product.is_none() {
            self.error = Some(MISSING_IMAGES_MESSAGE.to_string());
            self.touch();
            return Err(WorkflowError::MissingImages);
        }
        if self.in_flight.is_some() {
            return Err(WorkflowError::Busy);
        }
        let Some((portrait, product)) = self.portrait.clone().zip(self.product.clone()) else {
            return Err(WorkflowError::MissingImages);
        };
        let ticket = OptimizeTicket { revision: self.revision, portrait, product };
        self.in_flight = Some(InFlight::Optimize { revision: self.revision });
        self.error = None;
        self.touch();
        Ok(ticket)
    }

    pub fn finish_optimize(
        &mut self,
        ticket: OptimizeTicket,
        outcome: Result<Vec<OptimizedPrompt>, GeminiError>,
    ) -> Result<(), WorkflowError> {
        self.in_flight = None;
        self.touch();
        if ticket.revision != self.revision {
            warn!("Session {} discarding optimize outcome for stale inputs", self.id);
            return Err(WorkflowError::Stale);
        }

        match outcome {
            Ok(prompts) => {
                let optimized_prompts = prompts
                    .into_iter()
                    .map(|prompt| Proposal { id: Uuid::new_v4(), prompt })
                    .collect();
                let result = GenerationResult {
                    id: Uuid::new_v4(),
                    original_image: ticket.portrait,
                    optimized_prompts,
                    generated_image: None,
                    preview_proposal_id: None,
                    created_at: Utc::now(),
                };
                info!("✅ Session {} has result {} with {} proposals", self.id, result.id, result.optimized_prompts.len());
                self.result = Some(result);
                self.copied = None;
                Ok(())
            }
            Err(e) => {
                error!("❌ Session {} optimize failed: {}", self.id, e);
                self.error = Some(OPTIMIZE_FAILED_MESSAGE.to_string());
                Err(WorkflowError::OptimizeFailed)
            }
        }
    }

    pub fn begin_preview(&mut self, proposal_id: Uuid) -> Result<PreviewTicket, WorkflowError> {
        if self.in_flight.is_some() {
            return Err(WorkflowError::Busy);
        }
        let result = self.result.as_ref().ok_or(WorkflowError::NoResult)?;
        let proposal = result.proposal(proposal_id).ok_or(WorkflowError::UnknownProposal(proposal_id))?;
        let ticket = PreviewTicket {
            result_id: result.id,
            proposal_id,
            portrait: result.original_image.clone(),
            prompt: proposal.prompt.prompt.clone(),
        };
        self.in_flight = Some(InFlight::Preview { result_id: ticket.result_id, proposal_id });
        self.error = None;
        self.touch();
        Ok(ticket)
    }

    pub fn finish_preview(
        &mut self,
        ticket: PreviewTicket,
        outcome: Result<DataUri, GeminiError>,
    ) -> Result<(), WorkflowError> {
        self.in_flight = None;
        self.touch();
        let Some(result) = self.result.as_mut().filter(|r| r.id == ticket.result_id) else {
            warn!("Session {} discarding preview for a replaced result", self.id);
            return Err(WorkflowError::Stale);
        };

        match outcome {
            Ok(image) => {
                info!("✅ Session {} preview ready for proposal {}", self.id, ticket.proposal_id);
                result.generated_image = Some(image);
                result.preview_proposal_id = Some(ticket.proposal_id);
                Ok(())
            }
            Err(e) => {
                error!("❌ Session {} preview for proposal {} failed: {}", self.id, ticket.proposal_id, e);
                self.error = Some(PREVIEW_FAILED_MESSAGE.to_string());
                Err(WorkflowError::PreviewFailed)
            }
        }
    }

    /// Returns the literal prompt text for the client's clipboard and flags the proposal as copied.
    pub fn copy_prompt(&mut self, proposal_id: Uuid, now: DateTime<Utc>) -> Result<String, WorkflowError> {
        let result = self.result.as_ref().ok_or(WorkflowError::NoResult)?;
        let proposal = result.proposal(proposal_id).ok_or(WorkflowError::UnknownProposal(proposal_id))?;
        let text = proposal.prompt.prompt.clone();
        self.copied = Some(CopyFeedback { proposal_id, at: now });
        Ok(text)
    }

    pub fn view(&self, now: DateTime<Utc>) -> SessionView {
        let copied_proposal_id = self
            .copied
            .as_ref()
            .filter(|c| now - c.at < Duration::milliseconds(COPY_FEEDBACK_MILLIS))
            .map(|c| c.proposal_id);
        SessionView {
            id: self.id,
            phase: self.phase(),
            has_portrait: self.portrait.is_some(),
            has_product: self.product.is_some(),
            busy: self.in_flight.is_some(),
            optimizing: self.optimizing(),
            generating_proposal_id: self.generating_proposal_id(),
            error: self.error.clone(),
            copied_proposal_id,
            result: self.result.clone(),
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
