//! Session state machine for one in-progress submission.
//!
//! All transitions go through [`reduce`], a pure function from the current
//! session and a [`SessionAction`] to the next session. Refused transitions
//! return a [`TransitionError`] and leave the caller's session untouched.
//! Side effects (network, feedback, persistence) live in the submission
//! controller, never here.

use std::{collections::BTreeMap, fmt};

use shared::{
    domain::{ChildProfile, ImageRef, Mode, ProtocolId, SlotId},
    protocol::AnalysisResult,
};

use crate::error::TransitionError;

pub const DEFAULT_CHILD_AGE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Selecting,
    Analyzing,
    Results,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Selecting => "selecting",
            Step::Analyzing => "analyzing",
            Step::Results => "showing results",
        })
    }
}

/// Progressive reveal depth of a completed result, always within 1..=3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DisclosureLayer(u8);

impl DisclosureLayer {
    pub const FIRST: DisclosureLayer = DisclosureLayer(1);
    pub const LAST: DisclosureLayer = DisclosureLayer(3);

    pub fn new(value: u8) -> Option<Self> {
        (Self::FIRST.0..=Self::LAST.0)
            .contains(&value)
            .then_some(Self(value))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn next(self) -> Self {
        Self((self.0 + 1).min(Self::LAST.0))
    }
}

/// Last failure shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub message: String,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
struct CompletedAnalysis {
    result: AnalysisResult,
    layer: DisclosureLayer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionSession {
    mode: Mode,
    protocol: ProtocolId,
    child_age: u32,
    child_quote: Option<String>,
    image_slots: BTreeMap<SlotId, ImageRef>,
    step: Step,
    error: Option<SessionError>,
    completed: Option<CompletedAnalysis>,
    submission_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    SetMode(Mode),
    SetProtocol(ProtocolId),
    SetChildAge(u32),
    SetChildQuote(Option<String>),
    SetImage { slot: SlotId, image: ImageRef },
    ClearImage(SlotId),
    BeginSubmission,
    /// Records why a submission was refused before it started.
    ValidationFailed(String),
    SubmissionSucceeded {
        submission_id: u64,
        result: AnalysisResult,
    },
    SubmissionFailed {
        submission_id: u64,
        message: String,
        retry_count: u32,
    },
    AdvanceDisclosure,
    Reset,
}

impl SessionAction {
    fn name(&self) -> &'static str {
        match self {
            SessionAction::SetMode(_) => "set_mode",
            SessionAction::SetProtocol(_) => "set_protocol",
            SessionAction::SetChildAge(_) => "set_child_age",
            SessionAction::SetChildQuote(_) => "set_child_quote",
            SessionAction::SetImage { .. } => "set_image",
            SessionAction::ClearImage(_) => "clear_image",
            SessionAction::BeginSubmission => "begin_submission",
            SessionAction::ValidationFailed(_) => "validation_failed",
            SessionAction::SubmissionSucceeded { .. } => "submission_succeeded",
            SessionAction::SubmissionFailed { .. } => "submission_failed",
            SessionAction::AdvanceDisclosure => "advance_disclosure",
            SessionAction::Reset => "reset",
        }
    }
}

impl Default for SubmissionSession {
    fn default() -> Self {
        Self::new(&ChildProfile::default())
    }
}

impl SubmissionSession {
    pub fn new(profile: &ChildProfile) -> Self {
        Self {
            mode: Mode::Quick,
            protocol: ProtocolId::Quick,
            child_age: profile.age.unwrap_or(DEFAULT_CHILD_AGE),
            child_quote: None,
            image_slots: BTreeMap::new(),
            step: Step::Selecting,
            error: None,
            completed: None,
            submission_id: 0,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    pub fn child_age(&self) -> u32 {
        self.child_age
    }

    pub fn child_quote(&self) -> Option<&str> {
        self.child_quote.as_deref()
    }

    pub fn image_slots(&self) -> &BTreeMap<SlotId, ImageRef> {
        &self.image_slots
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    pub fn analysis_result(&self) -> Option<&AnalysisResult> {
        self.completed.as_ref().map(|completed| &completed.result)
    }

    pub fn disclosure_layer(&self) -> Option<DisclosureLayer> {
        self.completed.as_ref().map(|completed| completed.layer)
    }

    /// Identifier of the most recently started submission attempt.
    pub fn submission_id(&self) -> u64 {
        self.submission_id
    }

    pub fn missing_required_slots(&self) -> Vec<SlotId> {
        self.protocol
            .required_slots()
            .filter(|spec| !self.image_slots.contains_key(&SlotId::from(spec.id)))
            .map(|spec| SlotId::from(spec.id))
            .collect()
    }

    /// Image recorded alongside a saved result: the first filled required
    /// slot, otherwise the first filled slot in declaration order.
    pub fn primary_image(&self) -> Option<&ImageRef> {
        let declared = self.protocol.slots();
        declared
            .iter()
            .filter(|spec| spec.required)
            .chain(declared.iter().filter(|spec| !spec.required))
            .find_map(|spec| self.image_slots.get(&SlotId::from(spec.id)))
            .or_else(|| self.image_slots.values().next())
    }

    fn require_step(&self, action: &SessionAction, step: Step) -> Result<(), TransitionError> {
        if self.step == step {
            Ok(())
        } else {
            Err(TransitionError::NotAllowed {
                action: action.name(),
                step: self.step,
            })
        }
    }

    fn require_current_attempt(&self, submission_id: u64) -> Result<(), TransitionError> {
        if submission_id == self.submission_id {
            Ok(())
        } else {
            Err(TransitionError::StaleAttempt {
                expected: self.submission_id,
                actual: submission_id,
            })
        }
    }

    fn clear_selection(&mut self) {
        self.image_slots.clear();
        self.completed = None;
    }
}

pub fn reduce(
    session: &SubmissionSession,
    action: SessionAction,
) -> Result<SubmissionSession, TransitionError> {
    let mut next = session.clone();

    match action {
        SessionAction::SetMode(mode) => {
            session.require_step(&action, Step::Selecting)?;
            if mode != session.mode {
                next.mode = mode;
                next.protocol = match mode {
                    Mode::Quick => ProtocolId::Quick,
                    Mode::Advanced => ProtocolId::ADVANCED_DEFAULT,
                };
                next.clear_selection();
            }
        }
        SessionAction::SetProtocol(protocol) => {
            session.require_step(&action, Step::Selecting)?;
            if protocol.mode() != session.mode {
                return Err(TransitionError::ProtocolModeMismatch {
                    protocol,
                    mode: session.mode,
                });
            }
            if protocol != session.protocol {
                next.protocol = protocol;
                next.clear_selection();
            }
        }
        SessionAction::SetChildAge(age) => {
            session.require_step(&action, Step::Selecting)?;
            next.child_age = age;
        }
        SessionAction::SetChildQuote(ref quote) => {
            session.require_step(&action, Step::Selecting)?;
            next.child_quote = quote
                .as_deref()
                .map(str::trim)
                .filter(|quote| !quote.is_empty())
                .map(str::to_string);
        }
        SessionAction::SetImage {
            ref slot,
            ref image,
        } => {
            session.require_step(&action, Step::Selecting)?;
            if !session.protocol.declares(slot) {
                return Err(TransitionError::UndeclaredSlot {
                    protocol: session.protocol,
                    slot: slot.clone(),
                });
            }
            next.image_slots.insert(slot.clone(), image.clone());
        }
        SessionAction::ClearImage(ref slot) => {
            session.require_step(&action, Step::Selecting)?;
            next.image_slots.remove(slot);
        }
        SessionAction::BeginSubmission => {
            session.require_step(&action, Step::Selecting)?;
            let missing = session.missing_required_slots();
            if !missing.is_empty() {
                return Err(TransitionError::MissingImage { slots: missing });
            }
            next.step = Step::Analyzing;
            next.error = None;
            next.submission_id = session.submission_id + 1;
        }
        SessionAction::ValidationFailed(ref message) => {
            session.require_step(&action, Step::Selecting)?;
            next.error = Some(SessionError {
                message: message.clone(),
                retry_count: 0,
            });
        }
        SessionAction::SubmissionSucceeded {
            submission_id,
            ref result,
        } => {
            session.require_step(&action, Step::Analyzing)?;
            session.require_current_attempt(submission_id)?;
            next.step = Step::Results;
            next.error = None;
            next.completed = Some(CompletedAnalysis {
                result: result.clone(),
                layer: DisclosureLayer::FIRST,
            });
        }
        SessionAction::SubmissionFailed {
            submission_id,
            ref message,
            retry_count,
        } => {
            session.require_step(&action, Step::Analyzing)?;
            session.require_current_attempt(submission_id)?;
            next.step = Step::Selecting;
            next.error = Some(SessionError {
                message: message.clone(),
                retry_count,
            });
        }
        SessionAction::AdvanceDisclosure => {
            session.require_step(&action, Step::Results)?;
            if let Some(completed) = next.completed.as_mut() {
                completed.layer = completed.layer.next();
            }
        }
        SessionAction::Reset => {
            next.step = Step::Selecting;
            next.error = None;
            next.clear_selection();
        }
    }

    Ok(next)
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
