use super::*;
use shared::protocol::{Insight, Strength};

fn sample_result(title: &str) -> AnalysisResult {
    AnalysisResult {
        insights: vec![Insight {
            title: title.to_string(),
            summary: None,
            strength: Strength::Moderate,
            evidence: vec![],
        }],
        risk_flags: vec![],
        home_tips: vec![],
        conversation_guide: None,
        disclaimer: "Not a diagnosis.".to_string(),
        trend_note: None,
        meta: None,
    }
}

fn apply(session: &SubmissionSession, action: SessionAction) -> SubmissionSession {
    reduce(session, action).expect("transition")
}

fn set_image(slot: &str, path: &str) -> SessionAction {
    SessionAction::SetImage {
        slot: SlotId::from(slot),
        image: ImageRef::from(path),
    }
}

fn advanced(protocol: ProtocolId) -> SubmissionSession {
    let session = apply(
        &SubmissionSession::default(),
        SessionAction::SetMode(Mode::Advanced),
    );
    apply(&session, SessionAction::SetProtocol(protocol))
}

fn analyzing_quick() -> SubmissionSession {
    let session = apply(&SubmissionSession::default(), set_image("quick", "/tmp/a.png"));
    apply(&session, SessionAction::BeginSubmission)
}

#[test]
fn new_session_starts_selecting_with_profile_age() {
    let session = SubmissionSession::new(&ChildProfile {
        name: Some("Mia".into()),
        age: Some(7),
    });
    assert_eq!(session.step(), Step::Selecting);
    assert_eq!(session.child_age(), 7);
    assert_eq!(session.mode(), Mode::Quick);
    assert_eq!(session.protocol(), ProtocolId::Quick);
    assert!(session.disclosure_layer().is_none());

    assert_eq!(SubmissionSession::default().child_age(), DEFAULT_CHILD_AGE);
}

#[test]
fn slot_mutations_never_escape_declared_slots() {
    let candidate_slots = [
        "quick",
        "drawing",
        "house",
        "tree",
        "person",
        "family",
        "self_portrait",
        "sample",
        "garage",
    ];

    for protocol in ProtocolId::ALL {
        let mut session = if protocol == ProtocolId::Quick {
            SubmissionSession::default()
        } else {
            advanced(protocol)
        };

        for (index, slot) in candidate_slots.iter().enumerate() {
            let action = if index % 3 == 2 {
                SessionAction::ClearImage(SlotId::from(*slot))
            } else {
                set_image(slot, "/tmp/x.png")
            };
            if let Ok(next) = reduce(&session, action) {
                session = next;
            }
            assert!(session
                .image_slots()
                .keys()
                .all(|key| session.protocol().declares(key)));
        }
    }
}

#[test]
fn undeclared_slot_is_refused() {
    let err = reduce(&SubmissionSession::default(), set_image("house", "/tmp/h.png"))
        .expect_err("quick protocol has no house slot");
    assert!(matches!(err, TransitionError::UndeclaredSlot { .. }));
}

#[test]
fn switching_protocol_clears_images() {
    let session = advanced(ProtocolId::FamilyDrawing);
    let session = apply(&session, set_image("family", "/tmp/f.png"));
    assert_eq!(session.image_slots().len(), 1);

    let session = apply(&session, SessionAction::SetProtocol(ProtocolId::HouseTreePerson));
    assert!(session.image_slots().is_empty());
}

#[test]
fn reselecting_same_protocol_keeps_images() {
    let session = advanced(ProtocolId::FamilyDrawing);
    let session = apply(&session, set_image("family", "/tmp/f.png"));
    let session = apply(&session, SessionAction::SetProtocol(ProtocolId::FamilyDrawing));
    assert_eq!(session.image_slots().len(), 1);
}

#[test]
fn toggling_mode_clears_images_and_pins_protocol() {
    let session = apply(&SubmissionSession::default(), set_image("quick", "/tmp/a.png"));
    let session = apply(&session, SessionAction::SetMode(Mode::Advanced));
    assert!(session.image_slots().is_empty());
    assert_eq!(session.protocol(), ProtocolId::ADVANCED_DEFAULT);

    let session = apply(&session, SessionAction::SetMode(Mode::Quick));
    assert_eq!(session.protocol(), ProtocolId::Quick);
}

#[test]
fn quick_mode_refuses_advanced_protocols() {
    let err = reduce(
        &SubmissionSession::default(),
        SessionAction::SetProtocol(ProtocolId::HouseTreePerson),
    )
    .expect_err("quick mode is pinned");
    assert!(matches!(err, TransitionError::ProtocolModeMismatch { .. }));
}

#[test]
fn child_quote_is_trimmed_and_blank_cleared() {
    let session = apply(
        &SubmissionSession::default(),
        SessionAction::SetChildQuote(Some("  it's our dog  ".into())),
    );
    assert_eq!(session.child_quote(), Some("it's our dog"));

    let session = apply(&session, SessionAction::SetChildQuote(Some("   ".into())));
    assert_eq!(session.child_quote(), None);
}

#[test]
fn begin_submission_with_missing_required_image_is_a_validation_error() {
    let session = advanced(ProtocolId::HouseTreePerson);
    let session = apply(&session, set_image("house", "/tmp/h.png"));
    let session = apply(&session, set_image("tree", "/tmp/t.png"));

    let err = reduce(&session, SessionAction::BeginSubmission).expect_err("person missing");
    assert_eq!(
        err,
        TransitionError::MissingImage {
            slots: vec![SlotId::from("person")]
        }
    );
    assert_eq!(session.step(), Step::Selecting);
}

#[test]
fn validation_failure_is_recorded_without_leaving_selecting() {
    let session = advanced(ProtocolId::HouseTreePerson);
    let refused = apply(
        &session,
        SessionAction::ValidationFailed("missing image for person".into()),
    );
    assert_eq!(refused.step(), Step::Selecting);
    assert_eq!(refused.submission_id(), session.submission_id());
    let error = refused.error().expect("error recorded");
    assert_eq!(error.message, "missing image for person");
    assert_eq!(error.retry_count, 0);

    let analyzing = analyzing_quick();
    assert!(reduce(&analyzing, SessionAction::ValidationFailed("late".into())).is_err());
}

#[test]
fn begin_submission_allows_zero_images_when_none_required() {
    let session = advanced(ProtocolId::Observation);
    let session = apply(&session, SessionAction::BeginSubmission);
    assert_eq!(session.step(), Step::Analyzing);
    assert_eq!(session.submission_id(), 1);
}

#[test]
fn begin_submission_is_refused_outside_selecting() {
    let analyzing = analyzing_quick();
    let err = reduce(&analyzing, SessionAction::BeginSubmission).expect_err("already analyzing");
    assert!(matches!(
        err,
        TransitionError::NotAllowed {
            step: Step::Analyzing,
            ..
        }
    ));

    let results = apply(
        &analyzing,
        SessionAction::SubmissionSucceeded {
            submission_id: analyzing.submission_id(),
            result: sample_result("a"),
        },
    );
    assert!(reduce(&results, SessionAction::BeginSubmission).is_err());
}

#[test]
fn mutations_are_refused_while_analyzing() {
    let analyzing = analyzing_quick();
    assert!(reduce(&analyzing, set_image("quick", "/tmp/b.png")).is_err());
    assert!(reduce(&analyzing, SessionAction::SetChildAge(9)).is_err());
    assert!(reduce(&analyzing, SessionAction::SetMode(Mode::Advanced)).is_err());
}

#[test]
fn begin_submission_clears_previous_error() {
    let analyzing = analyzing_quick();
    let failed = apply(
        &analyzing,
        SessionAction::SubmissionFailed {
            submission_id: analyzing.submission_id(),
            message: "network down".into(),
            retry_count: 1,
        },
    );
    assert_eq!(failed.step(), Step::Selecting);
    assert_eq!(failed.error().map(|e| e.retry_count), Some(1));

    let retried = apply(&failed, SessionAction::BeginSubmission);
    assert!(retried.error().is_none());
    assert_eq!(retried.submission_id(), 2);
}

#[test]
fn success_sets_result_and_first_layer_together() {
    let analyzing = analyzing_quick();
    let done = apply(
        &analyzing,
        SessionAction::SubmissionSucceeded {
            submission_id: analyzing.submission_id(),
            result: sample_result("first"),
        },
    );
    assert_eq!(done.step(), Step::Results);
    assert_eq!(done.disclosure_layer(), Some(DisclosureLayer::FIRST));
    assert_eq!(done.analysis_result().map(|r| r.insights.len()), Some(1));
}

#[test]
fn stale_attempt_results_are_discarded() {
    let analyzing = analyzing_quick();
    let err = reduce(
        &analyzing,
        SessionAction::SubmissionSucceeded {
            submission_id: analyzing.submission_id() - 1,
            result: sample_result("late"),
        },
    )
    .expect_err("stale");
    assert!(matches!(err, TransitionError::StaleAttempt { .. }));

    let err = reduce(
        &analyzing,
        SessionAction::SubmissionFailed {
            submission_id: analyzing.submission_id() + 7,
            message: "late".into(),
            retry_count: 0,
        },
    )
    .expect_err("stale");
    assert!(matches!(err, TransitionError::StaleAttempt { .. }));
}

#[test]
fn disclosure_advances_one_layer_at_a_time_and_caps_at_three() {
    let analyzing = analyzing_quick();
    let mut session = apply(
        &analyzing,
        SessionAction::SubmissionSucceeded {
            submission_id: analyzing.submission_id(),
            result: sample_result("a"),
        },
    );

    let mut seen = vec![session.disclosure_layer().map(DisclosureLayer::get)];
    for _ in 0..4 {
        session = apply(&session, SessionAction::AdvanceDisclosure);
        seen.push(session.disclosure_layer().map(DisclosureLayer::get));
    }
    assert_eq!(seen, vec![Some(1), Some(2), Some(3), Some(3), Some(3)]);
}

#[test]
fn new_result_resets_disclosure_to_first_layer() {
    let analyzing = analyzing_quick();
    let done = apply(
        &analyzing,
        SessionAction::SubmissionSucceeded {
            submission_id: analyzing.submission_id(),
            result: sample_result("a"),
        },
    );
    let done = apply(&done, SessionAction::AdvanceDisclosure);
    let done = apply(&done, SessionAction::AdvanceDisclosure);

    let reset = apply(&done, SessionAction::Reset);
    let again = apply(&reset, set_image("quick", "/tmp/b.png"));
    let again = apply(&again, SessionAction::BeginSubmission);
    let again = apply(
        &again,
        SessionAction::SubmissionSucceeded {
            submission_id: again.submission_id(),
            result: sample_result("b"),
        },
    );
    assert_eq!(again.disclosure_layer(), Some(DisclosureLayer::FIRST));
}

#[test]
fn advance_disclosure_requires_results() {
    let err = reduce(&SubmissionSession::default(), SessionAction::AdvanceDisclosure)
        .expect_err("no result yet");
    assert!(matches!(err, TransitionError::NotAllowed { .. }));
}

#[test]
fn reset_is_legal_from_every_step() {
    let analyzing = analyzing_quick();
    let reset = apply(&analyzing, SessionAction::Reset);
    assert_eq!(reset.step(), Step::Selecting);
    assert!(reset.image_slots().is_empty());
    assert!(reset.analysis_result().is_none());

    // the in-flight attempt can no longer land once reset
    assert!(reduce(
        &reset,
        SessionAction::SubmissionSucceeded {
            submission_id: analyzing.submission_id(),
            result: sample_result("late"),
        },
    )
    .is_err());
}

#[test]
fn primary_image_prefers_first_required_slot() {
    let session = advanced(ProtocolId::FamilyDrawing);
    let session = apply(&session, set_image("self_portrait", "/tmp/self.png"));
    assert_eq!(session.primary_image(), Some(&ImageRef::from("/tmp/self.png")));

    let session = apply(&session, set_image("family", "/tmp/family.png"));
    assert_eq!(session.primary_image(), Some(&ImageRef::from("/tmp/family.png")));
}

#[test]
fn disclosure_layer_rejects_out_of_range_values() {
    assert!(DisclosureLayer::new(0).is_none());
    assert!(DisclosureLayer::new(4).is_none());
    assert_eq!(DisclosureLayer::new(2).map(DisclosureLayer::get), Some(2));
}
