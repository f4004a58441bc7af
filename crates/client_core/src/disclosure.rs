//! Progressive reveal of a completed analysis.
//!
//! Risk flags and the disclaimer are part of every projection, whatever the
//! layer.

use shared::protocol::{AnalysisResult, HomeTip, Insight, RiskFlag};

use crate::session::{DisclosureLayer, SubmissionSession};

#[derive(Debug, Clone, PartialEq)]
pub struct Headline<'a> {
    pub title: &'a str,
    pub summary: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsightEvidence<'a> {
    pub title: &'a str,
    pub evidence: &'a [String],
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeepDive<'a> {
    pub evidence: Vec<InsightEvidence<'a>>,
    pub home_tips: &'a [HomeTip],
    pub conversation_prompts: &'a [String],
    pub trend_note: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisclosedResult<'a> {
    pub layer: DisclosureLayer,
    pub headline: Option<Headline<'a>>,
    pub insights: Option<&'a [Insight]>,
    pub deep_dive: Option<DeepDive<'a>>,
    pub risk_flags: &'a [RiskFlag],
    pub disclaimer: &'a str,
}

/// Projection of the session's result, `None` until the session shows results.
pub fn disclose(session: &SubmissionSession) -> Option<DisclosedResult<'_>> {
    let result = session.analysis_result()?;
    let layer = session.disclosure_layer()?;
    Some(project(result, layer))
}

pub fn project(result: &AnalysisResult, layer: DisclosureLayer) -> DisclosedResult<'_> {
    let headline = result.insights.first().map(|top| Headline {
        title: &top.title,
        summary: top.summary.as_deref(),
    });

    let insights = (layer.get() >= 2).then_some(result.insights.as_slice());

    let deep_dive = (layer.get() >= 3).then(|| DeepDive {
        evidence: result
            .insights
            .iter()
            .map(|insight| InsightEvidence {
                title: &insight.title,
                evidence: &insight.evidence,
            })
            .collect(),
        home_tips: &result.home_tips,
        conversation_prompts: result
            .conversation_guide
            .as_ref()
            .and_then(|guide| guide.opening_questions.as_deref())
            .unwrap_or_default(),
        trend_note: result.trend_note.as_deref(),
    });

    DisclosedResult {
        layer,
        headline,
        insights,
        deep_dive,
        risk_flags: &result.risk_flags,
        disclaimer: &result.disclaimer,
    }
}
