use std::{fmt::Write as _, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use client_core::{
    disclose, load_settings, AnalysisService, ControllerOptions, DisclosedResult, Feedback,
    HttpAnalysisClient, HttpQuotaStatus, ImageSource, PathImageSource, QuotaStatus,
    SessionAction, SubmissionController, SubmissionEvent, UnmeteredQuota,
};
use shared::{
    domain::{ChildProfile, Mode, ProtocolId, SlotId},
    protocol::Strength,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "insight", about = "Submit a child's drawing for developmental insight")]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, default_value = "quick", value_parser = parse_protocol)]
    protocol: ProtocolId,
    #[arg(long)]
    age: Option<u32>,
    #[arg(long)]
    child_name: Option<String>,
    #[arg(long)]
    quote: Option<String>,
    /// Image for a protocol slot, as SLOT=PATH. Repeatable.
    #[arg(long = "image", value_parser = parse_slot_image)]
    images: Vec<(SlotId, PathBuf)>,
    /// How many result layers to reveal (1-3).
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=3))]
    layers: u8,
    /// Skip quota checks for deployments without usage limits.
    #[arg(long)]
    no_quota: bool,
}

fn parse_protocol(raw: &str) -> Result<ProtocolId, String> {
    ProtocolId::parse(raw).ok_or_else(|| {
        let known: Vec<_> = ProtocolId::ALL.iter().map(|p| p.as_str()).collect();
        format!("unknown protocol '{raw}'; expected one of {}", known.join(", "))
    })
}

fn parse_slot_image(raw: &str) -> Result<(SlotId, PathBuf), String> {
    let (slot, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected SLOT=PATH, got '{raw}'"))?;
    if slot.trim().is_empty() || path.trim().is_empty() {
        return Err(format!("expected SLOT=PATH, got '{raw}'"));
    }
    Ok((SlotId::from(slot.trim()), PathBuf::from(path.trim())))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url.clone() {
        settings.server_url = server_url;
    }

    let http = reqwest::Client::new();
    let analysis: Arc<dyn AnalysisService> =
        Arc::new(HttpAnalysisClient::new(http.clone(), settings.server_url.clone()));
    let quota: Arc<dyn QuotaStatus> = if args.no_quota {
        Arc::new(UnmeteredQuota)
    } else {
        Arc::new(HttpQuotaStatus::new(http, settings.server_url.clone()))
    };
    let profile = ChildProfile {
        name: args.child_name.clone(),
        age: args.age,
    };
    let controller = SubmissionController::new(
        analysis,
        quota,
        ControllerOptions::from_settings(&settings, profile),
    );

    prepare_session(&controller, &args).await?;

    let mut events = controller.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event printer lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let outcome = controller.submit().await;
    match outcome {
        Ok(_) => {
            for _ in 1..args.layers {
                controller
                    .dispatch(SessionAction::AdvanceDisclosure)
                    .await
                    .context("failed to reveal next layer")?;
            }
            let session = controller.snapshot().await;
            let view = disclose(&session).ok_or_else(|| anyhow!("session has no result"))?;
            println!("{}", render(&view));
            drop(controller);
            let _ = printer.await;
            Ok(())
        }
        Err(err) => {
            drop(controller);
            let _ = printer.await;
            if err.offers_manual_retry() {
                eprintln!("Run the command again to retry, or stop here.");
            }
            Err(err.into())
        }
    }
}

async fn prepare_session(controller: &SubmissionController, args: &Args) -> Result<()> {
    if args.protocol.mode() == Mode::Advanced {
        controller
            .dispatch(SessionAction::SetMode(Mode::Advanced))
            .await?;
        controller
            .dispatch(SessionAction::SetProtocol(args.protocol))
            .await?;
    }
    if let Some(quote) = &args.quote {
        controller
            .dispatch(SessionAction::SetChildQuote(Some(quote.clone())))
            .await?;
    }
    for (slot, path) in &args.images {
        let source = PathImageSource::new(path);
        controller
            .attach_from(&source, ImageSource::Library, slot.clone())
            .await
            .with_context(|| format!("failed to attach {} to slot {slot}", path.display()))?;
    }
    Ok(())
}

fn print_event(event: &SubmissionEvent) {
    match event {
        SubmissionEvent::AttemptStarted { attempt, .. } if *attempt > 0 => {
            eprintln!("Retrying analysis (attempt {})...", attempt + 1)
        }
        SubmissionEvent::AttemptStarted { .. } => eprintln!("Analyzing drawing..."),
        SubmissionEvent::LowQuotaAdvisory => {
            eprintln!("Heads up: you are close to your analysis limit.")
        }
        SubmissionEvent::RetryScheduled { retry, delay } => {
            eprintln!("Analysis failed; retry {retry} in {}s.", delay.as_secs_f32())
        }
        SubmissionEvent::QuotaExceeded { message } => {
            eprintln!("Analysis limit reached: {message}")
        }
        SubmissionEvent::TerminalFailure { message, attempts } => {
            eprintln!("Analysis failed after {attempts} attempts: {message}")
        }
        SubmissionEvent::Feedback(Feedback::Success) => eprint!("\x07"),
        SubmissionEvent::Feedback(Feedback::Failure) | SubmissionEvent::Succeeded { .. } => {}
    }
}

fn strength_marker(strength: Strength) -> &'static str {
    match strength {
        Strength::Strong => "***",
        Strength::Moderate => "**",
        Strength::Weak => "*",
    }
}

fn render(view: &DisclosedResult<'_>) -> String {
    let mut out = String::new();
    if let Some(headline) = &view.headline {
        let _ = writeln!(out, "{}", headline.title);
        if let Some(summary) = headline.summary {
            let _ = writeln!(out, "  {summary}");
        }
    }

    if let Some(insights) = view.insights {
        let _ = writeln!(out, "\nInsights");
        for insight in insights {
            let _ = writeln!(
                out,
                "  {} {}",
                strength_marker(insight.strength),
                insight.title
            );
            if let Some(summary) = &insight.summary {
                let _ = writeln!(out, "      {summary}");
            }
        }
    }

    if let Some(deep_dive) = &view.deep_dive {
        let _ = writeln!(out, "\nWhat we noticed");
        for item in deep_dive.evidence.iter().filter(|item| !item.evidence.is_empty()) {
            let _ = writeln!(out, "  {}: {}", item.title, item.evidence.join("; "));
        }
        if !deep_dive.home_tips.is_empty() {
            let _ = writeln!(out, "\nAt home");
            for tip in deep_dive.home_tips {
                let _ = writeln!(out, "  - {}", tip.title.as_deref().unwrap_or("Activity"));
                for step in &tip.steps {
                    let _ = writeln!(out, "      {step}");
                }
                if let Some(why) = &tip.why {
                    let _ = writeln!(out, "      why: {why}");
                }
            }
        }
        if !deep_dive.conversation_prompts.is_empty() {
            let _ = writeln!(out, "\nTalk about it");
            for prompt in deep_dive.conversation_prompts {
                let _ = writeln!(out, "  ? {prompt}");
            }
        }
        if let Some(note) = deep_dive.trend_note {
            let _ = writeln!(out, "\nTrend: {note}");
        }
    }

    if !view.risk_flags.is_empty() {
        let _ = writeln!(out, "\nPlease note");
        for flag in view.risk_flags {
            let severity = flag.severity.as_deref().unwrap_or("unrated");
            let _ = writeln!(
                out,
                "  [{severity}] {}: {}",
                flag.kind,
                flag.summary.as_deref().unwrap_or("")
            );
            if let Some(action) = &flag.action {
                let _ = writeln!(out, "      suggested: {action}");
            }
        }
    }
    let _ = write!(out, "\n{}", view.disclaimer);
    out
}
