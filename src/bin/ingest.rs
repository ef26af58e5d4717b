//! One ingest run: fetch the lookback window, summarize, store, and print
//! a morning summary.

use std::sync::Arc;

use chrono::Utc;

use inbox_triage_lib::error::{ErrorReport, TriageError};
use inbox_triage_lib::fetcher::GmailProvider;
use inbox_triage_lib::pipeline::{run_ingest, IngestReport};
use inbox_triage_lib::state::AppState;
use inbox_triage_lib::summarizer::openai::OpenAiModel;
use inbox_triage_lib::summarizer::{DisabledModel, LanguageModel, Summarizer};

/// Messages previewed in the printed summary.
const PREVIEW_COUNT: usize = 3;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(report) => print!("{}", morning_summary(&report)),
        Err(e) => {
            let report = ErrorReport::from(&e);
            eprintln!("Ingest failed: {}", report.message);
            eprintln!("{}", report.recovery_suggestion);
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<IngestReport, TriageError> {
    let state = AppState::load()?;

    let model: Arc<dyn LanguageModel> = match OpenAiModel::from_config(&state.config.summarizer) {
        Ok(model) => Arc::new(model),
        Err(e) => {
            log::warn!("ingest: summaries will use excerpts: {}", e);
            Arc::new(DisabledModel)
        }
    };
    let summarizer = Arc::new(Summarizer::new(model, state.config.summarizer.clone()));

    run_ingest(
        &state.db,
        &GmailProvider,
        summarizer,
        &state.config,
        Utc::now(),
    )
    .await
}

fn morning_summary(report: &IngestReport) -> String {
    let mut out = String::new();
    let count = report.messages.len();

    if count == 0 {
        out.push_str("No new emails since the last check.\n");
        return out;
    }

    out.push_str(&format!("{} new email(s)\n", count));
    out.push_str(&format!("  important: {}\n", report.important_count()));
    out.push_str(&format!("  action required: {}\n", report.action_count()));
    if let Some(start) = report.window_start {
        out.push_str(&format!(
            "  since: {}\n",
            start.format("%Y-%m-%d %H:%M UTC")
        ));
    }
    if report.degraded > 0 {
        out.push_str(&format!("  excerpt summaries: {}\n", report.degraded));
    }

    out.push('\n');
    for message in report.messages.iter().take(PREVIEW_COUNT) {
        let marker = if message.important { "!" } else { "-" };
        out.push_str(&format!(
            "{} {} | {}\n    {}\n",
            marker, message.sender, message.subject, message.summary
        ));
        if let Some(action) = &message.action_note {
            out.push_str(&format!("    action: {}\n", action));
        }
    }
    if count > PREVIEW_COUNT {
        out.push_str(&format!("... and {} more\n", count - PREVIEW_COUNT));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use inbox_triage_lib::pipeline::IngestedMessage;

    fn message(id: &str, important: bool, action: Option<&str>) -> IngestedMessage {
        IngestedMessage {
            provider_id: id.to_string(),
            sender: "jane@example.com".to_string(),
            subject: format!("Subject {}", id),
            summary: "Jane wants to meet.".to_string(),
            important,
            action_note: action.map(str::to_string),
        }
    }

    #[test]
    fn test_empty_run() {
        let summary = morning_summary(&IngestReport::default());
        assert_eq!(summary, "No new emails since the last check.\n");
    }

    #[test]
    fn test_preview_limits_to_three() {
        let report = IngestReport {
            messages: vec![
                message("a", true, Some("Reply by Friday.")),
                message("b", false, None),
                message("c", false, None),
                message("d", false, None),
                message("e", false, None),
            ],
            ..IngestReport::default()
        };
        let summary = morning_summary(&report);
        assert!(summary.starts_with("5 new email(s)\n"));
        assert!(summary.contains("important: 1"));
        assert!(summary.contains("action required: 1"));
        assert!(summary.contains("action: Reply by Friday."));
        assert!(summary.contains("Subject c"));
        assert!(!summary.contains("Subject d"));
        assert!(summary.ends_with("... and 2 more\n"));
    }
}
