//! Compact output rendering helpers for CLI surfaces.
//!
//! Keeps command result output bounded and readable while preserving signal.
//! Tool responses never go through here; they stay structured JSON.

use crate::plugins::archive::ArchiveResult;
use crate::plugins::contexts::Context;
use crate::plugins::patterns::{Severity, Warning};
use crate::plugins::recommend::Recommendation;
use crate::plugins::search::SearchHit;
use colored::Colorize;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Render up to `max_items` messages with compact formatting.
pub fn preview_messages(messages: &[String], max_items: usize, max_chars: usize) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let shown = messages
        .iter()
        .take(max_items)
        .map(|m| compact_line(m, max_chars))
        .collect::<Vec<_>>()
        .join(" | ");
    if messages.len() > max_items {
        format!("{} (+{} more)", shown, messages.len() - max_items)
    } else {
        shown
    }
}

fn severity_marker(severity: Severity) -> String {
    match severity {
        Severity::Critical => "✗ critical".bright_red().bold().to_string(),
        Severity::Warning => "⚠ warning".bright_yellow().to_string(),
        Severity::Info => "▸ info".bright_cyan().to_string(),
    }
}

pub fn context_line(ctx: &Context) -> String {
    let archived = if ctx.archived {
        format!(" {}", "archived".dimmed())
    } else {
        String::new()
    };
    format!(
        "{} [{}]{} {}: {}",
        ctx.id.bright_white(),
        ctx.status,
        archived,
        ctx.agent.bright_magenta(),
        compact_line(&ctx.goal, 100)
    )
}

pub fn render_contexts(contexts: &[Context]) -> String {
    contexts.iter().map(context_line).collect::<Vec<_>>().join("\n")
}

pub fn render_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "no matches".dimmed().to_string();
    }
    hits.iter()
        .map(|h| {
            let matched = serde_json::to_value(h.matched)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            format!("{} {}", context_line(&h.context), format!("({})", matched).dimmed())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_warnings(warnings: &[Warning]) -> String {
    if warnings.is_empty() {
        return format!("{} no warnings", "✓".bright_green());
    }
    warnings
        .iter()
        .map(|w| format!("{} {}: {}", severity_marker(w.severity), w.code.bold(), w.cause))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_recommendations(recs: &[Recommendation]) -> String {
    if recs.is_empty() {
        return "no recommendations".dimmed().to_string();
    }
    recs.iter()
        .map(|r| {
            let pitfalls = if r.known_pitfalls.is_empty() {
                String::new()
            } else {
                let keys: Vec<String> = r.known_pitfalls.iter().map(|p| p.key.clone()).collect();
                format!("\n    {} {}", "pitfalls:".bright_yellow(), preview_messages(&keys, 3, 40))
            };
            format!(
                "{:.3} {}{}",
                r.score,
                context_line(&r.context),
                pitfalls
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_archive(result: &ArchiveResult) -> String {
    if result.committed {
        return format!(
            "{} {} {} context(s)",
            "✓".bright_green(),
            result.action,
            result.transitioned.len()
        );
    }
    let reasons: Vec<String> = result
        .rejected
        .iter()
        .map(|r| format!("{}: {}", r.id, r.reason))
        .collect();
    format!(
        "{} {} rejected, nothing changed: {}",
        "✗".bright_red(),
        result.action,
        preview_messages(&reasons, 5, 120)
    )
}
