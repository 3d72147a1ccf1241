//! Plain terminal rendering of the sync state.
use std::fmt::Write;

use chrono::DateTime;
use colored::{Color, Colorize};

use crate::net::explorer::BlockDetails;
use crate::sync::SyncState;
use crate::theme::Theme;

pub const TITLE: &str = "Bitcoin Blockchain Browser";

struct Palette {
    title: Color,
    label: Color,
    value: Color,
    accent: Color,
    error: Color,
}

fn palette(theme: Theme) -> Palette {
    match theme {
        Theme::Light => Palette {
            title: Color::Blue,
            label: Color::Black,
            value: Color::Magenta,
            accent: Color::Green,
            error: Color::Red,
        },
        Theme::Dark => Palette {
            title: Color::BrightCyan,
            label: Color::BrightWhite,
            value: Color::BrightYellow,
            accent: Color::BrightGreen,
            error: Color::BrightRed,
        },
    }
}

/// `1231006505` -> `2009-01-03 18:15:05 UTC`
pub fn format_timestamp(secs: i64) -> String {
    match DateTime::from_timestamp(secs, 0) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => format!("{secs}s"),
    }
}

fn signed(n: i64) -> String {
    if n >= 0 { format!("+{n}") } else { n.to_string() }
}

/// Renders the dashboard. `highlight` flags a block id that was not shown before.
///
/// An error banner never hides the blocks already on screen.
pub fn render_dashboard(state: &SyncState, theme: Theme, highlight: bool) -> String {
    let p = palette(theme);
    let mut out = String::new();

    let _ = writeln!(out, "{}", TITLE.color(p.title).bold());

    let height = if state.loading {
        "Loading...".to_string()
    } else {
        match &state.block {
            Some(b) => b.height.to_string(),
            None => "Unknown".to_string(),
        }
    };
    let _ = write!(
        out,
        "{} {}",
        "Latest block height:".color(p.label),
        height.color(p.value).bold()
    );
    if highlight {
        let _ = write!(out, "  {}", "new block".color(p.accent).bold());
    }
    out.push('\n');

    if let Some(err) = &state.error {
        let _ = writeln!(out, "{}", format!("Error: {err}").color(p.error).bold());
    }

    if let Some(block) = &state.block {
        let _ = writeln!(out, "\n{}", "Current Block".color(p.title).underline());
        write_block(&mut out, block, &p);
        if let Some(dt) = state.time_delta() {
            let _ = writeln!(out, "  {} {}s", "Δ time:   ".color(p.label), dt);
        }
        if let Some(dtx) = state.tx_delta() {
            let _ = writeln!(
                out,
                "  {} {}",
                "Δ tx:     ".color(p.label),
                signed(dtx).color(p.accent)
            );
        }
    }

    if let Some(prev) = &state.previous_block {
        let _ = writeln!(out, "\n{}", "Previous Block".color(p.title).underline());
        write_block(&mut out, prev, &p);
    }

    out
}

fn write_block(out: &mut String, block: &BlockDetails, p: &Palette) {
    let tx = block
        .tx_count
        .map(|n| n.to_string())
        .unwrap_or_else(|| "N/A".to_string());
    let _ = writeln!(out, "  {} {}", "Block ID: ".color(p.label), block.id.color(p.value));
    let _ = writeln!(
        out,
        "  {} {}",
        "Timestamp:".color(p.label),
        format_timestamp(block.timestamp)
    );
    let _ = writeln!(out, "  {} {}", "Tx count: ".color(p.label), tx);
}
