//! Structured call → terminal bytes.
//!
//! Every function here is pure: the output depends only on the call's
//! arguments, never on session state, so a stored call always replays to
//! the same bytes.  Lines are joined with bare `\n`; the output translator
//! converts them for the transport.

pub mod ansi;

use crate::tools::{
    CommandOutput, FileContent, FileEntry, FileListing, ProcessList, Remark, Severity, SystemStatus, ToolCall,
};
use crate::vfs::NodeKind;

use ansi::{
    center, pad_end, pad_start, visible_width, BOLD, BRIGHT_BLUE, BRIGHT_GREEN, CYAN, DIM, GREEN,
    ITALIC, RED, RESET, YELLOW,
};

const DEFAULT_OWNER: &str = "root";
const DEFAULT_MODIFIED: &str = "Jan  1 00:00";
const PANEL_WIDTH: usize = 50;

/// Render any decoded call.  State mutations render to the empty string.
pub fn render(call: &ToolCall) -> String {
    match call {
        ToolCall::FileListing(c) => render_file_listing(c),
        ToolCall::FileContent(c) => render_file_content(c),
        ToolCall::CommandOutput(c) => render_command_output(c),
        ToolCall::ProcessList(c) => render_process_list(c),
        ToolCall::SystemStatus(c) => render_system_status(c),
        ToolCall::Remark(c) => render_remark(c),
        ToolCall::StateUpdate(_) => String::new(),
        ToolCall::Unknown { name } => format!("[unknown subsystem: {name}]"),
    }
}

/// Short bracketed line shown when a call could not be decoded.
pub fn render_diagnostic(message: &str) -> String {
    format!("{DIM}[decode error: {message}]{RESET}")
}

// ── Listing ──────────────────────────────────────────────────

pub fn render_file_listing(listing: &FileListing) -> String {
    if listing.entries.is_empty() {
        return String::new();
    }

    let max_owner = listing.entries.iter().map(|e| visible_width(owner_of(e))).max().unwrap_or(0);
    let max_group = listing.entries.iter().map(|e| visible_width(group_of(e))).max().unwrap_or(0);
    let max_size = listing.entries.iter().map(|e| visible_width(size_of(e))).max().unwrap_or(0);

    let mut lines = Vec::with_capacity(listing.entries.len() + 1);
    lines.push(format!("total {}", listing.entries.len()));

    for entry in &listing.entries {
        let type_char = match entry.kind {
            NodeKind::Dir => 'd',
            NodeKind::Symlink => 'l',
            NodeKind::File => '-',
        };
        let perms = entry.permissions.as_deref().unwrap_or(match entry.kind {
            NodeKind::Dir => "rwxr-xr-x",
            _ => "rw-r--r--",
        });
        let name = match entry.kind {
            NodeKind::Dir => format!("{BOLD}{BRIGHT_BLUE}{}/{RESET}", entry.name),
            NodeKind::Symlink => format!(
                "{CYAN}{}{RESET} -> {}",
                entry.name,
                entry.link_target.as_deref().unwrap_or("???")
            ),
            NodeKind::File if perms.contains('x') => {
                format!("{BRIGHT_GREEN}{}{RESET}", entry.name)
            }
            NodeKind::File => entry.name.clone(),
        };
        lines.push(format!(
            "{type_char}{perms}  1 {} {} {GREEN}{}{RESET} {} {name}",
            pad_end(owner_of(entry), max_owner),
            pad_end(group_of(entry), max_group),
            pad_start(size_of(entry), max_size),
            entry.modified.as_deref().unwrap_or(DEFAULT_MODIFIED),
        ));
    }

    lines.join("\n")
}

fn owner_of(e: &FileEntry) -> &str {
    e.owner.as_deref().unwrap_or(DEFAULT_OWNER)
}

fn group_of(e: &FileEntry) -> &str {
    e.group.as_deref().unwrap_or(DEFAULT_OWNER)
}

fn size_of(e: &FileEntry) -> &str {
    e.size.as_deref().unwrap_or("0")
}

// ── File content ─────────────────────────────────────────────

pub fn render_file_content(file: &FileContent) -> String {
    let body = file.content.strip_suffix('\n').unwrap_or(&file.content);
    let body_lines: Vec<&str> = body.split('\n').collect();
    let width = body_lines.len().to_string().len().max(3);

    body_lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{DIM}{:>width$} {RESET}{DIM}│{RESET} {line}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Plain lines ──────────────────────────────────────────────

pub fn render_command_output(output: &CommandOutput) -> String {
    output.lines.join("\n")
}

pub fn render_remark(remark: &Remark) -> String {
    format!("{ITALIC}{CYAN}{}{RESET}", remark.text)
}

// ── Process table ────────────────────────────────────────────

pub fn render_process_list(list: &ProcessList) -> String {
    let mut lines = vec![format!(
        "{BOLD}USER          PID %CPU %MEM     VSZ   RSS TTY      STAT START   TIME    COMMAND{RESET}"
    )];
    for p in &list.processes {
        let or = |v: &Option<String>, d: &'static str| v.clone().unwrap_or_else(|| d.to_string());
        lines.push(format!(
            "{}{} {} {} {} {} {} {} {} {} {}",
            pad_end(&p.user, 12),
            pad_start(&p.pid.to_string(), 5),
            pad_start(&or(&p.cpu, "0.0"), 4),
            pad_start(&or(&p.mem, "0.0"), 4),
            pad_start(&or(&p.vsz, "0"), 7),
            pad_start(&or(&p.rss, "0"), 5),
            pad_end(&or(&p.tty, "?"), 8),
            pad_end(&or(&p.stat, "S"), 4),
            pad_end(&or(&p.start, "00:00"), 7),
            pad_end(&or(&p.time, "0:00"), 7),
            p.command,
        ));
    }
    lines.join("\n")
}

// ── Status panel ─────────────────────────────────────────────

fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Ok => GREEN,
        Severity::Warning => YELLOW,
        Severity::Critical => RED,
        Severity::Inactive => DIM,
        Severity::Info => CYAN,
    }
}

pub fn render_system_status(status: &SystemStatus) -> String {
    let rule = "═".repeat(PANEL_WIDTH);
    let mut lines = vec![
        format!("╔{rule}╗"),
        format!("║{}║", center(&status.title, PANEL_WIDTH)),
        format!("╠{rule}╣"),
    ];
    for entry in &status.entries {
        let color = severity_color(entry.severity.unwrap_or_default());
        let visible = format!("  {}: {}", entry.label, entry.value);
        let padding = PANEL_WIDTH.saturating_sub(visible_width(&visible));
        lines.push(format!(
            "║  {}: {color}{}{RESET}{}║",
            entry.label,
            entry.value,
            " ".repeat(padding)
        ));
    }
    lines.push(format!("╚{rule}╝"));
    lines.join("\n")
}
