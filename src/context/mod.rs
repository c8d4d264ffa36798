//! What the model is told: the system prompt and the per-turn state
//! snapshot wrapped around operator lines.
//!
//! The system prompt is built once at startup from the persona (inline,
//! file, or built-in) plus rules for the configured decode mode.

use std::path::Path;

use anyhow::Context as _;

use crate::config::{Config, ModeKind};

/// Persona used when the config supplies none.
pub const DEFAULT_PERSONA: &str = "\
You are the operating system of an old research station's mainframe. An \
operator is connected through a raw terminal. There is no real shell and no \
real filesystem: you invent both, and whatever you show becomes fact.

When the operator types a Unix command (ls, cd, cat, grep, find, ps, top, \
git, uname, df and so on), answer with realistic output. The filesystem \
reflects the station's subsystems, logs and the people who worked there. \
Source files contain real, working code with comments that reveal history.

Keep everything consistent with what you have shown before. Reveal the \
system through exploration; not everything needs explaining.";

const SNAPSHOT_OPEN: &str = "<session_state>";
const SNAPSHOT_CLOSE: &str = "</session_state>";

/// Load the persona text named by the config.
pub async fn load_persona(cfg: &Config) -> anyhow::Result<String> {
    if let Some(text) = &cfg.persona.system_prompt {
        return Ok(text.trim().to_string());
    }
    if let Some(file) = &cfg.persona.system_prompt_file {
        let text = tokio::fs::read_to_string(Path::new(file))
            .await
            .with_context(|| format!("failed to read system prompt file: {file}"))?;
        return Ok(text.trim().to_string());
    }
    Ok(DEFAULT_PERSONA.to_string())
}

/// Persona plus the output rules for the configured mode.
pub async fn build_system_prompt(cfg: &Config) -> anyhow::Result<String> {
    let persona = load_persona(cfg).await?;
    Ok(compose(
        &persona,
        cfg.session.mode,
        cfg.session.stateful,
        &cfg.session.prompt,
    ))
}

/// Pure assembly of the system prompt.
pub fn compose(persona: &str, mode: ModeKind, stateful: bool, prompt_template: &str) -> String {
    let mut out = String::from(persona.trim());
    out.push_str("\n\nRules:\n");
    out.push_str(
        "- Output plain terminal text only. No markdown, no backticks, no code fences.\n\
         - For colour, write escape sequences as the literal text \\x1b, e.g. \\x1b[32m.\n\
         - Use box-drawing characters for panels and borders.\n",
    );
    match mode {
        ModeKind::Text => {
            let example = prompt_template.replace("{cwd}", "/");
            out.push_str(&format!(
                "- End every reply with the shell prompt for the current directory, \
                 formatted like \"{example}\".\n"
            ));
        }
        ModeKind::SingleField => out.push_str(
            "- Always respond through the terminal_output call. It is the only way to \
             communicate.\n\
             - Do not print a shell prompt; the terminal adds it.\n",
        ),
        ModeKind::MultiCall => out.push_str(
            "- Respond only through the provided calls; one reply may use several.\n\
             - Pick the most specific call: file_listing for ls, file_content for cat, \
             process_list for ps, system_status for diagnostics, command_output for \
             anything else.\n\
             - Whenever a command changes the filesystem, working directory or \
             environment, also emit state_update.\n\
             - Use remark sparingly, for brief commentary from the machine itself.\n\
             - Do not print a shell prompt; the terminal adds it.\n",
        ),
    }
    if stateful {
        out.push_str(&format!(
            "- Each operator message starts with a {SNAPSHOT_OPEN} block listing the \
             working directory, every path already shown (\"[cached]\" marks files whose \
             content was shown) and environment variables. Treat it as established fact \
             and never contradict it.\n"
        ));
    }
    out
}

/// Operator line as sent to the model in stateful mode.
pub fn wrap_with_snapshot(snapshot: &str, line: &str) -> String {
    format!("{SNAPSHOT_OPEN}\n{snapshot}\n{SNAPSHOT_CLOSE}\n\n{line}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_call_rules_mention_state_update() {
        let prompt = compose("persona", ModeKind::MultiCall, true, "{cwd} > ");
        assert!(prompt.starts_with("persona\n\nRules:"));
        assert!(prompt.contains("state_update"));
        assert!(prompt.contains("<session_state>"));
    }

    #[test]
    fn text_mode_shows_prompt_example() {
        let prompt = compose("p", ModeKind::Text, false, "{cwd} $ ");
        assert!(prompt.contains("\"/ $ \""));
        assert!(!prompt.contains("<session_state>"));
    }

    #[test]
    fn snapshot_wraps_line_last() {
        let wrapped = wrap_with_snapshot("cwd: /", "ls -la");
        assert_eq!(wrapped, "<session_state>\ncwd: /\n</session_state>\n\nls -la");
        assert_eq!(wrapped.lines().last(), Some("ls -la"));
    }

    #[tokio::test]
    async fn persona_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persona.md");
        tokio::fs::write(&path, "  You are a toaster.\n").await.unwrap();
        let mut cfg = Config::default();
        cfg.persona.system_prompt_file = Some(path.to_string_lossy().to_string());
        assert_eq!(load_persona(&cfg).await.unwrap(), "You are a toaster.");
    }
}
