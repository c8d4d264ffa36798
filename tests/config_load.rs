//! Integration test: configuration files on disk parse into a valid
//! `Config`, including the shipped template.

use std::path::Path;

use mirage_term::config::{Config, ModeKind, ProviderKind};
use mirage_term::context;

#[tokio::test]
async fn template_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates/config.yaml");
    let cfg = Config::load(&path).await.expect("template should load");
    assert_eq!(cfg.model.provider, ProviderKind::Anthropic);
    assert_eq!(cfg.session.mode, ModeKind::MultiCall);
    assert_eq!(cfg.session.leave_commands, vec!["exit", "logout", "quit"]);
    assert!(cfg.persona.system_prompt.is_none());
}

#[tokio::test]
async fn relative_persona_file_resolves_next_to_config() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("persona.md"), "You are a lighthouse keeper's log.\n")
        .await
        .unwrap();
    let config_path = dir.path().join("config.yaml");
    tokio::fs::write(
        &config_path,
        "model:\n  provider: stub\nsession:\n  mode: single_field\npersona:\n  system_prompt_file: persona.md\n",
    )
    .await
    .unwrap();

    let cfg = Config::load(&config_path).await.unwrap();
    let prompt = context::build_system_prompt(&cfg).await.unwrap();
    assert!(prompt.starts_with("You are a lighthouse keeper's log."));
    assert!(prompt.contains("terminal_output"));
}

#[tokio::test]
async fn explicit_missing_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::resolve(Some(&dir.path().join("nope.yaml")))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("failed to read config file"));
}

#[test]
fn both_persona_sources_are_rejected() {
    let yaml = "persona:\n  system_prompt: a\n  system_prompt_file: b.md\n";
    assert!(Config::parse(yaml).is_err());
}

#[test]
fn bad_listen_address_is_rejected() {
    let err = Config::parse("listen: not-an-address\n").unwrap_err();
    assert!(format!("{err:#}").contains("listen address"));
}
