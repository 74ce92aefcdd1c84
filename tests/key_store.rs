use std::collections::BTreeMap;
use std::fs;

use kagi_llm::keys::{KeySource, KeyStore, ResolveOptions, SaveMode};
use kagi_llm::LLMError;
use serde_json::{Value, json};

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json")
}

#[test]
fn load_skips_comments_and_non_string_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("api_keys.json");
    fs::write(
        &path,
        r#"{
            "_comment": "put your keys here",
            "comment": "also ignored",
            "openai": "sk-openai",
            "anthropic": "",
            "settings": {"retries": 3},
            "HF_API_KEY": "hf_file"
        }"#,
    )
    .expect("write");

    let store = KeyStore::load(&path, false).expect("load");
    let services: Vec<_> = store.keys().keys().cloned().collect();
    assert_eq!(services, vec!["HF_API_KEY", "openai"]);
    assert_eq!(store.path(), Some(path.as_path()));

    let hf = store
        .resolve("huggingface", &ResolveOptions::default())
        .expect_err("HF_API_KEY is not a spelling of huggingface");
    assert!(matches!(hf, LLMError::NotFound { .. }));
    assert_eq!(
        store.resolve("openai", &ResolveOptions::default()).expect("openai").source,
        KeySource::File
    );
}

#[test]
fn missing_file_is_an_empty_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = KeyStore::load(dir.path().join("nope.json"), true).expect("load");
    assert!(store.keys().is_empty());
}

#[test]
fn corrupt_files_are_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broken = dir.path().join("broken.json");
    fs::write(&broken, "{ not json").expect("write");
    let err = KeyStore::load(&broken, true).expect_err("broken");
    assert!(matches!(err, LLMError::CorruptState { .. }));

    let list = dir.path().join("list.json");
    fs::write(&list, r#"["sk-1"]"#).expect("write");
    let err = KeyStore::load(&list, true).expect_err("not an object");
    assert!(matches!(err, LLMError::CorruptState { .. }));
}

#[test]
fn merge_save_preserves_unrelated_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("api_keys.json");
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(&path, r#"{"_comment": "keep me", "openai": "old", "extra": 1}"#).expect("write");

    let update = BTreeMap::from([
        ("openai".to_string(), "new".to_string()),
        ("anthropic".to_string(), "sk-ant".to_string()),
    ]);
    KeyStore::save(&update, &path, SaveMode::Merge).expect("merge");
    assert_eq!(
        read_json(&path),
        json!({"_comment": "keep me", "openai": "new", "extra": 1, "anthropic": "sk-ant"})
    );

    KeyStore::save(&update, &path, SaveMode::Replace).expect("replace");
    assert_eq!(read_json(&path), json!({"openai": "new", "anthropic": "sk-ant"}));
}

#[test]
fn load_then_replace_save_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("api_keys.json");
    fs::write(&path, r#"{"openai": "sk-1", "anthropic": "sk-2"}"#).expect("write");

    let store = KeyStore::load(&path, false).expect("load");
    let copy = dir.path().join("copy.json");
    KeyStore::save(store.keys(), &copy, SaveMode::Replace).expect("save");
    assert_eq!(read_json(&copy), read_json(&path));
}

#[test]
fn add_and_update_persist_to_backing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config").join("api_keys.json");

    let mut store = KeyStore::load(&path, false).expect("load");
    store.add("openai", "sk-1").expect("add");
    assert!(matches!(
        store.add("openai", "sk-2"),
        Err(LLMError::AlreadyExists { .. })
    ));
    store.update("openai", "sk-3").expect("update");
    assert!(matches!(
        store.update("anthropic", "sk-4"),
        Err(LLMError::NotFound { .. })
    ));

    assert_eq!(read_json(&path), json!({"openai": "sk-3"}));
    let reloaded = KeyStore::load(&path, false).expect("reload");
    assert_eq!(reloaded.file_key("openai"), Some("sk-3"));
}

#[test]
fn update_rewrites_the_stored_spelling() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("api_keys.json");
    fs::write(&path, r#"{"ANTHROPIC_API_KEY": "sk-old"}"#).expect("write");

    let mut store = KeyStore::load(&path, false).expect("load");
    assert!(matches!(
        store.add("anthropic", "sk-dup"),
        Err(LLMError::AlreadyExists { .. })
    ));
    store.update("anthropic", "sk-new").expect("update");

    assert_eq!(read_json(&path), json!({"ANTHROPIC_API_KEY": "sk-new"}));
    let reloaded = KeyStore::load(&path, false).expect("reload");
    assert_eq!(reloaded.file_key("anthropic"), Some("sk-new"));
}

#[test]
fn environment_fills_gaps_when_enabled() {
    let store = KeyStore::from_keys([("openai", "sk-file")]).with_env_lookup(|name| {
        (name == "ANTHROPIC_API_KEY" || name == "OPENAI_API_KEY").then(|| "sk-env".to_string())
    });

    let openai = store.resolve("openai", &ResolveOptions::default()).expect("file wins");
    assert_eq!(openai.key, "sk-file");
    let anthropic = store
        .resolve("anthropic", &ResolveOptions::default())
        .expect("env");
    assert_eq!(anthropic.source, KeySource::Environment);

    let err = store
        .resolve("anthropic", &ResolveOptions::default().use_env(false))
        .expect_err("env disabled");
    assert!(matches!(err, LLMError::NotFound { .. }));
}
