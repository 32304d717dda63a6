//! 从磁盘加载 tokenizer 目录，检查角色解析与往返稳定性

use std::fs;
use std::path::Path;

use vlm_engine::tokenizer::{byte_level_vocab, BpeTokenizer};
use vlm_engine::EngineError;

fn write_tokenizer_dir(dir: &Path) {
    let vocab = byte_level_vocab(["lo", "low", "Ġl", "Ġlow"]);
    fs::write(dir.join("vocab.json"), serde_json::to_string(&vocab).unwrap()).unwrap();
    fs::write(dir.join("merges.txt"), "#version: 0.2\nl o\nlo w\nĠ l\nĠl ow\nĠ low\n").unwrap();
    fs::write(
        dir.join("tokenizer_config.json"),
        r#"{
            "chat_template": "{% for message in messages %}{{ message.content }}{% endfor %}",
            "added_tokens_decoder": {
                "151643": {"content": "<|endoftext|>", "special": true},
                "151644": {"content": "<|im_start|>", "special": true},
                "151645": {"content": "<|im_end|>", "special": true},
                "151646": {"content": "<image>", "special": true}
            }
        }"#,
    )
    .unwrap();
    fs::write(
        dir.join("special_tokens_map.json"),
        r#"{"eos_token": {"content": "<|im_end|>", "lstrip": false}, "pad_token": "<|endoftext|>"}"#,
    )
    .unwrap();
}

#[test]
fn test_load_resolves_roles() {
    let dir = tempfile::tempdir().unwrap();
    write_tokenizer_dir(dir.path());

    let tok = BpeTokenizer::from_model_dir(dir.path()).unwrap();
    assert_eq!(tok.eos_id(), Some(151645));
    assert_eq!(tok.pad_id(), Some(151643));
    assert_eq!(tok.image_id(), Some(151646));
    assert_eq!(tok.bos_id(), None);
    assert!(tok.chat_template().unwrap().contains("message.content"));
}

#[test]
fn test_sibling_tokenizer_dir_is_used() {
    let root = tempfile::tempdir().unwrap();
    let model_dir = root.path().join("model");
    let tokenizer_dir = root.path().join("tokenizer");
    fs::create_dir_all(&model_dir).unwrap();
    fs::create_dir_all(&tokenizer_dir).unwrap();
    write_tokenizer_dir(&tokenizer_dir);

    let tok = BpeTokenizer::from_model_dir(&model_dir).unwrap();
    assert_eq!(tok.image_id(), Some(151646));
}

#[test]
fn test_missing_vocab_is_artifact_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = BpeTokenizer::from_model_dir(dir.path()).err().unwrap();
    assert!(matches!(err, EngineError::Artifact { .. }));
}

#[test]
fn test_malformed_merges_is_artifact_error() {
    let dir = tempfile::tempdir().unwrap();
    write_tokenizer_dir(dir.path());
    fs::write(dir.path().join("merges.txt"), "l o\nthree parts here\n").unwrap();
    let err = BpeTokenizer::from_model_dir(dir.path()).err().unwrap();
    assert!(matches!(err, EngineError::Artifact { .. }));
}

#[test]
fn test_round_trip_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    write_tokenizer_dir(dir.path());
    let tok = BpeTokenizer::from_model_dir(dir.path()).unwrap();

    let samples = [
        "low low lower",
        "héllo wörld, it's 2024!\n\ttabs  and  spaces ",
        "你好，世界 🌍",
        "<|im_start|>user\n<image>\nlow<|im_end|>",
    ];
    for text in samples {
        let ids = tok.tokenize(text).unwrap();
        let decoded = tok.detokenize(&ids);
        // 特殊 token 在 detokenize 时被跳过，其余内容逐字节还原
        let expected = text
            .replace("<|im_start|>", "")
            .replace("<|im_end|>", "")
            .replace("<image>", "");
        assert_eq!(decoded, expected);
        let again = tok.tokenize(&decoded).unwrap();
        assert_eq!(tok.detokenize(&again), decoded);
        if expected == text {
            assert_eq!(again, ids);
        }
    }
}

#[test]
fn test_merges_apply_across_words() {
    let dir = tempfile::tempdir().unwrap();
    write_tokenizer_dir(dir.path());
    let tok = BpeTokenizer::from_model_dir(dir.path()).unwrap();

    let ids = tok.tokenize("low low").unwrap();
    assert_eq!(ids, vec![tok.token_to_id("low").unwrap(), tok.token_to_id("Ġlow").unwrap()]);
}
