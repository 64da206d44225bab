use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn tiny_config(output: &std::path::Path) -> String {
    serde_json::json!({
        "batch_size": 4,
        "forward_batch_size": 2,
        "ppo_batch_size": 2,
        "gradient_accumulation_steps": 1,
        "ppo_epochs": 1,
        "num_steps": 8,
        "max_generated_tokens": 4,
        "min_response_length": null,
        "output_dir": output,
        "seed": 3,
        "model": {
            "vocab_size": 12,
            "hidden_size": 8,
            "num_layers": 1,
            "max_seq_len": 32
        }
    })
    .to_string()
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("rlhf").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("PPO RLHF fine-tuning"));
}

#[test]
fn test_cli_init_then_check_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");

    Command::cargo_bin("rlhf")
        .unwrap()
        .arg("init-config")
        .arg("--output")
        .arg(&path)
        .assert()
        .success();
    assert!(path.exists());

    Command::cargo_bin("rlhf")
        .unwrap()
        .arg("check-config")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("training steps:        156"));
}

#[test]
fn test_cli_check_config_rejects_indivisible_batch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"batch_size": 10, "forward_batch_size": 5, "ppo_batch_size": 3}"#,
    )
    .unwrap();

    Command::cargo_bin("rlhf")
        .unwrap()
        .arg("check-config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("ppo_batch_size"));
}

#[test]
fn test_cli_train_synthetic() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("run");
    let config = dir.path().join("config.json");
    std::fs::write(&config, tiny_config(&output)).unwrap();

    Command::cargo_bin("rlhf")
        .unwrap()
        .arg("train")
        .arg("--config")
        .arg(&config)
        .arg("--num-prompts")
        .arg("4")
        .assert()
        .success()
        .stdout(predicate::str::contains("Training complete: 2 steps, 4 optimizer steps"));

    assert!(output.join("base").join("policy.pt").exists());
    assert!(output.join("policy").join("policy_epoch_000001.pt").exists());
    assert!(output.join("value").join("value_epoch_000001.pt").exists());
    assert!(!output.join("policy").join("recipe_state.json").exists());
}

#[test]
fn test_cli_train_from_prompt_file() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("run");
    let config = dir.path().join("config.json");
    let prompts = dir.path().join("prompts.jsonl");
    std::fs::write(&config, tiny_config(&output)).unwrap();
    std::fs::write(
        &prompts,
        "[2, 3, 4]\n{\"tokens\": [5, 6]}\n[7]\n\n[8, 9, 10, 11]\n[2, 2]\n[3, 4, 5]\n[6, 7]\n[8]\n",
    )
    .unwrap();

    Command::cargo_bin("rlhf")
        .unwrap()
        .arg("train")
        .arg("--config")
        .arg(&config)
        .arg("--prompts")
        .arg(&prompts)
        .assert()
        .success()
        .stdout(predicate::str::contains("Training complete"));

    assert!(output.join("logs").is_dir());
}
