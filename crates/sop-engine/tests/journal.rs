//! Journal recorder durability and recovery.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use sop_engine::procedure::parse_definition;
use sop_engine::recorder::ExecutionRecord;
use sop_engine::{
    EngineConfig, EngineError, ExecutionId, ExecutionRecorder, ExecutionStateMachine,
    ExecutionStatus, InMemoryDefinitionStore, JournalRecorder, Outcome,
};

const CHILLER: &str = r#"
id: chiller-check
status: active
steps:
  - {stepNumber: 1, title: Open panel, stepType: action}
  - stepNumber: 2
    title: Supply temperature
    stepType: measurement
    inputRequired: true
    inputType: measurement
    acceptableRange: {min: 4, max: 7, unit: C}
  - {stepNumber: 3, title: Close panel, stepType: action}
"#;

fn config() -> EngineConfig {
    EngineConfig {
        sync_writes: false,
        ..EngineConfig::default()
    }
}

fn engine(dir: &Path) -> (ExecutionStateMachine, Arc<JournalRecorder>) {
    let definitions = Arc::new(InMemoryDefinitionStore::new());
    definitions
        .register(parse_definition(CHILLER).unwrap())
        .unwrap();
    let recorder = Arc::new(JournalRecorder::open(dir, &config()).unwrap());
    (
        ExecutionStateMachine::new(definitions, recorder.clone()),
        recorder,
    )
}

/// Same as [`engine`], callable where a local `engine` shadows it.
fn reopen(dir: &Path) -> (ExecutionStateMachine, Arc<JournalRecorder>) {
    engine(dir)
}

fn journal_file(dir: &Path, id: &ExecutionId) -> PathBuf {
    dir.join(format!("{}.jsonl", id))
}

#[test]
fn test_execution_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let (engine, _) = engine(dir.path());
        let execution = engine.start("chiller-check", "op-3").unwrap();
        engine.submit_step(&execution.id, 1, None, "op-3").unwrap();
        engine
            .submit_step(&execution.id, 2, Some(json!(9.5)), "op-3")
            .unwrap();
        execution.id
    };

    let (engine, recorder) = engine(dir.path());
    assert_eq!(recorder.execution_ids().unwrap(), vec![id]);

    let execution = engine.execution(&id).unwrap();
    assert_eq!(execution.last_resolved_step(), Some(2));
    assert!(execution.completion(2).unwrap().is_deviation);
    assert_eq!(execution.context.get(&2), Some(&json!(9.5)));

    engine.submit_step(&id, 3, None, "op-4").unwrap();
    let sealed = engine.finalize(&id, Outcome::Conditional, "op-4").unwrap();
    assert_eq!(sealed.status, ExecutionStatus::Completed);
    assert_eq!(sealed.outcome, Some(Outcome::Conditional));

    let lines = fs::read_to_string(journal_file(dir.path(), &id)).unwrap();
    assert_eq!(lines.lines().count(), 5);
}

#[test]
fn test_sealed_execution_stays_sealed_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let (engine, _) = engine(dir.path());
        let execution = engine.start("chiller-check", "op-3").unwrap();
        engine.abandon(&execution.id, "chiller tripped").unwrap();
        execution.id
    };

    let (engine, _) = engine(dir.path());
    let execution = engine.execution(&id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Abandoned);
    assert!(matches!(
        engine.submit_step(&id, 1, None, "op-3"),
        Err(EngineError::ExecutionNotInProgress { .. })
    ));
}

#[test]
fn test_tampered_journal_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let (engine, _) = engine(dir.path());
        let execution = engine.start("chiller-check", "op-3").unwrap();
        engine.submit_step(&execution.id, 1, None, "op-3").unwrap();
        engine
            .submit_step(&execution.id, 2, Some(json!(5)), "op-3")
            .unwrap();
        execution.id
    };

    let path = journal_file(dir.path(), &id);
    let content = fs::read_to_string(&path).unwrap();
    fs::write(&path, content.replace("\"is_deviation\":false", "\"is_deviation\":true")).unwrap();

    let err = JournalRecorder::open(dir.path(), &config()).unwrap_err();
    assert!(matches!(err, EngineError::Storage(ref msg) if msg.contains("checksum")));
}

#[test]
fn test_missing_line_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let (engine, _) = engine(dir.path());
        let execution = engine.start("chiller-check", "op-3").unwrap();
        engine.submit_step(&execution.id, 1, None, "op-3").unwrap();
        engine
            .submit_step(&execution.id, 2, Some(json!(5)), "op-3")
            .unwrap();
        execution.id
    };

    let path = journal_file(dir.path(), &id);
    let content = fs::read_to_string(&path).unwrap();
    let kept: Vec<_> = content
        .lines()
        .enumerate()
        .filter(|(i, _)| *i != 1)
        .map(|(_, line)| line)
        .collect();
    fs::write(&path, kept.join("\n")).unwrap();

    let err = JournalRecorder::open(dir.path(), &config()).unwrap_err();
    assert!(matches!(err, EngineError::Storage(ref msg) if msg.contains("sequence")));
}

#[test]
fn test_journal_enforces_expected_last() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, recorder) = engine(dir.path());
    let execution = engine.start("chiller-check", "op-3").unwrap();
    engine.submit_step(&execution.id, 1, None, "op-3").unwrap();

    let stale = sop_engine::recorder::StepCompletion::completed(
        execution.id,
        2,
        Some(json!(5)),
        false,
        "op-9",
    );
    let err = recorder.append(stale, None).unwrap_err();
    assert!(matches!(
        err,
        EngineError::ConcurrentModification {
            expected: None,
            actual: Some(1)
        }
    ));

    let records = recorder.records(&execution.id).unwrap();
    assert_eq!(records.len(), 2);
    assert!(matches!(records[0], ExecutionRecord::Opened(_)));
}

#[test]
fn test_non_journal_files_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("notes.txt"), "not a journal").unwrap();
    let recorder = JournalRecorder::open(dir.path(), &config()).unwrap();
    assert!(recorder.execution_ids().unwrap().is_empty());
}

#[test]
fn test_empty_journal_is_set_aside() {
    let dir = tempfile::tempdir().unwrap();
    let healthy = {
        let (engine, _) = engine(dir.path());
        let execution = engine.start("chiller-check", "op-3").unwrap();
        engine.submit_step(&execution.id, 1, None, "op-3").unwrap();
        execution.id
    };
    let empty = ExecutionId::new();
    fs::write(journal_file(dir.path(), &empty), "").unwrap();

    let (engine, recorder) = engine(dir.path());
    assert_eq!(recorder.execution_ids().unwrap(), vec![healthy]);
    assert!(!journal_file(dir.path(), &empty).exists());
    assert!(dir
        .path()
        .join(format!("{}.jsonl.unreadable", empty))
        .exists());

    engine
        .submit_step(&healthy, 2, Some(json!(5.5)), "op-3")
        .unwrap();
    assert!(matches!(
        engine.execution(&empty),
        Err(EngineError::ExecutionNotFound(id)) if id == empty
    ));

    // The set-aside file stays out of later replays.
    let (_, recorder) = reopen(dir.path());
    assert_eq!(recorder.execution_ids().unwrap(), vec![healthy]);
}

#[test]
fn test_torn_final_entry_is_truncated() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let (engine, _) = engine(dir.path());
        let execution = engine.start("chiller-check", "op-3").unwrap();
        engine.submit_step(&execution.id, 1, None, "op-3").unwrap();
        execution.id
    };

    let path = journal_file(dir.path(), &id);
    let mut content = fs::read_to_string(&path).unwrap();
    content.push_str("{\"sequence\":2,\"record\":{\"rec");
    fs::write(&path, content).unwrap();

    let (engine, _) = engine(dir.path());
    let execution = engine.execution(&id).unwrap();
    assert_eq!(execution.last_resolved_step(), Some(1));
    assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);

    engine
        .submit_step(&id, 2, Some(json!(6.0)), "op-3")
        .unwrap();

    let (engine, _) = reopen(dir.path());
    assert_eq!(engine.execution(&id).unwrap().last_resolved_step(), Some(2));
    assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 3);
}

#[test]
fn test_damaged_middle_line_still_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let (engine, _) = engine(dir.path());
        let execution = engine.start("chiller-check", "op-3").unwrap();
        engine.submit_step(&execution.id, 1, None, "op-3").unwrap();
        execution.id
    };

    let path = journal_file(dir.path(), &id);
    let content = fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    lines[0].truncate(20);
    fs::write(&path, lines.join("\n") + "\n").unwrap();

    let err = JournalRecorder::open(dir.path(), &config()).unwrap_err();
    assert!(matches!(err, EngineError::Storage(ref msg) if msg.contains("line 1")));
}
