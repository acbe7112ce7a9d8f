use std::sync::Arc;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use jobconductor::board::{Job, JobPosting};
use jobconductor::config::SandboxConfig;
use jobconductor::engine::process::store_env;
use jobconductor::engine::{Engine, EngineError, ProcessEngine, WorkUnit};
use jobconductor::persistence::{FlowDetail, FlowStep, FlowStore, MemoryFlowStore};

/// Create a test engine running steps directly through `sh`
fn test_engine(flows: Arc<MemoryFlowStore>) -> ProcessEngine {
    ProcessEngine::new(flows, SandboxConfig::default())
}

fn step(command: &str) -> FlowStep {
    FlowStep {
        name: "step".to_string(),
        command: command.to_string(),
    }
}

fn work_unit(flow_uuid: Uuid, store: Map<String, Value>) -> WorkUnit {
    let posting = JobPosting::new("test-job", None, Map::new());
    WorkUnit {
        job: Job::new("/jobboard/app1/job0000000000".to_string(), 0, posting),
        flow_uuid,
        store,
    }
}

async fn saved(flows: &MemoryFlowStore, flow: FlowDetail) -> Uuid {
    let uuid = flow.uuid;
    flows.save(flow).await.unwrap();
    uuid
}

#[tokio::test]
async fn test_run_step_simple_command() {
    let engine = test_engine(Arc::new(MemoryFlowStore::new()));

    let result = engine.run_step(&step("echo hello"), &[]).await.unwrap();

    assert!(result.success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.output, Some("hello\n".to_string()));
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_run_step_empty_output() {
    let engine = test_engine(Arc::new(MemoryFlowStore::new()));

    let result = engine.run_step(&step("true"), &[]).await.unwrap();

    assert!(result.success);
    assert!(result.output.is_none()); // Empty output should be None
}

#[tokio::test]
async fn test_run_step_failure_captures_stderr() {
    let engine = test_engine(Arc::new(MemoryFlowStore::new()));

    let result = engine
        .run_step(&step("echo 'error message' >&2 && exit 3"), &[])
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.exit_code, Some(3));
    assert!(result.error.unwrap().contains("error message"));
}

#[tokio::test]
async fn test_run_step_failure_without_stderr() {
    let engine = test_engine(Arc::new(MemoryFlowStore::new()));

    let result = engine.run_step(&step("exit 1"), &[]).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.error, Some("Exit code: Some(1)".to_string()));
}

#[tokio::test]
async fn test_run_step_piped_commands() {
    let engine = test_engine(Arc::new(MemoryFlowStore::new()));

    let result = engine
        .run_step(&step("echo 'hello world' | wc -w"), &[])
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.output.unwrap().trim(), "2");
}

#[tokio::test]
async fn test_run_step_sees_store_env() {
    let engine = test_engine(Arc::new(MemoryFlowStore::new()));
    let mut store = Map::new();
    store.insert("target".to_string(), json!("world"));
    store.insert("retry-count".to_string(), json!(3));

    let result = engine
        .run_step(
            &step("echo \"$JOB_TARGET $JOB_RETRY_COUNT\""),
            &store_env(&store),
        )
        .await
        .unwrap();

    assert_eq!(result.output, Some("world 3\n".to_string()));
}

#[test]
fn test_store_env_names_and_values() {
    let mut store = Map::new();
    store.insert("name".to_string(), json!("plain"));
    store.insert("nested.key".to_string(), json!({"a": [1, 2]}));
    store.insert("flag".to_string(), json!(true));

    let mut env = store_env(&store);
    env.sort();

    assert_eq!(
        env,
        vec![
            ("JOB_FLAG".to_string(), "true".to_string()),
            ("JOB_NAME".to_string(), "plain".to_string()),
            ("JOB_NESTED_KEY".to_string(), "{\"a\":[1,2]}".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_engine_runs_every_step() {
    let flows = Arc::new(MemoryFlowStore::new());
    let marker = std::env::temp_dir().join(format!("jobconductor-{}", Uuid::new_v4()));
    let flow = FlowDetail::new("two-steps")
        .with_step("first", &format!("echo one > {}", marker.display()))
        .with_step("second", &format!("echo two >> {}", marker.display()));
    let flow_uuid = saved(&flows, flow).await;
    let engine = test_engine(Arc::clone(&flows));

    engine.run(work_unit(flow_uuid, Map::new())).await.unwrap();

    let written = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(written, "one\ntwo\n");
    let _ = std::fs::remove_file(&marker);
}

#[tokio::test]
async fn test_engine_stops_at_failing_step() {
    let flows = Arc::new(MemoryFlowStore::new());
    let marker = std::env::temp_dir().join(format!("jobconductor-{}", Uuid::new_v4()));
    let flow = FlowDetail::new("failing")
        .with_step("print", "echo Oeps! >&2; exit 1")
        .with_step("after", &format!("touch {}", marker.display()));
    let flow_uuid = saved(&flows, flow).await;
    let engine = test_engine(Arc::clone(&flows));

    let outcome = engine.run(work_unit(flow_uuid, Map::new())).await;

    match outcome {
        Err(EngineError::Task { task, reason }) => {
            assert_eq!(task, "print");
            assert!(reason.contains("Oeps!"));
        }
        other => panic!("expected a task failure, got {:?}", other),
    }
    assert!(!marker.exists(), "steps after a failure must not run");
}

#[tokio::test]
async fn test_engine_missing_flow_is_storage_failure() {
    let engine = test_engine(Arc::new(MemoryFlowStore::new()));

    let outcome = engine.run(work_unit(Uuid::new_v4(), Map::new())).await;

    assert!(matches!(outcome, Err(EngineError::Storage(_))));
    assert!(outcome.unwrap_err().is_retryable());
}

#[tokio::test]
async fn test_engine_empty_flow_is_execution_failure() {
    let flows = Arc::new(MemoryFlowStore::new());
    let flow_uuid = saved(&flows, FlowDetail::new("empty")).await;
    let engine = test_engine(Arc::clone(&flows));

    let outcome = engine.run(work_unit(flow_uuid, Map::new())).await;

    assert!(matches!(outcome, Err(EngineError::Execution(_))));
}

#[tokio::test]
async fn test_engine_passes_store_to_steps() {
    let flows = Arc::new(MemoryFlowStore::new());
    let flow = FlowDetail::new("check-store").with_step("check", "test \"$JOB_TARGET\" = world");
    let flow_uuid = saved(&flows, flow).await;
    let engine = test_engine(Arc::clone(&flows));

    let mut store = Map::new();
    store.insert("target".to_string(), json!("world"));
    engine.run(work_unit(flow_uuid, store)).await.unwrap();

    let outcome = engine.run(work_unit(flow_uuid, Map::new())).await;
    assert!(matches!(outcome, Err(EngineError::Task { .. })));
}
