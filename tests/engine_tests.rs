// ABOUTME: Integration tests for the trigger-driven scheduling engine
// ABOUTME: Covers root dispatch, joins, retries, timeouts, hooks, and the run log

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;
use signalbox::{EventKind, RetryPolicy, TaskSpec, TaskState, WorkflowEngine, WorkflowStatus};

mod common;
use common::{
    Probe, assert_stalled, failing_task, flaky_task, init_tracing, join_within, recording_task,
    slow_task, stuck_task, value_task,
};

#[tokio::test]
async fn test_roots_run_at_start_without_any_trigger() {
    init_tracing();
    let probe = Probe::new();
    let engine = WorkflowEngine::new(
        "roots",
        vec![
            recording_task("first", &probe),
            recording_task("second", &probe),
        ],
    )
    .unwrap();

    engine.start().unwrap();
    join_within(&engine, Duration::from_secs(2)).await;

    assert_eq!(engine.status(), WorkflowStatus::Completed);
    assert_eq!(probe.count_of("first"), 1);
    assert_eq!(probe.count_of("second"), 1);
    assert_eq!(engine.results()["first"], json!("first"));
}

#[tokio::test]
async fn test_join_waits_for_every_declared_dependency() {
    let probe = Probe::new();
    let engine = WorkflowEngine::new(
        "join",
        vec![
            recording_task("a", &probe),
            slow_task("b", &probe, Duration::from_millis(80)),
            recording_task("sink", &probe).depends_on(["a", "b"]),
        ],
    )
    .unwrap();

    engine.start().unwrap();
    join_within(&engine, Duration::from_secs(2)).await;

    let events = probe.events();
    let sink_pos = probe.position_of("sink").unwrap();
    assert!(probe.position_of("a").unwrap() < sink_pos);
    assert!(probe.position_of("b").unwrap() < sink_pos);
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn test_fan_in_triggers_are_idempotent() {
    // Both predecessors unconditionally trigger "sink"; its join covers both,
    // so the first trigger cannot start it and the second must not start it
    // twice.
    let probe = Probe::new();
    let engine = WorkflowEngine::new(
        "fan-in",
        vec![
            recording_task("left", &probe).next(["sink"]),
            slow_task("right", &probe, Duration::from_millis(60)).next(["sink"]),
            recording_task("sink", &probe),
        ],
    )
    .unwrap();

    engine.start().unwrap();
    join_within(&engine, Duration::from_secs(2)).await;

    assert_eq!(probe.count_of("sink"), 1);
    let sink_pos = probe.position_of("sink").unwrap();
    assert!(probe.position_of("left").unwrap() < sink_pos);
    assert!(probe.position_of("right").unwrap() < sink_pos);
}

#[tokio::test]
async fn test_diamond_runs_every_task_exactly_once() {
    let probe = Probe::new();
    let engine = WorkflowEngine::new(
        "diamond",
        vec![
            recording_task("top", &probe).next(["left", "right"]),
            recording_task("left", &probe),
            recording_task("right", &probe),
            recording_task("bottom", &probe).depends_on(["left", "right"]),
        ],
    )
    .unwrap();

    engine.start().unwrap();
    join_within(&engine, Duration::from_secs(2)).await;

    for task in ["top", "left", "right", "bottom"] {
        assert_eq!(probe.count_of(task), 1, "{} ran more than once", task);
    }
    assert_eq!(engine.status(), WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_retry_until_success_logs_every_attempt() {
    let attempts = Arc::new(AtomicU32::new(0));
    let engine = WorkflowEngine::new(
        "retry",
        vec![
            flaky_task("flaky", 2, attempts.clone())
                .retry(RetryPolicy::fixed(3, Duration::from_millis(50))),
        ],
    )
    .unwrap();

    let started = Instant::now();
    engine.start().unwrap();
    join_within(&engine, Duration::from_secs(2)).await;
    let elapsed = started.elapsed();

    assert_eq!(engine.task_state("flaky"), Some(TaskState::Completed));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // Two inter-attempt delays of at least 50ms each.
    assert!(elapsed >= Duration::from_millis(100), "elapsed {:?}", elapsed);

    let log = engine.log();
    let events = log.task_events("flaky");
    let failures: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::TaskFailed)
        .collect();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].attempt, Some(1));
    assert_eq!(failures[1].attempt, Some(2));

    let completed = events
        .iter()
        .find(|e| e.kind == EventKind::TaskCompleted)
        .unwrap();
    assert_eq!(completed.attempt, Some(3));
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt() {
    let engine = WorkflowEngine::new(
        "timeouts",
        vec![
            stuck_task("stuck")
                .timeout(Duration::from_millis(50))
                .retry(RetryPolicy::fixed(2, Duration::from_millis(10))),
        ],
    )
    .unwrap();

    engine.start().unwrap();
    join_within(&engine, Duration::from_secs(2)).await;

    assert_eq!(engine.task_state("stuck"), Some(TaskState::Failed));

    let log = engine.log();
    let attempt_failures: Vec<_> = log
        .task_events("stuck")
        .iter()
        .filter(|e| e.kind == EventKind::TaskFailed && e.attempt.is_some())
        .collect();
    assert_eq!(attempt_failures.len(), 2);
    for failure in attempt_failures {
        assert!(
            failure.detail.contains("timed out"),
            "expected timeout in detail: {}",
            failure.detail
        );
    }
}

#[tokio::test]
async fn test_failed_predecessor_stalls_dependents_without_cascading() {
    let probe = Probe::new();
    let engine = WorkflowEngine::new(
        "stall",
        vec![
            failing_task("doomed"),
            recording_task("blocked", &probe).depends_on(["doomed"]),
            recording_task("independent", &probe),
        ],
    )
    .unwrap();

    engine.start().unwrap();
    assert_stalled(&engine, Duration::from_millis(300)).await;

    assert_eq!(engine.status(), WorkflowStatus::Running);
    assert_eq!(engine.task_state("doomed"), Some(TaskState::Failed));
    assert_eq!(engine.task_state("blocked"), Some(TaskState::Pending));
    assert_eq!(engine.task_state("independent"), Some(TaskState::Completed));

    // The stall is observable in the log: the failure is recorded and the
    // blocked task never started.
    let log = engine.log();
    assert!(
        log.task_events("doomed")
            .iter()
            .any(|e| e.kind == EventKind::TaskFailed)
    );
    assert!(log.task_events("blocked").is_empty());
    assert!(
        !log.workflow_events()
            .iter()
            .any(|e| e.kind == EventKind::WorkflowCompleted)
    );
}

#[tokio::test]
async fn test_hooks_fire_task_level_before_workflow_level() {
    let probe = Probe::new();
    let task_probe = probe.clone();
    let wf_probe = probe.clone();
    let engine = WorkflowEngine::builder("hooks")
        .task(
            value_task("only", json!(1))
                .on_start({
                    let probe = probe.clone();
                    move |e| probe.push(format!("task:start:{}", e.task))
                })
                .on_complete(move |e| task_probe.push(format!("task:complete:{}", e.task))),
        )
        .on_task_start({
            let probe = probe.clone();
            move |e| probe.push(format!("wf:start:{}", e.task))
        })
        .on_task_complete(move |e| wf_probe.push(format!("wf:complete:{}", e.task)))
        .build()
        .unwrap();

    engine.start().unwrap();
    join_within(&engine, Duration::from_secs(2)).await;

    let events = probe.events();
    assert_eq!(
        events,
        vec![
            "task:start:only",
            "wf:start:only",
            "task:complete:only",
            "wf:complete:only"
        ]
    );
}

#[tokio::test]
async fn test_on_error_hooks_fire_once_per_attempt() {
    let probe = Probe::new();
    let task_errors = probe.clone();
    let wf_errors = probe.clone();
    let attempts = Arc::new(AtomicU32::new(0));

    let engine = WorkflowEngine::builder("errors")
        .task(
            flaky_task("flaky", 1, attempts)
                .retry(RetryPolicy::fixed(2, Duration::from_millis(10)))
                .on_error(move |e| {
                    task_errors.push(format!("task:error:{}", e.attempt));
                }),
        )
        .on_task_error(move |e| {
            wf_errors.push(format!("wf:error:{}", e.attempt));
            assert!(e.error.is_some());
        })
        .build()
        .unwrap();

    engine.start().unwrap();
    join_within(&engine, Duration::from_secs(2)).await;

    assert_eq!(probe.events(), vec!["task:error:1", "wf:error:1"]);
    assert_eq!(engine.task_state("flaky"), Some(TaskState::Completed));
}

#[tokio::test]
async fn test_eligible_tasks_fan_out_without_throttling() {
    let probe = Probe::new();
    let tasks: Vec<TaskSpec> = (0..12)
        .map(|i| slow_task(&format!("task_{}", i), &probe, Duration::from_millis(80)))
        .collect();
    let engine = WorkflowEngine::new("fan-out", tasks).unwrap();

    let started = Instant::now();
    engine.start().unwrap();
    join_within(&engine, Duration::from_secs(2)).await;
    let elapsed = started.elapsed();

    assert_eq!(probe.events().len(), 12);
    // Sequential execution would take ~960ms.
    assert!(elapsed < Duration::from_millis(500), "elapsed {:?}", elapsed);
}

#[tokio::test]
async fn test_concurrency_limit_serializes_execution() {
    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let tasks: Vec<TaskSpec> = (0..4)
        .map(|i| {
            let active = active.clone();
            let peak = peak.clone();
            TaskSpec::new(format!("task_{}", i), move |_ctx| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            })
        })
        .collect();

    let engine = WorkflowEngine::builder("limited")
        .tasks(tasks)
        .concurrency_limit(1)
        .build()
        .unwrap();

    engine.start().unwrap();
    join_within(&engine, Duration::from_secs(2)).await;

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_workflow_completes_immediately() {
    let engine = WorkflowEngine::new("empty", Vec::new()).unwrap();
    engine.start().unwrap();
    join_within(&engine, Duration::from_millis(200)).await;

    assert_eq!(engine.status(), WorkflowStatus::Completed);

    let kinds: Vec<EventKind> = engine
        .log()
        .workflow_events()
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![EventKind::StartedWorkflow, EventKind::WorkflowCompleted]
    );
}

#[tokio::test]
async fn test_workflow_log_brackets_the_run() {
    let probe = Probe::new();
    let engine = WorkflowEngine::new(
        "brackets",
        vec![recording_task("a", &probe).next(["b"]), recording_task("b", &probe)],
    )
    .unwrap();

    engine.start().unwrap();
    join_within(&engine, Duration::from_secs(2)).await;

    let log = engine.log();
    let workflow_events = log.workflow_events();
    assert_eq!(workflow_events.first().unwrap().kind, EventKind::StartedWorkflow);
    assert_eq!(
        workflow_events.last().unwrap().kind,
        EventKind::WorkflowCompleted
    );

    for task in ["a", "b"] {
        let kinds: Vec<EventKind> = log.task_events(task).iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::TaskStarted, EventKind::TaskCompleted]);
    }
}

#[tokio::test]
async fn test_dependency_map_reflects_both_edge_sources() {
    let probe = Probe::new();
    let engine = WorkflowEngine::new(
        "deps",
        vec![
            recording_task("a", &probe).next(["c"]),
            recording_task("b", &probe),
            recording_task("c", &probe).depends_on(["b"]),
        ],
    )
    .unwrap();

    let map = engine.dependency_map();
    assert!(map["a"].is_empty());
    assert!(map["b"].is_empty());
    assert!(map["c"].contains("a"));
    assert!(map["c"].contains("b"));

    engine.start().unwrap();
    join_within(&engine, Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_describe_and_visualize_render_the_graph() {
    let probe = Probe::new();
    let engine = WorkflowEngine::new(
        "render",
        vec![recording_task("alpha", &probe).next(["omega"]), recording_task("omega", &probe)],
    )
    .unwrap();

    let text = engine.describe();
    assert!(text.contains("workflow 'render'"));
    assert!(text.contains("alpha"));
    assert!(text.contains("omega"));

    let dot = engine.visualize();
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("alpha"));
}
