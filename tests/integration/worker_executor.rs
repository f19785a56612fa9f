// tests/integration/worker_executor.rs

use crate::common::{TestResult, init_tracing, o, t, with_timeout};

use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;

use taskgov::errors::DispatchError;
use taskgov::protocol::{DataSource, DispatchRequest, FromWorker, InputLocation, TaskOutcome};
use taskgov::types::{FailureReason, ObjectId, Resources, TaskId, TaskPayload};
use taskgov::worker::{Executor, FunctionRegistry, LocalStore};

struct Fixture {
    executor: Executor,
    store: Arc<LocalStore>,
    reports: mpsc::UnboundedReceiver<FromWorker>,
    _dir: TempDir,
}

fn fixture(cpus: u32) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::new(dir.path(), 1 << 20));
    let (tx, reports) = mpsc::unbounded_channel();
    let executor = Executor::new(cpus, FunctionRegistry::with_builtins(), Arc::clone(&store), tx);
    Fixture {
        executor,
        store,
        reports,
        _dir: dir,
    }
}

fn request(
    task: u64,
    task_type: &str,
    config: &str,
    inputs: Vec<InputLocation>,
    outputs: &[u64],
) -> DispatchRequest {
    DispatchRequest {
        task: t(task),
        attempt: 1,
        payload: TaskPayload::new(task_type, config.as_bytes().to_vec()),
        inputs,
        outputs: outputs.iter().copied().map(ObjectId).collect(),
        resources: Resources::cpus(1),
    }
}

fn inline(object: u64, data: &[u8]) -> InputLocation {
    InputLocation {
        object: o(object),
        source: DataSource::Inline(data.to_vec()),
    }
}

/// Next task report, skipping spill notices.
async fn next_report(reports: &mut mpsc::UnboundedReceiver<FromWorker>) -> (TaskId, TaskOutcome) {
    with_timeout(async {
        loop {
            match reports.recv().await {
                Some(FromWorker::TaskReport { task, outcome, .. }) => return (task, outcome),
                Some(_) => continue,
                None => panic!("report channel closed"),
            }
        }
    })
    .await
}

#[tokio::test]
async fn concat_of_inline_inputs_is_stored_locally() -> TestResult {
    init_tracing();
    let mut f = fixture(1);
    f.executor.dispatch(request(
        1,
        "concat",
        "",
        vec![inline(10, b"ab"), inline(11, b"cd")],
        &[1],
    ))?;

    let (task, outcome) = next_report(&mut f.reports).await;
    assert_eq!(task, t(1));
    assert_eq!(outcome, TaskOutcome::Finished);
    assert_eq!(f.store.get(o(1)).await?, Some(Bytes::from_static(b"abcd")));
    assert_eq!(f.executor.running(), 0);
    Ok(())
}

#[tokio::test]
async fn a_running_task_is_not_started_twice() -> TestResult {
    init_tracing();
    let mut f = fixture(4);
    f.executor.dispatch(request(1, "sleep", "200", vec![], &[1]))?;

    let duplicate = f.executor.dispatch(request(1, "sleep", "200", vec![], &[1]));
    assert_eq!(duplicate, Err(DispatchError::AlreadyRunning(t(1))));
    assert_eq!(f.executor.running(), 1);

    let (task, outcome) = next_report(&mut f.reports).await;
    assert_eq!((task, outcome), (t(1), TaskOutcome::Finished));
    Ok(())
}

#[tokio::test]
async fn new_attempt_waits_for_the_cancelled_one_to_finish() -> TestResult {
    init_tracing();
    let mut f = fixture(4);
    f.executor.dispatch(request(1, "sleep", "60000", vec![], &[1]))?;
    assert!(f.executor.cancel(t(1)));

    let mut retry = request(1, "literal", "x", vec![], &[1]);
    retry.attempt = 2;
    let refused = f.executor.dispatch(retry.clone());
    assert_eq!(refused, Err(DispatchError::ResourceUnavailable(t(1))));

    let (task, outcome) = next_report(&mut f.reports).await;
    assert_eq!(
        (task, outcome),
        (t(1), TaskOutcome::Failed(FailureReason::Cancelled))
    );
    f.executor.dispatch(retry)?;
    let (task, outcome) = next_report(&mut f.reports).await;
    assert_eq!((task, outcome), (t(1), TaskOutcome::Finished));
    Ok(())
}

#[tokio::test]
async fn dispatch_beyond_free_slots_is_refused() -> TestResult {
    init_tracing();
    let mut f = fixture(1);
    f.executor.dispatch(request(1, "sleep", "200", vec![], &[1]))?;

    let refused = f.executor.dispatch(request(2, "literal", "x", vec![], &[2]));
    assert_eq!(refused, Err(DispatchError::ResourceUnavailable(t(2))));

    next_report(&mut f.reports).await;
    // The slot is free again.
    f.executor.dispatch(request(2, "literal", "x", vec![], &[2]))?;
    assert_eq!(next_report(&mut f.reports).await.1, TaskOutcome::Finished);
    Ok(())
}

#[tokio::test]
async fn cancel_aborts_a_running_task() -> TestResult {
    init_tracing();
    let mut f = fixture(1);
    f.executor.dispatch(request(1, "sleep", "60000", vec![], &[1]))?;

    assert!(f.executor.cancel(t(1)));
    let (task, outcome) = next_report(&mut f.reports).await;
    assert_eq!(task, t(1));
    assert_eq!(outcome, TaskOutcome::Failed(FailureReason::Cancelled));
    assert!(!f.store.contains(o(1)).await);
    assert!(!f.executor.cancel(t(1)), "nothing left to cancel");
    Ok(())
}

#[tokio::test]
async fn application_errors_are_reported_verbatim() -> TestResult {
    init_tracing();
    let mut f = fixture(1);
    f.executor.dispatch(request(1, "fail", "disk on fire", vec![], &[1]))?;
    let (_, outcome) = next_report(&mut f.reports).await;
    assert_eq!(
        outcome,
        TaskOutcome::Failed(FailureReason::Application("disk on fire".into()))
    );

    f.executor.dispatch(request(2, "no-such-function", "", vec![], &[2]))?;
    let (_, outcome) = next_report(&mut f.reports).await;
    assert!(matches!(
        outcome,
        TaskOutcome::Failed(FailureReason::Application(ref msg)) if msg.contains("no-such-function")
    ));
    Ok(())
}

#[tokio::test]
async fn missing_input_is_reported_as_unavailable() -> TestResult {
    init_tracing();
    let mut f = fixture(1);
    let local = InputLocation {
        object: o(5),
        source: DataSource::Local,
    };
    f.executor.dispatch(request(1, "concat", "", vec![local], &[1]))?;

    let (_, outcome) = next_report(&mut f.reports).await;
    assert_eq!(
        outcome,
        TaskOutcome::Failed(FailureReason::InputUnavailable { object: o(5) })
    );
    Ok(())
}

#[tokio::test]
async fn custom_functions_can_be_registered() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(LocalStore::new(dir.path(), 1 << 20));
    let (tx, mut reports) = mpsc::unbounded_channel();
    let mut functions = FunctionRegistry::new();
    functions.register("upper", |input| async move {
        let joined: Vec<u8> = input
            .inputs
            .iter()
            .flat_map(|b| b.to_ascii_uppercase())
            .collect();
        Ok(vec![Bytes::from(joined); input.outputs])
    });
    assert!(functions.contains("upper"));
    let executor = Executor::new(1, functions, Arc::clone(&store), tx);

    executor.dispatch(request(1, "upper", "", vec![inline(3, b"shout")], &[1, 2]))?;

    assert_eq!(next_report(&mut reports).await.1, TaskOutcome::Finished);
    assert_eq!(store.get(o(1)).await?, Some(Bytes::from_static(b"SHOUT")));
    assert_eq!(store.get(o(2)).await?, Some(Bytes::from_static(b"SHOUT")));
    Ok(())
}
