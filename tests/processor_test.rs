// Integration tests for the streaming tag processor
//
// Drive StreamProcessor with mock executors: splicing, fragmentation,
// malformed markup, deadlines, retries and cancellation.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use common::{chunks, processor, processor_with, registry, run_stream, FlakyTool, FnTool, SlowTool};
use glad::ledger::{LedgerEvent, TaskStatus};
use glad::processor::{ProcessorError, ProcessorSettings};
use glad::tags::{render_all, ErrorClass, Fragment, TagKind, ToolKind};
use glad::tools::{ToolError, ToolExecutor, ToolSettings};

fn python_calc() -> FnTool {
    FnTool::new(ToolKind::Python, |input| match input {
        "print(1+1)" => Ok("2".to_string()),
        other => Ok(format!("ran {}", other)),
    })
}

fn drain_events(rx: &mut broadcast::Receiver<LedgerEvent>) -> Vec<LedgerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_region_split_across_fragments_is_spliced() {
    let tool = Arc::new(python_calc());
    let reg = registry(vec![(tool.clone() as Arc<dyn ToolExecutor>, ToolSettings::default())]);
    let (mut p, ledger) = processor(reg);
    let mut events = ledger.subscribe();

    let out = run_stream(&mut p, &["<python>print(1+1", ")</python> done"]).await;

    assert_eq!(out, "<result>2</result> done");
    assert_eq!(tool.calls(), vec!["print(1+1)".to_string()]);
    assert_eq!(ledger.len(), 1);
    let task = &ledger.list(&Default::default())[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.output.as_deref(), Some("2"));

    // Pending, then Running, then Completed
    let events = drain_events(&mut events);
    assert_eq!(events.len(), 3, "{:?}", events);
    assert!(matches!(
        events[0],
        LedgerEvent::Created { id, kind: ToolKind::Python } if id == task.id
    ));
    assert!(matches!(events[1], LedgerEvent::Started { id } if id == task.id));
    assert!(matches!(events[2], LedgerEvent::Completed { id } if id == task.id));
}

#[tokio::test]
async fn test_text_before_region_is_not_delayed() {
    let reg = registry(vec![(Arc::new(python_calc()) as Arc<dyn ToolExecutor>, ToolSettings::default())]);
    let (mut p, _) = processor(reg);

    let out = p.feed("Let me compute. <python>print(").await.unwrap();
    assert_eq!(render_all(&out), "Let me compute. ");

    let out = p.feed("1+1)</python>").await.unwrap();
    assert_eq!(render_all(&out), "<result>2</result>");
}

#[tokio::test]
async fn test_unknown_tags_pass_through() {
    let reg = registry(vec![(Arc::new(python_calc()) as Arc<dyn ToolExecutor>, ToolSettings::default())]);
    let (mut p, ledger) = processor(reg);

    let input = "compare <foo>bar</foo> and a < b and <pythonic> x";
    let out = run_stream(&mut p, &[input]).await;

    assert_eq!(out, input);
    assert!(ledger.is_empty());
    assert_eq!(p.summary().tool_calls, 0);
}

#[tokio::test]
async fn test_output_independent_of_fragmentation() {
    let input = "Intro é <thinking>plan ü</thinking> <python>print(1+1)</python> a < b \
                 <foo>x</foo> <terminal>ls -la</terminal> <answer>It is 2</answer></endtask> trailing <pyth";

    let make = || {
        registry(vec![
            (Arc::new(python_calc()) as Arc<dyn ToolExecutor>, ToolSettings::default()),
            (Arc::new(FnTool::upper(ToolKind::Terminal)) as Arc<dyn ToolExecutor>, ToolSettings::default()),
        ])
    };

    let (mut whole, whole_ledger) = processor(make());
    let expected = run_stream(&mut whole, &[input]).await;
    assert_eq!(
        expected,
        "Intro é <thinking>plan ü</thinking> <result>2</result> a < b \
         <foo>x</foo> <result>LS -LA</result> <answer>It is 2</answer></endtask> trailing <pyth"
    );

    for size in [1, 2, 3, 5, 8, 13] {
        let parts = chunks(input, size);
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        let (mut p, ledger) = processor(make());
        let out = run_stream(&mut p, &parts).await;
        assert_eq!(out, expected, "chunk size {}", size);
        assert_eq!(ledger.len(), whole_ledger.len(), "chunk size {}", size);
        assert_eq!(p.summary().tool_calls, 2);
        assert!(p.summary().endtask_seen);
    }
}

#[tokio::test]
async fn test_unterminated_tool_region_never_runs() {
    let tool = Arc::new(python_calc());
    let reg = registry(vec![(tool.clone() as Arc<dyn ToolExecutor>, ToolSettings::default())]);
    let (mut p, ledger) = processor(reg);

    let out = run_stream(&mut p, &["start <python>print(1+1)", " and more"]).await;

    assert_eq!(out, "start <python>print(1+1) and more");
    assert!(tool.calls().is_empty());
    assert!(ledger.is_empty());
    assert_eq!(p.summary().anomalies, 1);
}

#[tokio::test]
async fn test_regions_run_in_order() {
    let python = Arc::new(FnTool::upper(ToolKind::Python));
    let terminal = Arc::new(FnTool::upper(ToolKind::Terminal));
    let reg = registry(vec![
        (python.clone() as Arc<dyn ToolExecutor>, ToolSettings::default()),
        (terminal.clone() as Arc<dyn ToolExecutor>, ToolSettings::default()),
    ]);
    let (mut p, ledger) = processor(reg);

    let out = run_stream(
        &mut p,
        &["<python>a</python>1<terminal>b</terminal>2<python>c</python>"],
    )
    .await;

    assert_eq!(out, "<result>A</result>1<result>B</result>2<result>C</result>");
    assert_eq!(python.calls(), vec!["a".to_string(), "c".to_string()]);
    assert_eq!(terminal.calls(), vec!["b".to_string()]);

    // Ids follow dispatch order
    let ids = &p.summary().task_ids;
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ledger.get(ids[1]).unwrap().kind, ToolKind::Terminal);
}

#[tokio::test]
async fn test_region_input_is_trimmed() {
    let tool = Arc::new(python_calc());
    let reg = registry(vec![(tool.clone() as Arc<dyn ToolExecutor>, ToolSettings::default())]);
    let (mut p, _) = processor(reg);

    let out = run_stream(&mut p, &["<python>\n  print(1+1)\n</python>"]).await;

    assert_eq!(out, "<result>2</result>");
    assert_eq!(tool.calls(), vec!["print(1+1)".to_string()]);
}

#[tokio::test]
async fn test_slow_tool_times_out() {
    let tool = SlowTool::new(ToolKind::Python, Duration::from_millis(200), false);
    let reg = registry(vec![(
        Arc::new(tool) as Arc<dyn ToolExecutor>,
        ToolSettings::default().with_timeout(Duration::from_millis(50)),
    )]);
    let (mut p, ledger) = processor(reg);
    let mut events = ledger.subscribe();

    let started = Instant::now();
    let out = p.feed("<python>sleep</python>").await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(190));
    assert_eq!(out.len(), 1);
    match &out[0] {
        Fragment::ToolError { class, message, .. } => {
            assert_eq!(*class, ErrorClass::Timeout);
            assert_eq!(message, "Tool execution timed out after 0.05 seconds");
        }
        other => panic!("expected a timeout splice, got {:?}", other),
    }
    assert_eq!(
        render_all(&out),
        "<result><error kind=\"timeout\">Tool execution timed out after 0.05 seconds</error></result>"
    );
    let task = ledger.get(out[0].task_id().unwrap()).unwrap();
    assert_eq!(task.status, TaskStatus::TimedOut);

    let events = drain_events(&mut events);
    assert_eq!(events.len(), 3, "{:?}", events);
    assert!(matches!(events[0], LedgerEvent::Created { id, .. } if id == task.id));
    assert!(matches!(events[1], LedgerEvent::Started { id } if id == task.id));
    assert!(matches!(events[2], LedgerEvent::TimedOut { id } if id == task.id));
}

#[tokio::test]
async fn test_timeout_is_not_retried() {
    let tool = Arc::new(SlowTool::new(ToolKind::Python, Duration::from_millis(200), false));
    let reg = registry(vec![(
        tool.clone() as Arc<dyn ToolExecutor>,
        ToolSettings::default()
            .with_timeout(Duration::from_millis(30))
            .with_retry(true),
    )]);
    let (mut p, ledger) = processor(reg);

    let out = p.feed("<python>x</python>").await.unwrap();

    assert!(matches!(out[0], Fragment::ToolError { class: ErrorClass::Timeout, .. }));
    assert_eq!(ledger.list(&Default::default())[0].attempts, 1);
}

#[tokio::test]
async fn test_execution_failure_retried_once_when_enabled() {
    let tool = Arc::new(FlakyTool::new(ToolKind::Python, 1));
    let reg = registry(vec![(
        tool.clone() as Arc<dyn ToolExecutor>,
        ToolSettings::default().with_retry(true),
    )]);
    let (mut p, ledger) = processor(reg);

    let out = run_stream(&mut p, &["<python>x</python>"]).await;

    assert_eq!(out, "<result>ok after 2</result>");
    assert_eq!(tool.attempts.load(Ordering::SeqCst), 2);
    let task = &ledger.list(&Default::default())[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 2);
}

#[tokio::test]
async fn test_retry_gives_up_after_second_failure() {
    let tool = Arc::new(FlakyTool::new(ToolKind::Python, 5));
    let reg = registry(vec![(
        tool.clone() as Arc<dyn ToolExecutor>,
        ToolSettings::default().with_retry(true),
    )]);
    let (mut p, ledger) = processor(reg);

    let out = run_stream(&mut p, &["<python>x</python>"]).await;

    assert_eq!(
        out,
        "<result><error kind=\"failed\">Tool execution failed: flaky</error></result>"
    );
    assert_eq!(tool.attempts.load(Ordering::SeqCst), 2);
    let task = &ledger.list(&Default::default())[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("flaky"));
}

#[tokio::test]
async fn test_failure_not_retried_when_disabled() {
    let tool = Arc::new(FlakyTool::new(ToolKind::Python, 1));
    let reg = registry(vec![(tool.clone() as Arc<dyn ToolExecutor>, ToolSettings::default())]);
    let (mut p, _) = processor(reg);

    let out = run_stream(&mut p, &["<python>x</python>"]).await;

    assert!(out.contains("Tool execution failed: flaky"));
    assert_eq!(tool.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejection_is_never_retried() {
    let tool = Arc::new(FnTool::new(ToolKind::Terminal, |_| {
        Err(ToolError::rejected("Command not allowed"))
    }));
    let reg = registry(vec![(
        tool.clone() as Arc<dyn ToolExecutor>,
        ToolSettings::default().with_retry(true),
    )]);
    let (mut p, ledger) = processor(reg);

    let out = run_stream(&mut p, &["<terminal>rm -rf /</terminal>"]).await;

    assert_eq!(
        out,
        "<result><error kind=\"rejected\">Command not allowed</error></result>"
    );
    assert_eq!(tool.calls().len(), 1);
    assert_eq!(ledger.list(&Default::default())[0].status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_interrupting_start_marker_degrades_region() {
    let reg = registry(vec![(
        Arc::new(FnTool::upper(ToolKind::Python)) as Arc<dyn ToolExecutor>,
        ToolSettings::default(),
    )]);
    let (mut p, ledger) = processor(reg);

    let out = run_stream(&mut p, &["<answer>hi <python>x</python></answer>"]).await;

    assert_eq!(out, "<answer>hi <result>X</result></answer>");
    assert_eq!(ledger.len(), 1);
    assert_eq!(p.summary().anomalies, 1);
}

#[tokio::test]
async fn test_large_region_in_small_chunks_scans_linearly() {
    let tool = Arc::new(FnTool::new(ToolKind::Python, |input| Ok(input.len().to_string())));
    let reg = registry(vec![(tool.clone() as Arc<dyn ToolExecutor>, ToolSettings::default())]);
    let (mut p, _) = processor(reg);

    // Every line carries a `<` that has to be ruled out as a marker
    let code = "if a < b: x\n".repeat(8 * 1024);
    let input = format!("<python>{}</python> tail", code);
    let parts = chunks(&input, 4);
    let parts: Vec<&str> = parts.iter().map(String::as_str).collect();

    let started = Instant::now();
    let out = run_stream(&mut p, &parts).await;

    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    assert_eq!(out, format!("<result>{}</result> tail", code.trim().len()));
    assert_eq!(tool.calls().len(), 1);
    assert_eq!(p.summary().anomalies, 0);
}

#[tokio::test]
async fn test_endtask_closes_open_task_region() {
    let (mut p, ledger) = processor(registry(vec![]));

    let input = "<task id=\"t1\">All done, the answer is 42.</endtask>";
    for size in [input.len(), 1, 3] {
        let (mut p, ledger) = processor(registry(vec![]));
        let parts = chunks(input, size);
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        let out = run_stream(&mut p, &parts).await;

        assert_eq!(out, input, "chunk size {}", size);
        assert!(p.summary().endtask_seen);
        assert_eq!(p.summary().anomalies, 0);

        let markers = ledger.markers();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].kind, TagKind::Task);
        assert_eq!(markers[0].label.as_deref(), Some("t1"));
        assert_eq!(markers[0].excerpt, "All done, the answer is 42.");
        assert_eq!(markers[1].label.as_deref(), Some("endtask"));
    }

    // Text after the marker streams normally
    let out = run_stream(&mut p, &["<task id=\"t2\">x</endtask> after"]).await;
    assert_eq!(out, "<task id=\"t2\">x</endtask> after");
    assert_eq!(ledger.markers().len(), 2);
}

#[tokio::test]
async fn test_endtask_inside_other_region_is_still_seen() {
    let (mut p, _) = processor(registry(vec![]));

    let out = run_stream(&mut p, &["<answer>42</endtask>"]).await;

    assert_eq!(out, "<answer>42</endtask>");
    assert!(p.summary().endtask_seen);
    assert_eq!(p.summary().anomalies, 1);
}

#[tokio::test]
async fn test_same_kind_nesting_closes_at_first_end_marker() {
    let tool = Arc::new(FnTool::upper(ToolKind::Python));
    let reg = registry(vec![(tool.clone() as Arc<dyn ToolExecutor>, ToolSettings::default())]);
    let (mut p, _) = processor(reg);

    let out = run_stream(&mut p, &["<python>a <python>b</python> c</python>"]).await;

    assert_eq!(out, "<result>A <PYTHON>B</result> c</python>");
    assert_eq!(tool.calls(), vec!["a <python>b".to_string()]);
}

#[tokio::test]
async fn test_disabled_tool_region_passes_through() {
    let tool = Arc::new(FnTool::upper(ToolKind::Python));
    let reg = registry(vec![(
        tool.clone() as Arc<dyn ToolExecutor>,
        ToolSettings::default().disabled(),
    )]);
    let (mut p, ledger) = processor(reg);

    let out = run_stream(&mut p, &["<python>x</python> <perplexity>q</perplexity>"]).await;

    assert_eq!(out, "<python>x</python> <perplexity>q</perplexity>");
    assert!(tool.calls().is_empty());
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_structural_regions_are_marked_not_dispatched() {
    let (mut p, ledger) = processor(registry(vec![]));

    let input = "<task id=\"t-7\">work</task><thinking> plan </thinking><progress>50%</progress>";
    let out = run_stream(&mut p, &[input]).await;

    assert_eq!(out, input);
    assert!(ledger.is_empty());

    let markers = ledger.markers();
    assert_eq!(markers.len(), 3);
    assert_eq!(markers[0].kind, TagKind::Task);
    assert_eq!(markers[0].label.as_deref(), Some("t-7"));
    assert_eq!(markers[1].kind, TagKind::Thinking);
    assert_eq!(markers[1].excerpt, "plan");
    assert_eq!(markers[2].kind, TagKind::Progress);
}

#[tokio::test]
async fn test_finalize_closes_structural_region() {
    let (mut p, ledger) = processor(registry(vec![]));

    let out = run_stream(&mut p, &["<answer>partial an", "swer"]).await;

    assert_eq!(out, "<answer>partial answer</answer>");
    let markers = ledger.markers();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].kind, TagKind::Answer);
    assert_eq!(p.summary().anomalies, 0);
}

#[tokio::test]
async fn test_memory_regions_are_collected() {
    let (mut p, _) = processor(registry(vec![]));

    run_stream(
        &mut p,
        &["<memory> prefers metric units </memory> ok <memory></memory>"],
    )
    .await;

    assert_eq!(
        p.take_memory_entries(),
        vec!["prefers metric units".to_string()]
    );
    assert!(p.take_memory_entries().is_empty());
}

#[tokio::test]
async fn test_endtask_passes_through_and_is_recorded() {
    let (mut p, ledger) = processor(registry(vec![]));

    let out = run_stream(&mut p, &["done </end", "task> after"]).await;

    assert_eq!(out, "done </endtask> after");
    assert!(p.summary().endtask_seen);
    assert_eq!(ledger.markers()[0].label.as_deref(), Some("endtask"));
}

#[tokio::test]
async fn test_halts_after_first_splice_when_requested() {
    let tool = Arc::new(FnTool::upper(ToolKind::Python));
    let reg = registry(vec![(tool.clone() as Arc<dyn ToolExecutor>, ToolSettings::default())]);
    let settings = ProcessorSettings {
        stop_after_splice: true,
        ..ProcessorSettings::default()
    };
    let (mut p, _) = processor_with(reg, settings, CancellationToken::new());

    let out = run_stream(&mut p, &["a <python>x</python> b", " <python>y</python>"]).await;

    assert_eq!(out, "a <result>X</result>");
    assert_eq!(tool.calls().len(), 1);
    assert!(p.is_halted());
}

#[tokio::test]
async fn test_cancel_stops_cooperative_tool() {
    let tool = Arc::new(SlowTool::new(ToolKind::Python, Duration::from_secs(5), true));
    let reg = registry(vec![(tool.clone() as Arc<dyn ToolExecutor>, ToolSettings::default())]);
    let cancel = CancellationToken::new();
    let (mut p, ledger) = processor_with(reg, ProcessorSettings::default(), cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let mut delivered = Vec::new();
    let started = Instant::now();
    let result = p
        .feed_with("before <python>x</python> after", &mut |f| delivered.push(f))
        .await;

    assert_eq!(result.unwrap_err(), ProcessorError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        render_all(&delivered),
        "before <result><error kind=\"cancelled\">Tool execution cancelled</error></result>"
    );

    let task = &ledger.list(&Default::default())[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("cancelled"));
    assert_eq!(tool.finished.load(Ordering::SeqCst), 0);

    assert_eq!(p.feed("more").await.unwrap_err(), ProcessorError::Cancelled);
}

#[tokio::test]
async fn test_cancel_discards_non_cooperative_result() {
    let tool = Arc::new(SlowTool::new(ToolKind::Python, Duration::from_millis(150), false));
    let reg = registry(vec![(
        tool.clone() as Arc<dyn ToolExecutor>,
        ToolSettings::default().with_timeout(Duration::from_secs(2)),
    )]);
    let cancel = CancellationToken::new();
    let (mut p, ledger) = processor_with(reg, ProcessorSettings::default(), cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = p.feed("<python>x</python>").await;
    assert_eq!(result.unwrap_err(), ProcessorError::Cancelled);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let task = &ledger.list(&Default::default())[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("cancelled; result discarded"));
    assert_eq!(tool.finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_before_dispatch_runs_nothing() {
    let tool = Arc::new(FnTool::upper(ToolKind::Python));
    let reg = registry(vec![(tool.clone() as Arc<dyn ToolExecutor>, ToolSettings::default())]);
    let cancel = CancellationToken::new();
    let (mut p, ledger) = processor_with(reg, ProcessorSettings::default(), cancel.clone());

    cancel.cancel();

    assert_eq!(
        p.feed("<python>x</python>").await.unwrap_err(),
        ProcessorError::Cancelled
    );
    assert_eq!(p.finalize().unwrap_err(), ProcessorError::Cancelled);
    assert!(tool.calls().is_empty());
    assert!(ledger.is_empty());
}
