//! Chat loop behaviour against a scripted backend

mod common;

use common::{pool_with, tool_turn, FailingTool, ScriptedBackend, StaticTool, Step};
use llm_relay::agent::{
    status_processing_tools, status_thinking, Assistant, ChatError, ChatOrchestrator,
    STATUS_FINDING_SERVER, STATUS_FORMATTING, STATUS_PREPARING,
};
use llm_relay::llm::{Message, Role};
use llm_relay::templates::{TemplateArgs, TemplateSet};
use llm_relay::tools::{Tool, ToolCatalog, ToolNames, ToolRegistry};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const URL: &str = "http://gpu-1:11434";

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

fn catalog(tools: Vec<Arc<dyn Tool>>) -> ToolCatalog {
    ToolCatalog::new(tools, Duration::from_secs(5))
}

#[tokio::test]
async fn weather_question_is_answered_after_one_tool_round() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Step::Reply(tool_turn(vec![("weather", json!({"city": "Paris"}))])),
        Step::Reply(Message::assistant("It's 22°C and clear in Paris.")),
    ]));
    let pool = pool_with(Arc::clone(&backend), &[URL]);
    let orchestrator = ChatOrchestrator::new(Arc::clone(&pool));
    let weather = StaticTool::weather();
    let weather_calls = Arc::clone(&weather.calls);

    let answer = orchestrator
        .run("S", "U", &catalog(vec![Arc::new(weather)]), None, deadline())
        .await
        .unwrap();

    assert_eq!(answer.text, "It's 22°C and clear in Paris.");
    assert_eq!(answer.model_calls, 2);
    assert_eq!(answer.tool_rounds, 1);
    assert_eq!(backend.chat_calls(), 2);
    assert_eq!(*weather_calls.lock().unwrap(), [json!({"city": "Paris"})]);

    // system, user, assistant(tool call), tool result, final answer
    let roles: Vec<_> = answer
        .conversation
        .messages()
        .iter()
        .map(|m| m.role)
        .collect();
    assert_eq!(
        roles,
        [Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );

    // The second request carried the tool result right after the tool call
    let second = &backend.requests()[1];
    assert_eq!(second.len(), 4);
    assert_eq!(second[0].content, "S");
    assert_eq!(second[1].content, "U");
    assert!(second[2].has_tool_calls());
    assert_eq!(second[3].role, Role::Tool);
    assert_eq!(second[3].content, "22C clear");

    // Every request advertised the catalog
    assert_eq!(backend.advertised(), [vec!["weather"], vec!["weather"]]);

    // Released exactly once: the single permit can be taken once, not twice
    assert_eq!(pool.held_count(), 0);
    let lease = pool.select_server(deadline()).await.unwrap();
    let second_lease = pool
        .select_server(Instant::now() + Duration::from_millis(60))
        .await;
    assert!(second_lease.is_err());
    drop(lease);
}

#[tokio::test]
async fn answer_without_tool_calls_takes_one_model_call() {
    let backend = Arc::new(ScriptedBackend::new(vec![Step::Reply(Message::assistant(
        "Hello!",
    ))]));
    let pool = pool_with(Arc::clone(&backend), &[URL]);
    let orchestrator = ChatOrchestrator::new(Arc::clone(&pool));

    let answer = orchestrator
        .run(
            "S",
            "U",
            &catalog(vec![Arc::new(StaticTool::weather())]),
            None,
            deadline(),
        )
        .await
        .unwrap();

    assert_eq!(answer.text, "Hello!");
    assert_eq!(answer.model_calls, 1);
    assert_eq!(answer.tool_rounds, 0);
    assert_eq!(backend.chat_calls(), 1);
    assert_eq!(pool.held_count(), 0);
}

#[tokio::test]
async fn endless_tool_calls_stop_after_ten_rounds() {
    let backend = Arc::new(ScriptedBackend::always(tool_turn(vec![(
        "weather",
        json!({"city": "Paris"}),
    )])));
    let pool = pool_with(Arc::clone(&backend), &[URL]);
    let orchestrator = ChatOrchestrator::new(Arc::clone(&pool));
    let weather = StaticTool::weather();
    let weather_calls = Arc::clone(&weather.calls);

    let err = orchestrator
        .run("S", "U", &catalog(vec![Arc::new(weather)]), None, deadline())
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::ToolLoopExceeded { rounds: 10 }));
    assert_eq!(weather_calls.lock().unwrap().len(), 10);
    assert_eq!(backend.chat_calls(), 11);
    assert_eq!(pool.held_count(), 0);
}

#[tokio::test]
async fn round_ceiling_is_configurable() {
    let backend = Arc::new(ScriptedBackend::always(tool_turn(vec![(
        "weather",
        json!({}),
    )])));
    let pool = pool_with(Arc::clone(&backend), &[URL]);
    let orchestrator = ChatOrchestrator::new(pool).with_max_tool_rounds(2);

    let err = orchestrator
        .run(
            "S",
            "U",
            &catalog(vec![Arc::new(StaticTool::weather())]),
            None,
            deadline(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::ToolLoopExceeded { rounds: 2 }));
    assert_eq!(backend.chat_calls(), 3);
}

#[tokio::test]
async fn unknown_tool_is_reported_to_the_model() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Step::Reply(tool_turn(vec![("teleport", json!({"to": "Mars"}))])),
        Step::Reply(Message::assistant("I can't do that.")),
    ]));
    let pool = pool_with(Arc::clone(&backend), &[URL]);
    let orchestrator = ChatOrchestrator::new(pool);
    let mut statuses = Vec::new();
    let mut sink = |s: &str| statuses.push(s.to_string());

    let answer = orchestrator
        .run(
            "S",
            "U",
            &catalog(vec![Arc::new(StaticTool::weather())]),
            Some(&mut sink),
            deadline(),
        )
        .await
        .unwrap();

    assert_eq!(answer.text, "I can't do that.");
    assert_eq!(backend.chat_calls(), 2);
    let tool_message = &backend.requests()[1][3];
    assert_eq!(tool_message.role, Role::Tool);
    assert_eq!(tool_message.content, "Tool 'teleport' not found");
    assert!(!statuses.iter().any(|s| s.contains("teleport")));
}

#[tokio::test]
async fn failing_tool_is_recorded_and_siblings_still_run() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Step::Reply(tool_turn(vec![
            ("forecast", json!({"city": "Oslo"})),
            ("weather", json!({"city": "Paris"})),
        ])),
        Step::Reply(Message::assistant("Paris is clear; Oslo is unknown.")),
    ]));
    let pool = pool_with(Arc::clone(&backend), &[URL]);
    let orchestrator = ChatOrchestrator::new(pool);
    let weather = StaticTool::weather();
    let weather_calls = Arc::clone(&weather.calls);

    orchestrator
        .run(
            "S",
            "U",
            &catalog(vec![
                Arc::new(FailingTool::new("forecast", "station offline")),
                Arc::new(weather),
            ]),
            None,
            deadline(),
        )
        .await
        .unwrap();

    let request = &backend.requests()[1];
    assert_eq!(request.len(), 5);
    assert_eq!(
        request[3].content,
        "Tool 'forecast' call error: station offline"
    );
    assert_eq!(request[4].content, "22C clear");
    assert_eq!(weather_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn tool_calls_run_in_received_order() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Step::Reply(tool_turn(vec![
            ("weather", json!({"city": "Paris"})),
            ("weather", json!({"city": "Lyon"})),
            ("weather", json!({"city": "Nice"})),
        ])),
        Step::Reply(Message::assistant("done")),
    ]));
    let pool = pool_with(backend, &[URL]);
    let orchestrator = ChatOrchestrator::new(pool);
    let weather = StaticTool::new("weather", &["line one", "line two"]);
    let weather_calls = Arc::clone(&weather.calls);

    let answer = orchestrator
        .run("S", "U", &catalog(vec![Arc::new(weather)]), None, deadline())
        .await
        .unwrap();

    let cities: Vec<_> = weather_calls
        .lock()
        .unwrap()
        .iter()
        .map(|args| args["city"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(cities, ["Paris", "Lyon", "Nice"]);

    let tool_messages: Vec<_> = answer
        .conversation
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(tool_messages, ["line one\nline two"; 3]);
}

#[tokio::test]
async fn status_events_follow_the_state_machine() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Step::Reply(tool_turn(vec![
            ("weather", json!({"city": "Paris"})),
            ("lookup", json!({"q": "Paris"})),
        ])),
        Step::Reply(Message::assistant("It's 22°C and clear in Paris.")),
    ]));
    let pool = pool_with(backend, &[URL]);
    let orchestrator = ChatOrchestrator::new(pool).with_tool_names(ToolNames::new(
        HashMap::from([("weather".to_string(), "🌦️ Checking the weather...".to_string())]),
    ));

    let mut templates = TemplateSet::new();
    templates.add("system", "S").unwrap();
    templates.add("user", "{{.Message}}").unwrap();
    let registry = Arc::new(ToolRegistry::new());
    registry
        .register_all([
            Arc::new(StaticTool::weather()) as Arc<dyn Tool>,
            Arc::new(StaticTool::new("lookup", &["capital of France"])),
        ])
        .await;
    let assistant = Assistant::new(templates, registry, orchestrator);

    let mut statuses = Vec::new();
    let mut sink = |s: &str| statuses.push(s.to_string());
    let answer = assistant
        .chat(
            "weather in Paris?",
            &TemplateArgs::new(),
            Some(&mut sink),
            deadline(),
        )
        .await
        .unwrap();

    assert_eq!(answer, "It's 22°C and clear in Paris.");
    assert_eq!(
        statuses,
        [
            STATUS_PREPARING.to_string(),
            STATUS_FINDING_SERVER.to_string(),
            status_thinking("gpu-1"),
            "🌦️ Checking the weather...".to_string(),
            "lookup".to_string(),
            status_processing_tools("gpu-1"),
            STATUS_FORMATTING.to_string(),
        ]
    );
}

#[tokio::test]
async fn backend_error_ends_the_invocation_and_frees_the_slot() {
    let backend = Arc::new(ScriptedBackend::new(vec![Step::Fail(
        "model crashed".into(),
    )]));
    let pool = pool_with(Arc::clone(&backend), &[URL]);
    let orchestrator = ChatOrchestrator::new(Arc::clone(&pool));

    let err = orchestrator
        .run("S", "U", &ToolCatalog::empty(), None, deadline())
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::Backend(_)));
    assert!(err.to_string().contains("model crashed"));
    assert_eq!(backend.chat_calls(), 1);
    assert_eq!(pool.held_count(), 0);
}

#[tokio::test]
async fn deadline_during_model_call_is_reported() {
    let backend = Arc::new(ScriptedBackend::new(vec![Step::Hang]));
    let pool = pool_with(backend, &[URL]);
    let orchestrator = ChatOrchestrator::new(Arc::clone(&pool));

    let started = Instant::now();
    let err = orchestrator
        .run(
            "S",
            "U",
            &ToolCatalog::empty(),
            None,
            Instant::now() + Duration::from_millis(150),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::DeadlineExceeded));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(pool.held_count(), 0);
}

#[tokio::test]
async fn no_live_backend_is_reported_at_the_deadline() {
    let backend = Arc::new(ScriptedBackend::new(Vec::new()).with_dead(&[URL]));
    let pool = pool_with(Arc::clone(&backend), &[URL]);
    let orchestrator = ChatOrchestrator::new(Arc::clone(&pool));
    let mut statuses = Vec::new();
    let mut sink = |s: &str| statuses.push(s.to_string());

    let err = orchestrator
        .run(
            "S",
            "U",
            &ToolCatalog::empty(),
            Some(&mut sink),
            Instant::now() + Duration::from_millis(200),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::NoBackendAvailable { .. }));
    assert!(err.is_retryable());
    assert_eq!(backend.chat_calls(), 0);
    assert_eq!(statuses, [STATUS_FINDING_SERVER]);
    assert_eq!(pool.held_count(), 0);
}

#[tokio::test]
async fn cancelled_invocation_releases_its_backend() {
    let backend = Arc::new(ScriptedBackend::new(vec![Step::Hang]));
    let pool = pool_with(Arc::clone(&backend), &[URL]);
    let orchestrator = ChatOrchestrator::new(Arc::clone(&pool));
    let catalog = ToolCatalog::empty();

    let run = orchestrator.run("S", "U", &catalog, None, deadline());
    let cut_short = tokio::time::timeout(Duration::from_millis(100), run).await;

    assert!(cut_short.is_err());
    assert_eq!(backend.chat_calls(), 1);
    assert_eq!(pool.held_count(), 0);
}

#[tokio::test]
async fn conversations_share_the_pool_without_sharing_a_backend() {
    const B: &str = "http://gpu-2:11434";
    let backend = Arc::new(
        ScriptedBackend::always(Message::assistant("done"))
            .with_chat_delay(Duration::from_millis(200)),
    );
    let pool = pool_with(Arc::clone(&backend), &[URL, B]);
    let orchestrator = Arc::new(ChatOrchestrator::new(Arc::clone(&pool)));

    let started = Instant::now();
    let mut runs = Vec::new();
    for i in 0..4 {
        let orchestrator = Arc::clone(&orchestrator);
        runs.push(tokio::spawn(async move {
            let user = format!("question {}", i);
            orchestrator
                .run("S", &user, &ToolCatalog::empty(), None, deadline())
                .await
        }));
    }

    let mut served_by = std::collections::HashSet::new();
    for run in runs {
        let answer = run.await.unwrap().unwrap();
        assert_eq!(answer.text, "done");
        served_by.insert(answer.backend.url);
    }
    let elapsed = started.elapsed();

    assert_eq!(backend.chat_calls(), 4);
    assert_eq!(backend.overlaps(), 0);
    assert_eq!(served_by.len(), 2);
    // Four 200ms conversations back to back would take 800ms
    assert!(elapsed < Duration::from_millis(700), "took {:?}", elapsed);
    assert_eq!(pool.held_count(), 0);
}
