// tests/orchestrator.rs
// Turn-level behaviour of the round loop against in-memory fakes

mod common;

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use common::*;
use repopilot::cache::RepositoryCache;
use repopilot::chat::{ChatEvent, ConversationOrchestrator, StopReason, TurnRequest, TurnSummary};
use repopilot::config::{CacheConfig, DeployMode, LimitsConfig};
use repopilot::error::{PilotError, Result};
use repopilot::llm::{ChatRequest, ContentBlock, CostTracker, Effort, Message, Role};
use repopilot::tools::{ChangeAction, FileChange, MutationSafetyGuard, ToolExecutor};

const UTILS_TS: &str = "export function foo(a: number) {\n  return a + 1;\n}\n";

fn turn(text: &str, effort: Effort) -> TurnRequest {
    TurnRequest {
        model: "claude-sonnet-4-5".to_string(),
        system: Vec::new(),
        messages: vec![Message::user(text)],
        effort,
        thinking: false,
        web_search: false,
        repo_tools: true,
        request_text: text.to_string(),
    }
}

fn executor(repo: &Arc<InMemoryRepo>, mode: DeployMode, limits: &LimitsConfig) -> ToolExecutor {
    let cache = Arc::new(RepositoryCache::new(CacheConfig::default()));
    let bound = cache.bind(repo.clone(), repo_ref(), DEFAULT_BRANCH);
    ToolExecutor::new(bound, MutationSafetyGuard::new(mode), limits.clone())
}

fn orchestrator(
    model: &Arc<ScriptedModel>,
    repo: Option<&Arc<InMemoryRepo>>,
    mode: DeployMode,
    limits: LimitsConfig,
) -> ConversationOrchestrator {
    let executor = repo.map(|r| executor(r, mode, &limits));
    ConversationOrchestrator::new(model.clone(), executor, limits, mode)
}

async fn run_turn(
    orchestrator: ConversationOrchestrator,
    turn: TurnRequest,
) -> (Result<TurnSummary>, Vec<ChatEvent>) {
    let (tx, rx) = mpsc::channel(64);
    let handle = tokio::spawn(orchestrator.run(turn, tx, CancellationToken::new()));
    let events = collect(rx).await;
    (handle.await.unwrap(), events)
}

fn done_changes(events: &[ChatEvent]) -> Option<Vec<FileChange>> {
    match events.last() {
        Some(ChatEvent::Done { file_changes, .. }) => file_changes.clone(),
        other => panic!("expected done as the last event, got {other:?}"),
    }
}

/// Every tool_use in a request is answered, in order, by the next message
fn assert_paired(requests: &[ChatRequest]) {
    for request in requests {
        let messages = &request.messages;
        for (i, message) in messages.iter().enumerate() {
            let calls: Vec<&str> = message
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect();
            if calls.is_empty() {
                continue;
            }
            assert_eq!(message.role, Role::Assistant);
            let next = messages.get(i + 1).expect("tool_use must be followed by results");
            assert_eq!(next.role, Role::User);
            let answered: Vec<&str> = next
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(calls, answered);
        }
    }
}

#[tokio::test]
async fn test_rename_function_end_to_end() {
    let repo = Arc::new(InMemoryRepo::new().with_file("utils.ts", UTILS_TS));
    let model = Arc::new(ScriptedModel::new(vec![
        vec![
            Step::Text("Let me look at the file."),
            Step::Tool("read_file", json!({"path": "utils.ts"})),
        ],
        vec![Step::Tool(
            "str_replace",
            json!({"path": "utils.ts", "old_str": "function foo", "new_str": "function bar"}),
        )],
        vec![Step::Tool(
            "verify_edit",
            json!({"path": "utils.ts", "expected_snippet": "function bar"}),
        )],
        vec![Step::Text("Renamed foo to bar.")],
    ]));

    let (result, events) = run_turn(
        orchestrator(&model, Some(&repo), DeployMode::Direct, LimitsConfig::default()),
        turn("rename function foo to bar in utils.ts", Effort::Medium),
    )
    .await;
    let summary = result.unwrap();

    assert_eq!(summary.stop, StopReason::Completed);
    assert_eq!(summary.rounds, 4);
    assert_eq!(model.call_count(), 4);

    let results = tool_results(&events);
    assert_eq!(results.len(), 3);
    assert!(results[0].1.contains("export function foo"));
    assert!(results[1].1.contains("+1/-1"));
    assert!(results[2].1.starts_with("VERIFIED"));

    assert_eq!(
        done_changes(&events),
        Some(vec![FileChange::new("utils.ts", ChangeAction::Edit, 1, 1)])
    );
    let content = repo.content(DEFAULT_BRANCH, "utils.ts").unwrap();
    assert!(content.contains("function bar"));
    assert!(!content.contains("function foo"));
    assert_eq!(repo.write_count(), 1);

    assert!((summary.cost - 4.0 * ROUND_COST).abs() < 1e-9);
    assert_paired(&model.requests.lock().unwrap());
}

#[tokio::test]
async fn test_ambiguous_replace_makes_no_write() {
    let repo = Arc::new(InMemoryRepo::new().with_file("app.ts", "foo();\nfoo();\n"));
    let model = Arc::new(ScriptedModel::new(vec![
        vec![Step::Tool(
            "str_replace",
            json!({"path": "app.ts", "old_str": "foo();", "new_str": "bar();"}),
        )],
        vec![Step::Text("That string is ambiguous.")],
    ]));

    // Safe mode would create a working branch on the first write
    let (result, events) = run_turn(
        orchestrator(&model, Some(&repo), DeployMode::Safe, LimitsConfig::default()),
        turn("replace foo with bar", Effort::Medium),
    )
    .await;
    let summary = result.unwrap();

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(results[0].1.contains("found 2 times"));
    assert_eq!(done_changes(&events), None);
    assert!(summary.file_changes.is_empty());
    assert!(summary.pr_url.is_none());

    assert_eq!(repo.write_count(), 0);
    assert!(repo.branches_created.lock().unwrap().is_empty());
    assert_eq!(
        repo.content(DEFAULT_BRANCH, "app.ts").as_deref(),
        Some("foo();\nfoo();\n")
    );
}

#[tokio::test]
async fn test_round_limit_stops_without_extra_call() {
    let repo = Arc::new(InMemoryRepo::new().with_file("utils.ts", UTILS_TS));
    let model = Arc::new(ScriptedModel::looping(vec![
        Step::Tool("read_file", json!({"path": "utils.ts"})),
        Step::Tool("search_files", json!({"query": "utils"})),
    ]));
    let limits = LimitsConfig {
        max_rounds_low: 2,
        ..LimitsConfig::default()
    };

    let (result, events) = run_turn(
        orchestrator(&model, Some(&repo), DeployMode::Direct, limits),
        turn("keep looking", Effort::Low),
    )
    .await;
    let summary = result.unwrap();

    assert_eq!(model.call_count(), 2);
    assert_eq!(summary.rounds, 2);
    assert_eq!(summary.stop, StopReason::RoundLimit);
    assert!(all_text(&events).contains("Stopped after 2 rounds"));
    assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));

    // final round's calls are still answered
    let uses = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::ToolUse { .. }))
        .count();
    assert_eq!(uses, 4);
    assert_eq!(tool_results(&events).len(), 4);

    let requests = model.requests.lock().unwrap();
    assert_eq!(requests[1].messages.len(), 3);
    assert_paired(&requests);
}

#[tokio::test]
async fn test_tools_without_repository() {
    let model = Arc::new(ScriptedModel::new(vec![vec![
        Step::Text("Reading."),
        Step::Tool("read_file", json!({"path": "utils.ts"})),
    ]]));

    let (result, events) = run_turn(
        orchestrator(&model, None, DeployMode::Direct, LimitsConfig::default()),
        turn("read utils.ts", Effort::Medium),
    )
    .await;

    assert_eq!(result.unwrap().stop, StopReason::NoRepository);
    assert_eq!(model.call_count(), 1);
    assert!(tool_results(&events).is_empty());
    assert!(all_text(&events).contains("can't run repository tools"));
    assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));
}

#[tokio::test]
async fn test_upstream_failure_is_terminal_and_unbilled() {
    let model = Arc::new(ScriptedModel::new(vec![vec![
        Step::Text("Let me"),
        Step::Fail(529, "Overloaded"),
    ]]));
    let sink = Arc::new(Mutex::new(CostTracker::new()));

    let orchestrator = orchestrator(&model, None, DeployMode::Direct, LimitsConfig::default())
        .with_usage_sink(sink.clone());
    let (result, events) = run_turn(orchestrator, turn("hi", Effort::Medium)).await;

    assert!(matches!(result, Err(PilotError::Upstream { status: 529, .. })));
    assert_eq!(all_text(&events), "Let me");
    match events.last() {
        Some(ChatEvent::Error { message }) => assert!(message.contains("Overloaded")),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(!events.iter().any(|e| matches!(e, ChatEvent::Done { .. })));
    assert_eq!(sink.lock().await.lifetime().cost, 0.0);
}

#[tokio::test]
async fn test_cancel_mid_stream_stops_everything() {
    let model = Arc::new(ScriptedModel::new(vec![vec![Step::Text("partial"), Step::Hang]]));
    let orchestrator = orchestrator(&model, None, DeployMode::Direct, LimitsConfig::default());

    let (tx, mut rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(orchestrator.run(turn("hi", Effort::Medium), tx, cancel.clone()));

    loop {
        match rx.recv().await {
            Some(ChatEvent::Text { content }) => {
                assert_eq!(content, "partial");
                break;
            }
            Some(_) => continue,
            None => panic!("stream closed before text arrived"),
        }
    }
    cancel.cancel();

    assert!(matches!(handle.await.unwrap(), Err(PilotError::Cancelled)));
    assert!(collect(rx).await.is_empty());
    assert_eq!(model.call_count(), 1);
}

#[tokio::test]
async fn test_lifetime_cost_is_monotonic() {
    let sink = Arc::new(Mutex::new(CostTracker::new()));
    let repo = Arc::new(InMemoryRepo::new().with_file("utils.ts", UTILS_TS));

    let first = Arc::new(ScriptedModel::new(vec![vec![Step::Text("Hello.")]]));
    let (result, _) = run_turn(
        orchestrator(&first, None, DeployMode::Direct, LimitsConfig::default())
            .with_usage_sink(sink.clone()),
        turn("hi", Effort::Medium),
    )
    .await;
    result.unwrap();
    let after_one = sink.lock().await.lifetime();

    let second = Arc::new(ScriptedModel::new(vec![
        vec![Step::Tool("read_file", json!({"path": "utils.ts"}))],
        vec![Step::Text("Read it.")],
    ]));
    let (result, _) = run_turn(
        orchestrator(&second, Some(&repo), DeployMode::Direct, LimitsConfig::default())
            .with_usage_sink(sink.clone()),
        turn("read utils.ts", Effort::Medium),
    )
    .await;
    result.unwrap();
    let after_two = sink.lock().await.lifetime();

    assert!(after_one.cost > 0.0);
    assert!(after_two.cost >= after_one.cost);
    assert!((after_two.cost - 3.0 * ROUND_COST).abs() < 1e-9);
    assert_eq!(after_two.turns, 2);
    assert_eq!(after_two.usage.input, 3 * round_usage().input);
}

#[tokio::test]
async fn test_safe_mode_opens_pull_request() {
    let repo = Arc::new(InMemoryRepo::new().with_file("utils.ts", UTILS_TS));
    let model = Arc::new(ScriptedModel::new(vec![
        vec![Step::Tool(
            "str_replace",
            json!({"path": "utils.ts", "old_str": "function foo", "new_str": "function bar"}),
        )],
        vec![Step::Tool(
            "create_file",
            json!({"path": "docs/CHANGES.md", "content": "- renamed foo\n"}),
        )],
        vec![Step::Text("Done.")],
    ]));

    let (result, events) = run_turn(
        orchestrator(&model, Some(&repo), DeployMode::Safe, LimitsConfig::default()),
        turn("rename foo to bar", Effort::Medium),
    )
    .await;
    let summary = result.unwrap();

    let branches = repo.branches_created.lock().unwrap().clone();
    assert_eq!(branches.len(), 1);
    let branch = &branches[0];
    assert!(branch.starts_with("repopilot/"));

    assert_eq!(repo.content(DEFAULT_BRANCH, "utils.ts").as_deref(), Some(UTILS_TS));
    assert!(repo.content(branch, "utils.ts").unwrap().contains("function bar"));
    assert!(repo.content(branch, "docs/CHANGES.md").is_some());

    let prs = repo.pull_requests.lock().unwrap();
    assert_eq!(prs.len(), 1);
    assert_eq!(prs[0].base, DEFAULT_BRANCH);
    assert_eq!(&prs[0].head, branch);
    assert!(prs[0].body.contains("utils.ts"));

    assert!(summary.pr_url.is_some());
    match events.last() {
        Some(ChatEvent::Done {
            pr_url,
            file_changes,
            ..
        }) => {
            assert_eq!(pr_url, &summary.pr_url);
            let changes = file_changes.as_ref().unwrap();
            assert_eq!(changes.len(), 2);
            assert_eq!(changes[1].action, ChangeAction::Create);
        }
        other => panic!("expected done, got {other:?}"),
    }
}

#[tokio::test]
async fn test_events_follow_stream_order() {
    let repo = Arc::new(InMemoryRepo::new().with_file("utils.ts", UTILS_TS));
    let model = Arc::new(ScriptedModel::new(vec![
        vec![
            Step::Thinking("Need the file first."),
            Step::Text("Reading."),
            Step::Tool("read_file", json!({"path": "utils.ts"})),
        ],
        vec![Step::Text("It adds one.")],
    ]));

    let (result, events) = run_turn(
        orchestrator(&model, Some(&repo), DeployMode::Direct, LimitsConfig::default()),
        turn("what does foo do?", Effort::Medium),
    )
    .await;
    result.unwrap();

    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            ChatEvent::Text { .. } => "text",
            ChatEvent::Thinking { .. } => "thinking",
            ChatEvent::ToolUse { .. } => "tool_use",
            ChatEvent::ToolResult { .. } => "tool_result",
            ChatEvent::RoundStart { .. } => "round_start",
            ChatEvent::ToolStart { .. } => "tool_start",
            ChatEvent::Done { .. } => "done",
            ChatEvent::Error { .. } => "error",
        })
        .collect();
    assert_eq!(
        kinds,
        [
            "round_start",
            "thinking",
            "text",
            "tool_use",
            "tool_start",
            "tool_result",
            "round_start",
            "text",
            "done"
        ]
    );

    // thinking signature survives into the continuation
    let requests = model.requests.lock().unwrap();
    assert!(matches!(
        &requests[1].messages[1].content[0],
        ContentBlock::Thinking { signature, .. } if signature == "sig"
    ));
}

#[tokio::test]
async fn test_paused_turn_is_resumed() {
    let model = Arc::new(ScriptedModel::new(vec![
        vec![Step::Text("Searching the web..."), Step::Pause],
        vec![Step::Text(" The latest release is 2.0.")],
    ]));
    let mut request = turn("what is the latest release?", Effort::Medium);
    request.repo_tools = false;
    request.web_search = true;

    let (result, events) = run_turn(
        orchestrator(&model, None, DeployMode::Direct, LimitsConfig::default()),
        request,
    )
    .await;
    let summary = result.unwrap();

    assert_eq!(summary.stop, StopReason::Completed);
    assert_eq!(summary.rounds, 2);
    assert_eq!(model.call_count(), 2);
    assert_eq!(
        all_text(&events),
        "Searching the web... The latest release is 2.0."
    );
    assert!((summary.cost - 2.0 * ROUND_COST).abs() < 1e-9);
    assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));

    // the paused content goes back verbatim, as the trailing assistant entry
    let requests = model.requests.lock().unwrap();
    let resumed = &requests[1].messages;
    assert_eq!(resumed.len(), 2);
    assert_eq!(resumed[1].role, Role::Assistant);
    assert!(
        resumed[1]
            .content
            .iter()
            .any(|b| matches!(b, ContentBlock::ServerToolUse { name, .. } if name == "web_search"))
    );
}

#[tokio::test]
async fn test_pause_counts_against_round_limit() {
    let model = Arc::new(ScriptedModel::looping(vec![Step::Text("Still searching."), Step::Pause]));
    let limits = LimitsConfig {
        max_rounds_low: 2,
        ..LimitsConfig::default()
    };

    let (result, events) = run_turn(
        orchestrator(&model, None, DeployMode::Direct, limits),
        turn("search forever", Effort::Low),
    )
    .await;
    let summary = result.unwrap();

    assert_eq!(model.call_count(), 2);
    assert_eq!(summary.stop, StopReason::RoundLimit);
    assert!(all_text(&events).contains("Stopped after 2 rounds"));
    assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));

    // both paused rounds extend one assistant entry
    let requests = model.requests.lock().unwrap();
    assert_eq!(requests[1].messages.len(), 2);
}

#[tokio::test]
async fn test_search_tools_report_hits_and_misses() {
    let repo = Arc::new(
        InMemoryRepo::new()
            .with_file("src/utils.ts", UTILS_TS)
            .with_file("src/app.tsx", "import { foo } from './utils';\n")
            .with_file("node_modules/foo/index.ts", "export const foo = 1;\n"),
    );
    let model = Arc::new(ScriptedModel::new(vec![
        vec![
            Step::Tool("grep_search", json!({"query": "FUNCTION FOO", "extensions": [".ts"]})),
            Step::Tool("grep_search", json!({"query": "foo"})),
            Step::Tool("grep_search", json!({"query": "nothing-here"})),
            Step::Tool("search_files", json!({"query": "APP"})),
            Step::Tool("search_files", json!({"query": "missing"})),
        ],
        vec![Step::Text("Found it.")],
    ]));

    let (result, events) = run_turn(
        orchestrator(&model, Some(&repo), DeployMode::Direct, LimitsConfig::default()),
        turn("where is foo defined?", Effort::Medium),
    )
    .await;
    result.unwrap();

    let results = tool_results(&events);
    assert_eq!(results.len(), 5);

    let (name, text) = &results[0];
    assert_eq!(name, "grep_search");
    assert!(text.starts_with("1 match(es)"));
    assert!(text.contains("src/utils.ts:1: export function foo(a: number) {"));
    assert!(!text.contains("app.tsx"));

    // no filter: both sources, never the ignored directory
    assert!(results[1].1.contains("src/app.tsx:1:"));
    assert!(results[1].1.contains("src/utils.ts:1:"));
    assert!(!results[1].1.contains("node_modules"));

    assert_eq!(results[2].1, "No matches for \"nothing-here\".");
    assert!(results[3].1.contains("src/app.tsx"));
    assert_eq!(results[4].1, "No files matching \"missing\".");
    assert_eq!(done_changes(&events), None);
}

#[tokio::test]
async fn test_read_truncation_and_failed_verification() {
    let repo = Arc::new(InMemoryRepo::new().with_file("utils.ts", UTILS_TS));
    let model = Arc::new(ScriptedModel::new(vec![
        vec![
            Step::Tool("read_file", json!({"path": "utils.ts"})),
            Step::Tool(
                "verify_edit",
                json!({"path": "utils.ts", "expected_snippet": "function bar"}),
            ),
        ],
        vec![Step::Text("The rename has not happened yet.")],
    ]));
    let limits = LimitsConfig {
        read_file_max_chars: 10,
        ..LimitsConfig::default()
    };

    let (result, events) = run_turn(
        orchestrator(&model, Some(&repo), DeployMode::Direct, limits),
        turn("did the rename land?", Effort::Medium),
    )
    .await;
    result.unwrap();

    let total = UTILS_TS.chars().count();
    let results = tool_results(&events);
    let read = &results[0].1;
    assert!(read.contains(&format!("({total} characters, truncated to the first 10)")));
    assert!(read.contains("export fun"));
    assert!(!read.contains("return a + 1"));
    assert!(read.contains(&format!("[truncated: {} more characters not shown]", total - 10)));

    assert!(results[1].1.starts_with("NOT VERIFIED"));
}

#[tokio::test]
async fn test_missing_replace_target_leaves_file_untouched() {
    let repo = Arc::new(InMemoryRepo::new().with_file("utils.ts", UTILS_TS));
    let model = Arc::new(ScriptedModel::new(vec![
        vec![Step::Tool(
            "str_replace",
            json!({"path": "utils.ts", "old_str": "function qux", "new_str": "function bar"}),
        )],
        vec![Step::Text("There is no qux.")],
    ]));

    let (result, events) = run_turn(
        orchestrator(&model, Some(&repo), DeployMode::Direct, LimitsConfig::default()),
        turn("rename qux to bar", Effort::Medium),
    )
    .await;
    let summary = result.unwrap();

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(results[0].1.contains("old_str not found in utils.ts"));
    assert_eq!(done_changes(&events), None);
    assert!(summary.file_changes.is_empty());

    assert_eq!(repo.write_count(), 0);
    assert_eq!(repo.content(DEFAULT_BRANCH, "utils.ts").as_deref(), Some(UTILS_TS));
}
