//! End-to-end tests for the send, regenerate and cancel flows of ChatPipeline.
//!
//! Adapters are scripted so every chunk, delay and failure is deterministic.

use std::sync::Arc;
use std::time::Duration;

use chat_core::{Message, ProjectRef, Role, WorkspaceContext};
use chat_llm::{
    AdapterRegistry, ChatAdapter, ChatChunk, HistoryMessage, ScriptStep, ScriptedAdapter,
};
use chat_pipeline::{
    ChatPipeline, ConversationStore, MemoryPersistence, PipelineConfig, PipelineError,
    PipelineEvent, PipelinePhase, SendOutcome, StreamError, ADAPTER_NOT_FOUND_MESSAGE, STREAM_ERROR_MESSAGE,
};

fn config(provider: &str) -> PipelineConfig {
    PipelineConfig {
        provider: provider.to_string(),
        stream_idle_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn registry_with(adapters: Vec<(&str, Arc<dyn ChatAdapter>)>) -> Arc<AdapterRegistry> {
    let registry = AdapterRegistry::new();
    for (id, adapter) in adapters {
        registry.register(id, adapter);
    }
    Arc::new(registry)
}

fn pipeline_with(adapter: Arc<ScriptedAdapter>) -> ChatPipeline {
    ChatPipeline::new(
        registry_with(vec![("scripted", adapter as Arc<dyn ChatAdapter>)]),
        Arc::new(ConversationStore::new()),
        config("scripted"),
    )
}

fn hanging_after(text: &str) -> Arc<ScriptedAdapter> {
    Arc::new(ScriptedAdapter::new(vec![
        ScriptStep::Chunk(ChatChunk::content(text)),
        ScriptStep::Hang,
    ]))
}

fn messages(pipeline: &ChatPipeline, conversation_id: &str) -> Vec<Message> {
    pipeline.store().messages(conversation_id).unwrap()
}

/// Wait until some conversation holds a streaming assistant message with `content`.
async fn wait_for_streaming(pipeline: &ChatPipeline, content: &str) -> (String, String) {
    for _ in 0..400 {
        for conversation in pipeline.conversations() {
            if let Some(message) = conversation
                .messages
                .iter()
                .find(|m| m.is_assistant() && m.is_streaming && m.content == content)
            {
                return (conversation.id.clone(), message.id.clone());
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no streaming message with content {content:?}");
}

// ============================================================================
// Send flow
// ============================================================================

#[tokio::test]
async fn test_send_streams_chunks_into_finalized_message() {
    let adapter = Arc::new(ScriptedAdapter::from_chunks(["Foo ", "is ", "bar"]));
    let pipeline = pipeline_with(adapter.clone());

    let outcome = pipeline.send("What is foo?").await.unwrap();

    let SendOutcome::Finalized {
        conversation_id,
        message_id,
        metadata,
        ..
    } = &outcome
    else {
        panic!("expected finalized outcome, got {outcome:?}");
    };
    assert_eq!(metadata.token_count, Some(3));

    let messages = messages(&pipeline, conversation_id);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "What is foo?");

    let reply = &messages[1];
    assert_eq!(&reply.id, message_id);
    assert_eq!(reply.content, "Foo is bar");
    assert!(!reply.is_streaming);
    assert_eq!(reply.provider.as_deref(), Some("scripted"));
    assert_eq!(reply.model.as_deref(), Some("scripted"));
    assert_eq!(reply.metadata.as_ref().unwrap().token_count, Some(3));

    assert!(!pipeline.is_loading());
    assert_eq!(pipeline.phase(conversation_id), PipelinePhase::Idle);
    assert_eq!(pipeline.streams().live_count(), 0);
    assert_eq!(
        adapter.calls()[0].history,
        vec![HistoryMessage::user("What is foo?")]
    );
}

#[tokio::test]
async fn test_send_broadcasts_stream_events() {
    let pipeline = pipeline_with(Arc::new(ScriptedAdapter::from_chunks(["a ", "b"])));
    let mut events = pipeline.subscribe();

    let outcome = pipeline.send("hi").await.unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    let conversation_id = outcome.conversation_id().to_string();
    let message_id = outcome.message_id().to_string();
    assert_eq!(
        received,
        vec![
            PipelineEvent::StreamStarted {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
            },
            PipelineEvent::Chunk {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
                content: "a ".into(),
            },
            PipelineEvent::Chunk {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
                content: "b".into(),
            },
            PipelineEvent::StreamEnded {
                conversation_id,
                message_id,
                phase: PipelinePhase::Finalized,
            },
        ]
    );
}

#[tokio::test]
async fn test_send_creates_and_titles_conversation() {
    let pipeline = pipeline_with(Arc::new(ScriptedAdapter::from_chunks(["ok"])));
    assert!(pipeline.active_conversation().is_none());

    let outcome = pipeline
        .send("Explain the borrow checker\nin detail please")
        .await
        .unwrap();

    let active = pipeline.active_conversation().unwrap();
    assert_eq!(active.id, outcome.conversation_id());
    assert_eq!(active.title, "Explain the borrow checker");

    // Later messages do not retitle the conversation
    pipeline.send("Another question").await.unwrap();
    let active = pipeline.active_conversation().unwrap();
    assert_eq!(active.title, "Explain the borrow checker");
    assert_eq!(active.messages.len(), 4);
}

#[tokio::test]
async fn test_send_rejects_empty_text() {
    let adapter = Arc::new(ScriptedAdapter::from_chunks(["x"]));
    let pipeline = pipeline_with(adapter.clone());

    assert!(matches!(
        pipeline.send("   \n").await,
        Err(PipelineError::EmptyMessage)
    ));
    assert!(pipeline.conversations().is_empty());
    assert_eq!(adapter.call_count(), 0);
}

#[tokio::test]
async fn test_history_carries_previous_turns() {
    let adapter = Arc::new(ScriptedAdapter::from_chunks(["answer"]));
    let pipeline = pipeline_with(adapter.clone());

    pipeline.send("first").await.unwrap();
    pipeline.send("second").await.unwrap();

    assert_eq!(
        adapter.calls()[1].history,
        vec![
            HistoryMessage::user("first"),
            HistoryMessage::assistant("answer"),
            HistoryMessage::user("second"),
        ]
    );
}

#[tokio::test]
async fn test_context_prompt_is_prepended_to_outgoing_message() {
    let adapter = Arc::new(ScriptedAdapter::from_chunks(["ok"]));
    let pipeline = pipeline_with(adapter.clone());
    pipeline.set_workspace_context(WorkspaceContext {
        project: Some(ProjectRef::new("p1", "Foo").with_path("/work/foo")),
        files: vec!["a.ts".into(), "b.ts".into()],
        selection: Some("const x=1;".into()),
        terminal: vec!["ls".into(), "pwd".into(), "git status".into()],
    });

    let outcome = pipeline.send("explain").await.unwrap();

    let prompt = &adapter.calls()[0].history[0].content;
    assert!(prompt.starts_with("Context:\nProject: Foo\n"));
    assert!(prompt.contains("Active Files: a.ts, b.ts"));
    assert!(prompt.contains("```\nconst x=1;\n```"));
    assert!(prompt.contains("Recent Terminal Commands: ls, pwd, git status"));
    assert!(prompt.ends_with("\n\nexplain"));

    // The stored user message keeps the raw text and the context it was sent with
    let user = pipeline
        .store()
        .message(outcome.conversation_id(), outcome.user_message_id())
        .unwrap();
    assert_eq!(user.content, "explain");
    let context = user.context.unwrap();
    assert_eq!(context.files, Some(vec!["a.ts".to_string(), "b.ts".to_string()]));
    assert_eq!(context.project_path.as_deref(), Some("/work/foo"));

    let conversation = pipeline.active_conversation().unwrap();
    assert_eq!(conversation.context.project_name.as_deref(), Some("Foo"));
}

#[tokio::test]
async fn test_disabled_context_sends_plain_text() {
    let adapter = Arc::new(ScriptedAdapter::from_chunks(["ok"]));
    let pipeline = pipeline_with(adapter.clone());
    pipeline.set_workspace_context(WorkspaceContext {
        files: vec!["a.ts".into()],
        ..Default::default()
    });
    pipeline.set_context_enabled(false);

    let outcome = pipeline.send("explain").await.unwrap();

    assert_eq!(adapter.calls()[0].history, vec![HistoryMessage::user("explain")]);
    let user = pipeline
        .store()
        .message(outcome.conversation_id(), outcome.user_message_id())
        .unwrap();
    assert!(user.context.is_none());
}

#[tokio::test]
async fn test_model_override_reaches_adapter() {
    let adapter = Arc::new(ScriptedAdapter::from_chunks(["ok"]));
    let pipeline = pipeline_with(adapter.clone());
    pipeline.set_model("scripted", Some("big-model".into()));

    let outcome = pipeline.send("hi").await.unwrap();

    assert_eq!(adapter.calls()[0].options.model.as_deref(), Some("big-model"));
    let reply = pipeline
        .store()
        .message(outcome.conversation_id(), outcome.message_id())
        .unwrap();
    assert_eq!(reply.model.as_deref(), Some("big-model"));
}

#[tokio::test]
async fn test_stream_without_finish_reason_is_finalized() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        ScriptStep::Chunk(ChatChunk::content("no ")),
        ScriptStep::Chunk(ChatChunk::content("finish")),
    ]));
    let pipeline = pipeline_with(adapter);

    let outcome = pipeline.send("hi").await.unwrap();

    let SendOutcome::Finalized { metadata, .. } = &outcome else {
        panic!("expected finalized outcome, got {outcome:?}");
    };
    assert_eq!(metadata.token_count, Some(2));
    let reply = pipeline
        .store()
        .message(outcome.conversation_id(), outcome.message_id())
        .unwrap();
    assert!(!reply.is_streaming);
}

// ============================================================================
// Error handling
// ============================================================================

#[tokio::test]
async fn test_error_after_partial_keeps_frozen_partial_and_appends_error() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        ScriptStep::Chunk(ChatChunk::content("partial ")),
        ScriptStep::Error("connection reset".into()),
    ]));
    let pipeline = pipeline_with(adapter);

    let outcome = pipeline.send("hi").await.unwrap();

    let SendOutcome::Errored {
        conversation_id,
        message_id,
        partial_message_id,
        ..
    } = &outcome
    else {
        panic!("expected errored outcome, got {outcome:?}");
    };

    let messages = messages(&pipeline, conversation_id);
    assert_eq!(messages.len(), 3);

    let partial = &messages[1];
    assert_eq!(Some(&partial.id), partial_message_id.as_ref());
    assert_eq!(partial.content, "partial ");
    assert!(!partial.is_streaming);
    assert!(partial.metadata.is_none());

    let error = &messages[2];
    assert_eq!(&error.id, message_id);
    assert!(error.is_assistant());
    assert_eq!(error.content, STREAM_ERROR_MESSAGE);
    assert!(!error.is_streaming);

    assert!(!pipeline.is_loading());
    assert_eq!(pipeline.streams().live_count(), 0);
}

#[tokio::test]
async fn test_open_failure_turns_placeholder_into_error() {
    let pipeline = pipeline_with(Arc::new(ScriptedAdapter::failing_on_open("503")));

    let outcome = pipeline.send("hi").await.unwrap();

    let SendOutcome::Errored {
        conversation_id,
        partial_message_id,
        ..
    } = &outcome
    else {
        panic!("expected errored outcome, got {outcome:?}");
    };
    assert!(partial_message_id.is_none());

    let messages = messages(&pipeline, conversation_id);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, STREAM_ERROR_MESSAGE);
    assert!(!messages[1].is_streaming);
    assert!(!pipeline.is_loading());
}

#[tokio::test]
async fn test_unknown_provider_appends_error_without_session() {
    let adapter = Arc::new(ScriptedAdapter::from_chunks(["never"]));
    let pipeline = pipeline_with(adapter.clone());
    pipeline.set_model("missing", None);

    let outcome = pipeline.send("hi").await.unwrap();

    assert_eq!(outcome.phase(), PipelinePhase::Errored);
    let messages = messages(&pipeline, outcome.conversation_id());
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, ADAPTER_NOT_FOUND_MESSAGE);
    assert!(!messages[1].is_streaming);
    assert_eq!(adapter.call_count(), 0);
    assert_eq!(pipeline.streams().live_count(), 0);
    assert!(!pipeline.is_loading());
}

#[tokio::test(start_paused = true)]
async fn test_idle_stream_times_out_as_error() {
    let pipeline = pipeline_with(hanging_after("slow "));

    let outcome = pipeline.send("hi").await.unwrap();

    let SendOutcome::Errored {
        conversation_id,
        partial_message_id,
        ..
    } = &outcome
    else {
        panic!("expected errored outcome, got {outcome:?}");
    };
    let partial = pipeline
        .store()
        .message(conversation_id, partial_message_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(partial.content, "slow ");
    assert!(!partial.is_streaming);
    assert_eq!(pipeline.streams().live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_zero_idle_timeout_is_raised_to_minimum() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        ScriptStep::Chunk(ChatChunk::content("slow ")),
        ScriptStep::Delay(Duration::from_millis(500)),
        ScriptStep::Chunk(ChatChunk::content("reply")),
        ScriptStep::Chunk(ChatChunk::finish("stop")),
    ]));
    let pipeline = ChatPipeline::new(
        registry_with(vec![("scripted", adapter as Arc<dyn ChatAdapter>)]),
        Arc::new(ConversationStore::new()),
        PipelineConfig {
            provider: "scripted".into(),
            stream_idle_timeout: Duration::ZERO,
            ..Default::default()
        },
    );

    let outcome = pipeline.send("hi").await.unwrap();

    assert!(matches!(outcome, SendOutcome::Finalized { .. }));
    let reply = pipeline
        .store()
        .message(outcome.conversation_id(), outcome.message_id())
        .unwrap();
    assert_eq!(reply.content, "slow reply");
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_freezes_content_at_cancel_time() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        ScriptStep::Chunk(ChatChunk::content("before")),
        ScriptStep::Delay(Duration::from_millis(200)),
        ScriptStep::Chunk(ChatChunk::content(" after")),
        ScriptStep::Chunk(ChatChunk::finish("stop")),
    ]));
    let pipeline = Arc::new(pipeline_with(adapter));

    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.send("hi").await })
    };
    let (conversation_id, message_id) = wait_for_streaming(&pipeline, "before").await;
    assert!(pipeline.is_loading());

    assert!(pipeline.cancel(&message_id));
    let outcome = task.await.unwrap().unwrap();

    assert!(matches!(outcome, SendOutcome::Cancelled { .. }));
    tokio::time::sleep(Duration::from_millis(250)).await;
    let message = pipeline
        .store()
        .message(&conversation_id, &message_id)
        .unwrap();
    assert_eq!(message.content, "before");
    assert!(!message.is_streaming);
    assert!(message.metadata.is_none());
    assert!(!pipeline.is_loading());
}

#[tokio::test]
async fn test_cancel_all_stops_every_conversation() {
    let pipeline = Arc::new(pipeline_with(hanging_after("partial")));
    let first = pipeline.new_conversation().id;
    let second = pipeline.new_conversation().id;

    let tasks: Vec<_> = [first.clone(), second.clone()]
        .into_iter()
        .map(|id| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.send_to(&id, "hi").await })
        })
        .collect();

    for _ in 0..400 {
        if pipeline.streams().live_count() == 2
            && [&first, &second].iter().all(|id| {
                messages(&pipeline, id)
                    .iter()
                    .any(|m| m.content == "partial")
            })
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(pipeline.cancel_all(), 2);
    assert_eq!(pipeline.streams().live_count(), 0);

    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, SendOutcome::Cancelled { .. }));
    }
    for id in [&first, &second] {
        let reply = &messages(&pipeline, id)[1];
        assert_eq!(reply.content, "partial");
        assert!(!reply.is_streaming);
    }
    assert!(!pipeline.is_loading());
}

#[tokio::test]
async fn test_cancel_all_drops_chunks_arriving_afterwards() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        ScriptStep::Chunk(ChatChunk::content("early")),
        ScriptStep::Delay(Duration::from_millis(200)),
        ScriptStep::Chunk(ChatChunk::content(" late")),
        ScriptStep::Chunk(ChatChunk::finish("stop")),
    ]));
    let pipeline = Arc::new(pipeline_with(adapter));
    let first = pipeline.new_conversation().id;
    let second = pipeline.new_conversation().id;

    let tasks: Vec<_> = [first.clone(), second.clone()]
        .into_iter()
        .map(|id| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.send_to(&id, "hi").await })
        })
        .collect();

    for _ in 0..400 {
        if pipeline.streams().live_count() == 2
            && [&first, &second].iter().all(|id| {
                messages(&pipeline, id)
                    .iter()
                    .any(|m| m.is_streaming && m.content == "early")
            })
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(pipeline.cancel_all(), 2);

    // Outlast the scripted delay so the remaining chunks would have arrived
    tokio::time::sleep(Duration::from_millis(300)).await;
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, SendOutcome::Cancelled { .. }));
    }

    for id in [&first, &second] {
        let messages = messages(&pipeline, id);
        assert_eq!(messages.len(), 2);
        let reply = &messages[1];
        assert_eq!(reply.content, "early");
        assert!(!reply.is_streaming);
        assert!(reply.metadata.is_none());
    }
    assert_eq!(pipeline.streams().live_count(), 0);
    assert!(!pipeline.is_loading());
}

#[tokio::test]
async fn test_second_send_on_busy_conversation_is_rejected() {
    let pipeline = Arc::new(pipeline_with(hanging_after("working")));
    let conversation_id = pipeline.new_conversation().id;

    let task = {
        let pipeline = pipeline.clone();
        let id = conversation_id.clone();
        tokio::spawn(async move { pipeline.send_to(&id, "first").await })
    };
    wait_for_streaming(&pipeline, "working").await;
    assert_eq!(pipeline.phase(&conversation_id), PipelinePhase::Streaming);

    let result = pipeline.send_to(&conversation_id, "second").await;
    assert!(matches!(result, Err(PipelineError::ConversationBusy(_))));

    pipeline.cancel_all();
    task.await.unwrap().unwrap();
    assert_eq!(messages(&pipeline, &conversation_id).len(), 2);
}

#[tokio::test]
async fn test_delete_conversation_cancels_its_stream() {
    let pipeline = Arc::new(pipeline_with(hanging_after("doomed")));

    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.send("hi").await })
    };
    let (conversation_id, message_id) = wait_for_streaming(&pipeline, "doomed").await;

    pipeline.delete_conversation(&conversation_id).unwrap();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.message_id(), message_id);
    assert!(matches!(outcome, SendOutcome::Cancelled { .. }));
    assert!(pipeline.store().get(&conversation_id).is_none());
    assert!(pipeline.active_conversation().is_none());
}

#[tokio::test]
async fn test_shutdown_refuses_new_streams() {
    let pipeline = pipeline_with(Arc::new(ScriptedAdapter::from_chunks(["x"])));
    pipeline.shutdown();

    let result = pipeline.send("hi").await;
    assert!(matches!(
        result,
        Err(PipelineError::Stream(StreamError::Closed))
    ));
    assert!(!pipeline.is_loading());

    // The user message is kept; the placeholder is not
    let conversation = pipeline.active_conversation().unwrap();
    assert_eq!(conversation.messages.len(), 1);
    assert!(conversation.messages[0].is_user());
}

// ============================================================================
// Regeneration
// ============================================================================

#[tokio::test]
async fn test_regenerate_replaces_reply_without_duplicating_user_message() {
    let adapter = Arc::new(ScriptedAdapter::from_chunks(["hello"]));
    let pipeline = pipeline_with(adapter.clone());
    let first = pipeline.send("hi").await.unwrap();
    let conversation_id = first.conversation_id().to_string();

    let regenerated = pipeline
        .regenerate(first.message_id())
        .await
        .unwrap()
        .expect("regeneration should run");

    let messages = messages(&pipeline, &conversation_id);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, first.user_message_id());
    assert_eq!(messages[0].content, "hi");
    assert_eq!(messages[1].id, regenerated.message_id());
    assert_ne!(messages[1].id, first.message_id());
    assert_eq!(messages[1].content, "hello");
    assert_eq!(
        messages.iter().filter(|m| m.role == Role::User).count(),
        1
    );

    assert_eq!(adapter.call_count(), 2);
    assert_eq!(adapter.calls()[1].history, vec![HistoryMessage::user("hi")]);
}

#[tokio::test]
async fn test_regenerate_keeps_the_original_slot() {
    let pipeline = pipeline_with(Arc::new(ScriptedAdapter::from_chunks(["reply"])));
    let first = pipeline.send("one").await.unwrap();
    let second = pipeline.send("two").await.unwrap();

    let regenerated = pipeline
        .regenerate(first.message_id())
        .await
        .unwrap()
        .unwrap();

    let ids: Vec<String> = messages(&pipeline, first.conversation_id())
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(
        ids,
        vec![
            first.user_message_id().to_string(),
            regenerated.message_id().to_string(),
            second.user_message_id().to_string(),
            second.message_id().to_string(),
        ]
    );
}

#[tokio::test]
async fn test_regenerate_requires_user_predecessor() {
    let adapter = Arc::new(ScriptedAdapter::from_chunks(["reply"]));
    let pipeline = pipeline_with(adapter.clone());
    let outcome = pipeline.send("hi").await.unwrap();

    // A user message has no user predecessor to answer
    assert!(pipeline
        .regenerate(outcome.user_message_id())
        .await
        .unwrap()
        .is_none());
    assert!(pipeline.regenerate("unknown").await.unwrap().is_none());

    // An assistant message directly following another assistant message
    let orphan = Message::assistant("orphan");
    pipeline
        .store()
        .append_message(outcome.conversation_id(), orphan.clone())
        .unwrap();
    assert!(pipeline.regenerate(&orphan.id).await.unwrap().is_none());

    assert_eq!(adapter.call_count(), 1);
    assert_eq!(messages(&pipeline, outcome.conversation_id()).len(), 3);
}

#[tokio::test]
async fn test_regenerate_streaming_message_cancels_it_first() {
    let hanging = hanging_after("stale");
    let fresh = Arc::new(ScriptedAdapter::from_chunks(["fresh"]));
    let pipeline = Arc::new(ChatPipeline::new(
        registry_with(vec![
            ("hanging", hanging as Arc<dyn ChatAdapter>),
            ("fresh", fresh as Arc<dyn ChatAdapter>),
        ]),
        Arc::new(ConversationStore::new()),
        config("hanging"),
    ));

    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.send("hi").await })
    };
    let (conversation_id, message_id) = wait_for_streaming(&pipeline, "stale").await;

    pipeline.set_model("fresh", None);
    let regenerated = pipeline
        .regenerate(&message_id)
        .await
        .unwrap()
        .expect("regeneration should run");

    let original = task.await.unwrap().unwrap();
    assert!(matches!(original, SendOutcome::Cancelled { .. }));
    assert!(matches!(regenerated, SendOutcome::Finalized { .. }));

    let messages = messages(&pipeline, &conversation_id);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "fresh");
    assert_eq!(messages[1].provider.as_deref(), Some("fresh"));
}

#[tokio::test]
async fn test_regenerate_partial_also_removes_its_error_message() {
    let flaky = Arc::new(ScriptedAdapter::new(vec![
        ScriptStep::Chunk(ChatChunk::content("partial ")),
        ScriptStep::Error("connection reset".into()),
    ]));
    let fresh = Arc::new(ScriptedAdapter::from_chunks(["fresh"]));
    let pipeline = ChatPipeline::new(
        registry_with(vec![
            ("flaky", flaky as Arc<dyn ChatAdapter>),
            ("fresh", fresh as Arc<dyn ChatAdapter>),
        ]),
        Arc::new(ConversationStore::new()),
        config("flaky"),
    );

    let failed = pipeline.send("hi").await.unwrap();
    let SendOutcome::Errored {
        conversation_id,
        message_id: error_id,
        partial_message_id: Some(partial_id),
        ..
    } = &failed
    else {
        panic!("expected errored outcome with a partial, got {failed:?}");
    };

    // The error message answers the partial, not a user message
    assert!(pipeline.regenerate(error_id).await.unwrap().is_none());
    assert_eq!(messages(&pipeline, conversation_id).len(), 3);

    pipeline.set_model("fresh", None);
    let regenerated = pipeline
        .regenerate(partial_id)
        .await
        .unwrap()
        .expect("regeneration should run");
    assert!(matches!(regenerated, SendOutcome::Finalized { .. }));

    let messages = messages(&pipeline, conversation_id);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, failed.user_message_id());
    assert_eq!(messages[1].id, regenerated.message_id());
    assert_eq!(messages[1].content, "fresh");
    assert!(messages.iter().all(|m| m.content != STREAM_ERROR_MESSAGE));
}

#[tokio::test]
async fn test_regenerate_error_message_without_partial() {
    let broken = Arc::new(ScriptedAdapter::failing_on_open("503"));
    let fresh = Arc::new(ScriptedAdapter::from_chunks(["recovered"]));
    let pipeline = ChatPipeline::new(
        registry_with(vec![
            ("broken", broken as Arc<dyn ChatAdapter>),
            ("fresh", fresh as Arc<dyn ChatAdapter>),
        ]),
        Arc::new(ConversationStore::new()),
        config("broken"),
    );
    let failed = pipeline.send("hi").await.unwrap();
    let later = Message::user("unrelated follow-up");
    pipeline
        .store()
        .append_message(failed.conversation_id(), later.clone())
        .unwrap();

    pipeline.set_model("fresh", None);
    let regenerated = pipeline
        .regenerate(failed.message_id())
        .await
        .unwrap()
        .expect("regeneration should run");

    let messages = messages(&pipeline, failed.conversation_id());
    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![failed.user_message_id(), regenerated.message_id(), later.id.as_str()]
    );
    assert_eq!(messages[1].content, "recovered");
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_conversations_survive_reload() {
    let persistence = Arc::new(MemoryPersistence::new());
    let adapter: Arc<dyn ChatAdapter> = Arc::new(ScriptedAdapter::from_chunks(["saved"]));
    let registry = registry_with(vec![("scripted", adapter)]);

    let pipeline =
        ChatPipeline::with_persistence(registry.clone(), persistence.clone(), config("scripted"));
    let outcome = pipeline.send("remember me").await.unwrap();
    drop(pipeline);

    let reloaded = ChatPipeline::with_persistence(registry, persistence, config("scripted"));
    let active = reloaded.active_conversation().expect("active conversation restored");
    assert_eq!(active.id, outcome.conversation_id());
    assert_eq!(active.messages.len(), 2);
    assert_eq!(active.messages[1].content, "saved");

    let exported = reloaded.export_active().unwrap();
    assert_eq!(exported.title, "remember me");
    assert_eq!(exported.messages.len(), 2);
}
