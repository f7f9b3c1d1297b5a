//! Pipeline integration tests

use std::sync::Arc;
use std::time::Duration;

use herald_gateway::agent::CompletionError;
use herald_gateway::channels::{DispatchError, Dispatcher, IdempotentDispatcher};
use herald_gateway::context::{ContextConfig, Role};
use herald_gateway::db::{AttemptOutcome, DeliveryAttemptRepo, DeliveryStage, MessageRepo};
use herald_gateway::ingest::InboundEvent;
use herald_gateway::pipeline::{FallbackReplies, Orchestrator, Outcome, PipelineState, RetryPolicy};
use herald_gateway::voice::TranscriptionError;
use herald_gateway::{ErrorKind, db};
use tokio::sync::watch;

mod common;
use common::{Adapters, RecordingDispatcher, ScriptedCompletion, ScriptedTranscriber, audio_event, setup_test_db};

fn status_of(db: &herald_gateway::DbPool, external_id: &str) -> PipelineState {
    MessageRepo::new(db.clone())
        .find_by_external_id(external_id)
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn test_text_message_is_delivered_once() {
    let db = setup_test_db();
    let adapters = Adapters::default();
    let orchestrator = adapters.orchestrator(db.clone());

    let outcome = orchestrator
        .handle(&InboundEvent::text("m1", "+15550001", "what's the weather?"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Delivered);

    let messages = MessageRepo::new(db.clone());
    let inbound = messages.find_by_external_id("m1").unwrap().unwrap();
    assert_eq!(inbound.status, PipelineState::Delivered);
    // Text skips transcription; the transcript is the body
    assert_eq!(inbound.transcript.as_deref(), Some("what's the weather?"));
    assert!(adapters.transcriber.calls().is_empty());

    let reply = messages.find_by_external_id("m1:reply").unwrap().unwrap();
    assert_eq!(reply.status, PipelineState::Delivered);
    assert_eq!(reply.raw_payload, "re: what's the weather?");
    assert_eq!(reply.reply_to.as_deref(), Some(inbound.id.as_str()));

    let attempts = DeliveryAttemptRepo::new(db.clone());
    let delivery = attempts.list_stage(&reply.id, DeliveryStage::Delivery).unwrap();
    assert_eq!(delivery.len(), 1);
    assert_eq!(delivery[0].outcome, AttemptOutcome::Success);
    assert_eq!(delivery[0].provider_ref.as_deref(), Some("wamid.out.1"));

    let sent = adapters.dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "+15550001");
    assert_eq!(sent[0].key, "m1:reply");
}

#[tokio::test]
async fn test_duplicate_event_is_ignored() {
    let db = setup_test_db();
    let adapters = Adapters::default();
    let orchestrator = adapters.orchestrator(db.clone());
    let event = InboundEvent::text("m1", "+15550001", "hi");

    assert_eq!(orchestrator.handle(&event).await.unwrap(), Outcome::Delivered);
    assert_eq!(orchestrator.handle(&event).await.unwrap(), Outcome::Ignored);

    let messages = MessageRepo::new(db.clone());
    assert_eq!(messages.count_by_external_id("m1").unwrap(), 1);
    assert_eq!(adapters.completion.call_count(), 1);
    assert_eq!(adapters.dispatcher.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transcription_retries_with_exponential_backoff() {
    let db = setup_test_db();
    let adapters = Adapters::new(
        ScriptedTranscriber::new(vec![
            Err(TranscriptionError::Unavailable("503".into())),
            Err(TranscriptionError::Unavailable("timeout".into())),
            Ok("call me back".into()),
        ]),
        ScriptedCompletion::default(),
        RecordingDispatcher::default(),
    );
    let orchestrator = adapters.orchestrator(db.clone());

    let outcome = orchestrator.handle(&audio_event("a1", "+15550001")).await.unwrap();
    assert_eq!(outcome, Outcome::Delivered);

    let calls = adapters.transcriber.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[1] - calls[0] >= Duration::from_millis(500));
    assert!(calls[2] - calls[1] >= Duration::from_millis(1000));

    let inbound = MessageRepo::new(db.clone()).find_by_external_id("a1").unwrap().unwrap();
    assert_eq!(inbound.transcript.as_deref(), Some("call me back"));

    let attempts = DeliveryAttemptRepo::new(db)
        .list_stage(&inbound.id, DeliveryStage::Transcription)
        .unwrap();
    let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
    let delays: Vec<Duration> = attempts.iter().map(|a| a.delay).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(
        delays,
        vec![Duration::ZERO, Duration::from_millis(500), Duration::from_millis(1000)]
    );
    assert_eq!(attempts[0].error_kind.as_deref(), Some(ErrorKind::TransientUpstream.as_str()));
    assert_eq!(attempts[2].outcome, AttemptOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_transcription_fails_with_voice_note_apology() {
    let db = setup_test_db();
    let adapters = Adapters::new(
        ScriptedTranscriber::new(vec![
            Err(TranscriptionError::Unavailable("503".into())),
            Err(TranscriptionError::Unavailable("503".into())),
            Err(TranscriptionError::Unavailable("503".into())),
        ]),
        ScriptedCompletion::default(),
        RecordingDispatcher::default(),
    );
    let orchestrator = adapters.orchestrator(db.clone());

    let outcome = orchestrator.handle(&audio_event("a1", "+15550001")).await.unwrap();
    assert_eq!(outcome, Outcome::Failed);
    assert_eq!(adapters.transcriber.calls().len(), 3);
    assert_eq!(adapters.completion.call_count(), 0);

    let sent = adapters.dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].key, "a1:fallback");
    assert_eq!(sent[0].text, FallbackReplies::default().transcription);

    assert_eq!(status_of(&db, "a1"), PipelineState::Failed);
    assert_eq!(status_of(&db, "a1:fallback"), PipelineState::Delivered);
}

#[tokio::test]
async fn test_unsupported_audio_is_not_retried() {
    let db = setup_test_db();
    let adapters = Adapters::new(
        ScriptedTranscriber::new(vec![Err(TranscriptionError::UnsupportedAudioFormat("audio/amr".into()))]),
        ScriptedCompletion::default(),
        RecordingDispatcher::default(),
    );
    let orchestrator = adapters.orchestrator(db.clone());

    let outcome = orchestrator.handle(&audio_event("a1", "+15550001")).await.unwrap();
    assert_eq!(outcome, Outcome::Failed);
    assert_eq!(adapters.transcriber.calls().len(), 1);
}

#[tokio::test]
async fn test_content_policy_rejection_fails_without_retry() {
    let db = setup_test_db();
    let adapters = Adapters::new(
        ScriptedTranscriber::default(),
        ScriptedCompletion::new(vec![Err(CompletionError::ContentPolicyRejected("flagged".into()))]),
        RecordingDispatcher::default(),
    );
    let orchestrator = adapters.orchestrator(db.clone());

    let outcome = orchestrator
        .handle(&InboundEvent::text("m1", "+15550001", "something bad"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Failed);
    assert_eq!(adapters.completion.call_count(), 1);

    let messages = MessageRepo::new(db.clone());
    let inbound = messages.find_by_external_id("m1").unwrap().unwrap();
    assert_eq!(inbound.status, PipelineState::Failed);
    assert!(messages.find_by_external_id("m1:reply").unwrap().is_none());

    let attempts = DeliveryAttemptRepo::new(db.clone())
        .list_stage(&inbound.id, DeliveryStage::Completion)
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].error_kind.as_deref(), Some(ErrorKind::NonRetryable.as_str()));

    // Apology goes out, the inbound message stays FAILED
    assert_eq!(adapters.dispatcher.sent_keys(), vec!["m1:fallback".to_string()]);
    assert_eq!(status_of(&db, "m1"), PipelineState::Failed);
}

#[tokio::test]
async fn test_disabled_fallback_sends_nothing() {
    let db = setup_test_db();
    let adapters = Adapters::new(
        ScriptedTranscriber::default(),
        ScriptedCompletion::new(vec![Err(CompletionError::Rejected("401".into()))]),
        RecordingDispatcher::default(),
    );
    let orchestrator = adapters.orchestrator(db.clone()).with_fallback(FallbackReplies::disabled());

    let outcome = orchestrator
        .handle(&InboundEvent::text("m1", "+15550001", "hi"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Failed);
    assert!(adapters.dispatcher.sent().is_empty());
    assert!(MessageRepo::new(db).find_by_external_id("m1:fallback").unwrap().is_none());
}

#[tokio::test]
async fn test_unreachable_recipient_fails_reply_and_fallback_once() {
    let db = setup_test_db();
    let adapters = Adapters::new(
        ScriptedTranscriber::default(),
        ScriptedCompletion::default(),
        RecordingDispatcher::failing(|| DispatchError::RecipientUnreachable("131047".into())),
    );
    let orchestrator = adapters.orchestrator(db.clone());

    let outcome = orchestrator
        .handle(&InboundEvent::text("m1", "+15550001", "hi"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Failed);

    assert_eq!(status_of(&db, "m1"), PipelineState::Failed);
    assert_eq!(status_of(&db, "m1:reply"), PipelineState::Failed);
    assert_eq!(status_of(&db, "m1:fallback"), PipelineState::Failed);

    let messages = MessageRepo::new(db.clone());
    let attempts = DeliveryAttemptRepo::new(db);
    let reply = messages.find_by_external_id("m1:reply").unwrap().unwrap();
    assert_eq!(attempts.list_stage(&reply.id, DeliveryStage::Delivery).unwrap().len(), 1);
    let fallback = messages.find_by_external_id("m1:fallback").unwrap().unwrap();
    assert_eq!(attempts.list_stage(&fallback.id, DeliveryStage::Fallback).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_delivery_honours_retry_after() {
    let db = setup_test_db();
    let adapters = Adapters::new(
        ScriptedTranscriber::default(),
        ScriptedCompletion::default(),
        RecordingDispatcher::new(vec![Err(DispatchError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        })]),
    );
    let orchestrator = adapters.orchestrator(db.clone());

    let outcome = orchestrator
        .handle(&InboundEvent::text("m1", "+15550001", "hi"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Delivered);

    let reply = MessageRepo::new(db.clone()).find_by_external_id("m1:reply").unwrap().unwrap();
    let attempts = DeliveryAttemptRepo::new(db)
        .list_stage(&reply.id, DeliveryStage::Delivery)
        .unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].delay, Duration::from_secs(2));
    assert_eq!(adapters.dispatcher.sent_keys(), vec!["m1:reply".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_delivery_fails_after_backoff() {
    let db = setup_test_db();
    let adapters = Adapters::new(
        ScriptedTranscriber::default(),
        ScriptedCompletion::default(),
        RecordingDispatcher::failing(|| DispatchError::Unavailable("connection refused".into())),
    );
    let orchestrator = adapters.orchestrator(db.clone());

    let outcome = orchestrator
        .handle(&InboundEvent::text("m1", "+15550001", "hi"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Failed);

    assert_eq!(status_of(&db, "m1"), PipelineState::Failed);
    assert_eq!(status_of(&db, "m1:reply"), PipelineState::Failed);
    // The apology goes through the same broken dispatcher
    assert_eq!(status_of(&db, "m1:fallback"), PipelineState::Failed);
    assert!(adapters.dispatcher.sent().is_empty());

    let reply = MessageRepo::new(db.clone()).find_by_external_id("m1:reply").unwrap().unwrap();
    let attempts = DeliveryAttemptRepo::new(db)
        .list_stage(&reply.id, DeliveryStage::Delivery)
        .unwrap();
    let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
    let delays: Vec<Duration> = attempts.iter().map(|a| a.delay).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(
        delays,
        vec![Duration::ZERO, Duration::from_millis(500), Duration::from_millis(1000)]
    );
    assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::Failure));
    assert!(
        attempts
            .iter()
            .all(|a| a.error_kind.as_deref() == Some(ErrorKind::TransientUpstream.as_str()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_completion_recovers_after_transient_failure() {
    let db = setup_test_db();
    let adapters = Adapters::new(
        ScriptedTranscriber::default(),
        ScriptedCompletion::new(vec![Err(CompletionError::Unavailable("429".into())), Ok("sunny".into())]),
        RecordingDispatcher::default(),
    );
    let orchestrator = adapters.orchestrator(db.clone());

    let outcome = orchestrator
        .handle(&InboundEvent::text("m1", "+15550001", "weather?"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Delivered);
    assert_eq!(adapters.completion.call_count(), 2);

    let inbound = MessageRepo::new(db.clone()).find_by_external_id("m1").unwrap().unwrap();
    let attempts = DeliveryAttemptRepo::new(db)
        .list_stage(&inbound.id, DeliveryStage::Completion)
        .unwrap();
    let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Failure);
    assert_eq!(attempts[1].outcome, AttemptOutcome::Success);
    assert_eq!(attempts[1].delay, Duration::from_millis(500));

    let sent = adapters.dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "sunny");
}

#[tokio::test]
async fn test_lost_acknowledgement_is_not_resent() {
    let db = setup_test_db();
    let adapters = Adapters::default();
    let dispatcher = Arc::new(IdempotentDispatcher::new(RecordingDispatcher::with_lost_acks(1)));
    let orchestrator = Orchestrator::new(
        db.clone(),
        adapters.transcriber.clone(),
        adapters.completion.clone(),
        dispatcher.clone(),
    )
    .with_retry_policy(RetryPolicy::default().without_jitter());

    let outcome = orchestrator
        .handle(&InboundEvent::text("m1", "+15550001", "hi"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Failed);

    // The platform got the reply once; no retry and no apology followed
    assert_eq!(dispatcher.inner().sent_keys(), vec!["m1:reply".to_string()]);
    assert_eq!(status_of(&db, "m1"), PipelineState::Failed);
    assert_eq!(status_of(&db, "m1:reply"), PipelineState::Failed);
    assert!(MessageRepo::new(db.clone()).find_by_external_id("m1:fallback").unwrap().is_none());

    let reply = MessageRepo::new(db.clone()).find_by_external_id("m1:reply").unwrap().unwrap();
    let attempts = DeliveryAttemptRepo::new(db)
        .list_stage(&reply.id, DeliveryStage::Delivery)
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].error_kind.as_deref(), Some(ErrorKind::NonRetryable.as_str()));

    // A later send under the same key is held back
    let err = dispatcher.send("+15550001", "hi", "m1:reply").await.unwrap_err();
    assert!(matches!(err, DispatchError::Ambiguous(_)));
    assert_eq!(dispatcher.inner().sent().len(), 1);
}

#[tokio::test]
async fn test_undecodable_voice_note_fails_at_transcription() {
    let db = setup_test_db();
    let adapters = Adapters::default();
    let orchestrator = adapters.orchestrator(db.clone());

    let recorded = orchestrator.ingest(&audio_event("a1", "+15550001")).unwrap();
    db.get()
        .unwrap()
        .execute("UPDATE messages SET raw_payload = '{' WHERE external_id = 'a1'", [])
        .unwrap();

    orchestrator
        .drive_conversation(&recorded.message.conversation_id)
        .await
        .unwrap();

    assert_eq!(status_of(&db, "a1"), PipelineState::Failed);
    assert!(adapters.transcriber.calls().is_empty());
    let sent = adapters.dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].key, "a1:fallback");
    assert_eq!(sent[0].text, FallbackReplies::default().transcription);
}

#[tokio::test]
async fn test_context_includes_history_in_order() {
    let db = setup_test_db();
    let adapters = Adapters::default();
    let orchestrator = adapters.orchestrator(db.clone());

    for (id, body) in [("m1", "one"), ("m2", "two"), ("m3", "three")] {
        orchestrator
            .handle(&InboundEvent::text(id, "+15550001", body))
            .await
            .unwrap();
    }

    let contexts = adapters.completion.contexts();
    let last: Vec<(Role, String)> = contexts[2]
        .turns
        .iter()
        .map(|t| (t.role, t.content.clone()))
        .collect();
    assert_eq!(
        last,
        vec![
            (Role::User, "one".to_string()),
            (Role::Assistant, "re: one".to_string()),
            (Role::User, "two".to_string()),
            (Role::Assistant, "re: two".to_string()),
            (Role::User, "three".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_context_is_truncated_to_window() {
    let db = setup_test_db();
    let adapters = Adapters::default();
    let orchestrator = adapters.orchestrator(db.clone()).with_context_config(ContextConfig {
        max_turns: 3,
        max_chars: 12_000,
        system_prompt: Some("be brief".to_string()),
    });

    for (id, body) in [("m1", "one"), ("m2", "two"), ("m3", "three")] {
        orchestrator
            .handle(&InboundEvent::text(id, "+15550001", body))
            .await
            .unwrap();
    }

    let contexts = adapters.completion.contexts();
    let last = &contexts[2];
    assert_eq!(last.turns.len(), 3);
    assert_eq!(last.system_prompt.as_deref(), Some("be brief"));
    assert_eq!(last.turns[0].content, "two");
    assert_eq!(last.latest_user_turn().unwrap().content, "three");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_conversation_is_serialized_in_arrival_order() {
    let db = setup_test_db();
    let adapters = Adapters::default();
    let orchestrator = Arc::new(adapters.orchestrator(db.clone()));

    let ids: Vec<String> = (1..=5).map(|n| format!("m{n}")).collect();
    for id in &ids {
        orchestrator
            .ingest(&InboundEvent::text(id.as_str(), "+15550001", format!("body {id}")))
            .unwrap();
    }
    let conversation_id = MessageRepo::new(db.clone())
        .find_by_external_id("m1")
        .unwrap()
        .unwrap()
        .conversation_id;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let orchestrator = Arc::clone(&orchestrator);
        let conversation_id = conversation_id.clone();
        tasks.push(tokio::spawn(async move {
            orchestrator.drive_conversation(&conversation_id).await.unwrap()
        }));
    }
    let mut finished = 0;
    for task in tasks {
        finished += task.await.unwrap();
    }
    assert_eq!(finished, 5);

    let expected: Vec<String> = ids.iter().map(|id| format!("{id}:reply")).collect();
    assert_eq!(adapters.dispatcher.sent_keys(), expected);
    for id in &ids {
        assert_eq!(status_of(&db, id), PipelineState::Delivered);
    }

    // Each completion saw every earlier exchange
    for (n, context) in adapters.completion.contexts().iter().enumerate() {
        assert_eq!(context.turns.len(), 2 * n + 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conversations_run_independently() {
    let db = setup_test_db();
    let adapters = Adapters::default();
    let orchestrator = Arc::new(adapters.orchestrator(db.clone()));

    let mut tasks = Vec::new();
    for n in 0..6 {
        let orchestrator = Arc::clone(&orchestrator);
        tasks.push(tokio::spawn(async move {
            orchestrator
                .handle(&InboundEvent::text(format!("m{n}"), format!("+1555000{n}"), "hi"))
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), Outcome::Delivered);
    }
    assert_eq!(adapters.dispatcher.sent().len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lock_table_empties_after_many_conversations() {
    let db = setup_test_db();
    let adapters = Adapters::default();
    let orchestrator = Arc::new(adapters.orchestrator(db.clone()));

    let mut tasks = Vec::new();
    for n in 0..200 {
        let orchestrator = Arc::clone(&orchestrator);
        tasks.push(tokio::spawn(async move {
            orchestrator
                .handle(&InboundEvent::text(format!("m{n}"), format!("+1666{n:07}"), "hi"))
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), Outcome::Delivered);
    }

    assert_eq!(adapters.dispatcher.sent().len(), 200);
    assert!(orchestrator.locks().is_empty());
}

#[tokio::test]
async fn test_resume_redelivers_existing_reply_without_regenerating() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("herald.db");

    // First run: the reply was generated, then the process died
    {
        let db = db::init(&path).unwrap();
        let messages = MessageRepo::new(db);
        let inbound = messages
            .record_inbound(&InboundEvent::text("m1", "+15550001", "hello"))
            .unwrap()
            .message;
        messages
            .attach_transcript(&inbound.id, "hello", PipelineState::Completing)
            .unwrap();
        messages.record_reply(&inbound, "m1:reply", "stored reply").unwrap();
    }

    let db = db::init(&path).unwrap();
    let adapters = Adapters::default();
    let orchestrator = adapters.orchestrator(db.clone());

    assert_eq!(orchestrator.resume_all().await.unwrap(), 1);
    assert_eq!(adapters.completion.call_count(), 0);

    let sent = adapters.dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].key, "m1:reply");
    assert_eq!(sent[0].text, "stored reply");
    assert_eq!(status_of(&db, "m1"), PipelineState::Delivered);

    // Nothing left to do
    assert_eq!(orchestrator.resume_all().await.unwrap(), 0);
}

#[tokio::test]
async fn test_resume_after_recorded_send_does_not_send_again() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("herald.db");

    {
        let db = db::init(&path).unwrap();
        let messages = MessageRepo::new(db.clone());
        let inbound = messages
            .record_inbound(&InboundEvent::text("m1", "+15550001", "hello"))
            .unwrap()
            .message;
        messages
            .attach_transcript(&inbound.id, "hello", PipelineState::Completing)
            .unwrap();
        let reply = messages.record_reply(&inbound, "m1:reply", "stored reply").unwrap();
        DeliveryAttemptRepo::new(db)
            .record(
                &herald_gateway::db::NewAttempt::success(&reply.id, DeliveryStage::Delivery, Duration::ZERO)
                    .with_provider_ref("wamid.earlier"),
            )
            .unwrap();
    }

    let db = db::init(&path).unwrap();
    let adapters = Adapters::default();
    let orchestrator = adapters.orchestrator(db.clone());

    assert_eq!(orchestrator.resume_all().await.unwrap(), 1);
    assert!(adapters.dispatcher.sent().is_empty());
    assert_eq!(status_of(&db, "m1"), PipelineState::Delivered);
    assert_eq!(status_of(&db, "m1:reply"), PipelineState::Delivered);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_at_checkpoint_and_resumes_later() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("herald.db");
    let db = db::init(&path).unwrap();

    let adapters = Adapters::new(
        ScriptedTranscriber::new(vec![Err(TranscriptionError::Unavailable("503".into()))]),
        ScriptedCompletion::default(),
        RecordingDispatcher::default(),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let orchestrator = adapters.orchestrator(db.clone()).with_shutdown(stop_rx);

    // Shutdown arrives while the first retry is backing off
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        stop_tx
    });

    let outcome = orchestrator.handle(&audio_event("a1", "+15550001")).await.unwrap();
    assert_eq!(outcome, Outcome::Interrupted(PipelineState::Transcribing));
    assert_eq!(status_of(&db, "a1"), PipelineState::Transcribing);
    assert_eq!(adapters.transcriber.calls().len(), 1);
    drop(stopper.await.unwrap());
    drop(orchestrator);

    // Next run picks up at TRANSCRIBING
    let adapters = Adapters::default();
    let orchestrator = adapters.orchestrator(db::init(&path).unwrap());
    assert_eq!(orchestrator.resume_all().await.unwrap(), 1);
    assert_eq!(adapters.transcriber.calls().len(), 1);
    assert_eq!(status_of(&db, "a1"), PipelineState::Delivered);

    let inbound = MessageRepo::new(db.clone()).find_by_external_id("a1").unwrap().unwrap();
    let numbers: Vec<u32> = DeliveryAttemptRepo::new(db)
        .list_stage(&inbound.id, DeliveryStage::Transcription)
        .unwrap()
        .iter()
        .map(|a| a.attempt_number)
        .collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[tokio::test]
async fn test_archived_conversation_starts_fresh_context() {
    let db = setup_test_db();
    let adapters = Adapters::default();
    let orchestrator = adapters.orchestrator(db.clone());

    orchestrator
        .handle(&InboundEvent::text("m1", "+15550001", "first"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    herald_gateway::db::ConversationRepo::new(db.clone())
        .archive_idle(chrono::Duration::zero())
        .unwrap();
    orchestrator
        .handle(&InboundEvent::text("m2", "+15550001", "second"))
        .await
        .unwrap();

    let contexts = adapters.completion.contexts();
    assert_eq!(contexts[1].turns.len(), 1);
    assert_eq!(contexts[1].turns[0].content, "second");
}
