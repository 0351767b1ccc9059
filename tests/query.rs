mod common;

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use common::{harness, ScriptedProvider};
use workspace_rag::catalog::Catalog;
use workspace_rag::error::RagError;
use workspace_rag::models::{Namespace, PromptTemplate, QueryEvent, QueryRequest};
use workspace_rag::rag::retrieval::Retriever;

fn template(id: Uuid) -> PromptTemplate {
    PromptTemplate {
        id,
        workspace_id: "ws1".to_string(),
        name: "support".to_string(),
        main_instructions: Some("Answer briefly.".to_string()),
        business_description: Some("We sell bicycles.".to_string()),
        ..Default::default()
    }
}

fn prompt_request(prompt: &str) -> QueryRequest {
    QueryRequest {
        prompt: Some(prompt.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn answer_uses_context_from_both_documents() {
    let h = harness(1000, 200);
    for (name, text) in [
        ("a.txt", "Bicycle tires should be inflated weekly."),
        ("b.txt", "Chain lubrication keeps the bicycle quiet."),
    ] {
        let key = h.put("ws1", name, text).await;
        assert_ok!(h.pipeline.ingest("ws1", &key).await);
    }

    let provider = Arc::new(ScriptedProvider::new(&["Pump", " the tires."]));
    let service = h.query_service(provider.clone());
    let request = QueryRequest {
        top_k: Some(5),
        ..prompt_request("How do I care for my bicycle?")
    };

    let answer = assert_ok!(service.answer("ws1", request).await);
    assert_eq!(answer.result, "Pump the tires.");

    let prompt = provider.prompt();
    assert!(prompt.contains("# Context"));
    assert!(prompt.contains("Bicycle tires should be inflated weekly."));
    assert!(prompt.contains("Chain lubrication keeps the bicycle quiet."));
    assert!(prompt.ends_with("# User Input\nHow do I care for my bicycle?"));

    let mut sources: Vec<_> = answer.metadata.sources.iter().map(|s| s.source.as_str()).collect();
    sources.sort();
    assert_eq!(sources, vec!["ws1/a.txt", "ws1/b.txt"]);
    assert_eq!(answer.metadata.model, "gpt-3.5-turbo");
}

#[tokio::test]
async fn stream_emits_start_chunks_end_with_one_id() {
    let h = harness(1000, 200);
    let service = h.query_service(Arc::new(ScriptedProvider::new(&["Hel", "lo", "!"])));
    let request = QueryRequest {
        id: Some("req-1".to_string()),
        ..prompt_request("hello?")
    };

    let events: Vec<QueryEvent> = service.stream("ws1", request).await.unwrap().collect().await;
    let names: Vec<_> = events.iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["start", "chunk", "chunk", "chunk", "end"]);
    assert!(events.iter().all(|e| e.id() == "req-1"));

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            QueryEvent::Chunk { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello!");
}

#[tokio::test]
async fn provider_failure_mid_stream_ends_with_error_event() {
    let h = harness(1000, 200);
    let provider = ScriptedProvider::failing_after(&["Hel", "lo"], 1);
    let service = h.query_service(Arc::new(provider));

    let events: Vec<QueryEvent> = service
        .stream("ws1", prompt_request("hello?"))
        .await
        .unwrap()
        .collect()
        .await;

    let names: Vec<_> = events.iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["start", "chunk", "error"]);
    assert!(events.last().unwrap().is_terminal());
    match &events[1] {
        QueryEvent::Chunk { content, .. } => assert_eq!(content, "Hel"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn unknown_template_fails_before_streaming() {
    let h = harness(1000, 200);
    let service = h.query_service(Arc::new(ScriptedProvider::new(&["x"])));
    let request = QueryRequest {
        template_id: Some(Uuid::new_v4()),
        user_input: Some("hi".to_string()),
        ..Default::default()
    };

    let err = match service.stream("ws1", request).await {
        Ok(_) => panic!("assertion failed: Err(_) expected, got Ok"),
        Err(e) => e,
    };
    assert!(matches!(err, RagError::NotFound(_)));
}

#[tokio::test]
async fn template_or_prompt_is_required() {
    let h = harness(1000, 200);
    let service = h.query_service(Arc::new(ScriptedProvider::new(&["x"])));
    let request = QueryRequest {
        user_input: Some("hi".to_string()),
        ..Default::default()
    };

    let err = assert_err!(service.answer("ws1", request).await);
    assert!(matches!(err, RagError::InvalidInput(_)));

    let zero_k = QueryRequest {
        top_k: Some(0),
        ..prompt_request("hi")
    };
    let err = assert_err!(service.answer("ws1", zero_k).await);
    assert!(matches!(err, RagError::InvalidInput(_)));
}

#[tokio::test]
async fn template_sections_and_usage_are_recorded() {
    let h = harness(1000, 200);
    let id = Uuid::new_v4();
    h.catalog.insert_template(template(id)).unwrap();

    let provider = Arc::new(ScriptedProvider::new(&["ok"]));
    let service = h.query_service(provider.clone());
    let mut extra = serde_json::Map::new();
    extra.insert("customer_tier".to_string(), json!("gold"));
    let request = QueryRequest {
        template_id: Some(id),
        user_input: Some("Which bike should I buy?".to_string()),
        additional_context: extra,
        ..Default::default()
    };

    assert_ok!(service.answer("ws1", request).await);

    let prompt = provider.prompt();
    assert!(prompt.starts_with("# Main Instructions\nAnswer briefly."));
    assert!(prompt.contains("# Business Description\nWe sell bicycles."));
    assert!(prompt.contains("# Additional Context\ncustomer_tier: gold"));
    // nothing indexed yet, so no context section
    assert!(!prompt.contains("# Context\n"));

    let stored = h.catalog.get_template(id).await.unwrap();
    assert!(stored.last_used_at.is_some());
}

#[tokio::test]
async fn raw_template_prompt_is_sent_verbatim() {
    let h = harness(1000, 200);
    let key = h.put("ws1", "doc.txt", "irrelevant indexed text").await;
    assert_ok!(h.pipeline.ingest("ws1", &key).await);

    let id = Uuid::new_v4();
    h.catalog
        .insert_template(PromptTemplate {
            prompt: Some("Say exactly: pong".to_string()),
            ..template(id)
        })
        .unwrap();

    let provider = Arc::new(ScriptedProvider::new(&["pong"]));
    let service = h.query_service(provider.clone());
    let request = QueryRequest {
        template_id: Some(id),
        user_input: Some("ping".to_string()),
        ..Default::default()
    };

    let events: Vec<QueryEvent> = service.stream("ws1", request).await.unwrap().collect().await;
    assert_eq!(events.last().map(|e| e.name()), Some("end"));
    assert_eq!(provider.prompt(), "Say exactly: pong");
    assert!(h.catalog.get_template(id).await.unwrap().last_used_at.is_some());
}

#[tokio::test]
async fn retriever_orders_by_score_and_applies_floor() {
    let h = harness(1000, 200);
    for (name, text) in [
        ("a.txt", "Bicycle tires should be inflated weekly."),
        ("b.txt", "Chain lubrication keeps the bicycle quiet."),
    ] {
        let key = h.put("ws1", name, text).await;
        assert_ok!(h.pipeline.ingest("ws1", &key).await);
    }
    let ns = Namespace::for_workspace("ws1").unwrap();
    let query = "Bicycle tires should be inflated weekly.";

    let open = Retriever::new(h.embedder.clone(), h.index.clone(), None);
    let retrieval = assert_ok!(open.retrieve(&ns, query, 5).await);
    assert_eq!(retrieval.results.len(), 2);
    assert!(retrieval.results.windows(2).all(|w| w[0].score >= w[1].score));
    assert_eq!(retrieval.results[0].source, "ws1/a.txt");
    assert!(retrieval.context.starts_with("Bicycle tires"));
    let runner_up = retrieval.results[1].score;

    let floor = (runner_up + 0.99) / 2.0;
    let strict = Retriever::new(h.embedder.clone(), h.index.clone(), Some(floor));
    let retrieval = assert_ok!(strict.retrieve(&ns, query, 5).await);
    assert_eq!(retrieval.results.len(), 1);
    assert!(retrieval.results.iter().all(|r| r.score >= floor));
    assert_eq!(retrieval.source_scores.len(), 1);
    assert_eq!(retrieval.source_scores[0].source, "ws1/a.txt");

    let unreachable = Retriever::new(h.embedder.clone(), h.index.clone(), Some(1.5));
    let retrieval = assert_ok!(unreachable.retrieve(&ns, query, 5).await);
    assert!(retrieval.results.is_empty());
    assert!(retrieval.context.is_empty());
}

#[tokio::test]
async fn dropping_the_stream_stops_pulling_from_the_provider() {
    let h = harness(1000, 200);
    let provider = Arc::new(ScriptedProvider::new(&["one", "two", "three", "four"]));
    let service = h.query_service(provider.clone());

    let mut events = service.stream("ws1", prompt_request("count")).await.unwrap();
    assert_eq!(events.next().await.map(|e| e.name()), Some("start"));
    assert_eq!(events.next().await.map(|e| e.name()), Some("chunk"));
    drop(events);

    tokio::task::yield_now().await;
    assert_eq!(provider.pulled(), 1);
}
