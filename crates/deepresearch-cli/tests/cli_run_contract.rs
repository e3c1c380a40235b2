use axum::{routing::post, Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

async fn serve(app: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

/// Chat endpoint that answers every request immediately.
async fn answering_planner(hits: Arc<AtomicUsize>) -> std::net::SocketAddr {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |Json(body): Json<Value>| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let question = body["messages"][1]["content"].as_str().unwrap_or("").to_string();
                let content = if question == "What is xAI?" {
                    "<think>known</think>\n<answer>xAI is an AI company.</answer>".to_string()
                } else {
                    format!("<answer>echo: {question}</answer>")
                };
                Json(json!({
                    "choices": [{"message": {"role": "assistant", "content": content}}]
                }))
            }
        }),
    );
    serve(app).await
}

fn command(addr: std::net::SocketAddr) -> std::process::Command {
    let bin = assert_cmd::cargo::cargo_bin!("deepresearch");
    let mut cmd = std::process::Command::new(bin);
    cmd.env_remove("DEEPRESEARCH_ENV_FILE")
        .env_remove("DEEPRESEARCH_SUMMARY_BASE_URL")
        .env("DEEPRESEARCH_SEARCH_PROVIDER", "none")
        .env("DEEPRESEARCH_PLANNER_BASE_URL", format!("http://{addr}"))
        .env("RUST_LOG", "warn");
    cmd
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_prints_answer_record() {
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = answering_planner(hits.clone()).await;

    let out = tokio::task::spawn_blocking(move || {
        command(addr)
            .args(["run", "--question", "What is xAI?", "--reference-answer", "ref"])
            .output()
            .expect("run deepresearch run")
    })
    .await
    .expect("join");

    assert!(
        out.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let v: Value = serde_json::from_slice(&out.stdout).expect("parse run json");
    assert_eq!(v["prediction"].as_str(), Some("xAI is an AI company."));
    assert_eq!(v["termination"].as_str(), Some("answer"));
    assert_eq!(v["question"].as_str(), Some("What is xAI?"));
    assert_eq!(v["answer"].as_str(), Some("ref"));
    assert_eq!(v["rollout_id"].as_u64(), Some(1));
    assert_eq!(v["rounds"].as_u64(), Some(1));
    assert_eq!(v["messages"].as_array().map(|m| m.len()), Some(3));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_writes_one_record_per_rollout_in_input_order() {
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = answering_planner(hits.clone()).await;

    let dir = tempfile::tempdir().expect("tmp dir");
    let input = dir.path().join("questions.jsonl");
    std::fs::write(
        &input,
        "{\"question\": \"first\", \"answer\": \"a1\"}\n\n{\"question\": \"second\"}\n",
    )
    .expect("write input");
    let out_path = dir.path().join("results.jsonl");

    let (input_arg, out_arg) = (input.clone(), out_path.clone());
    let status = tokio::task::spawn_blocking(move || {
        command(addr)
            .args(["batch", "--rollouts", "2", "--concurrency", "3", "--input"])
            .arg(&input_arg)
            .arg("--out")
            .arg(&out_arg)
            .status()
            .expect("run deepresearch batch")
    })
    .await
    .expect("join");
    assert!(status.success(), "batch failed");

    let txt = std::fs::read_to_string(&out_path).expect("read results");
    let rows: Vec<Value> = txt
        .lines()
        .map(|l| serde_json::from_str(l).expect("row json"))
        .collect();
    let keys: Vec<(String, u64)> = rows
        .iter()
        .map(|r| {
            (
                r["question"].as_str().unwrap_or("").to_string(),
                r["rollout_id"].as_u64().unwrap_or(0),
            )
        })
        .collect();
    assert_eq!(
        keys,
        vec![
            ("first".to_string(), 1),
            ("first".to_string(), 2),
            ("second".to_string(), 1),
            ("second".to_string(), 2),
        ]
    );
    assert_eq!(rows[0]["prediction"].as_str(), Some("echo: first"));
    assert_eq!(rows[0]["answer"].as_str(), Some("a1"));
    assert_eq!(rows[2]["answer"].as_str(), Some(""));
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}
