//! Standalone load generator for the rate limiter fleet. Not part of the
//! server; a separate binary that rotates across configured nodes and API
//! keys and hammers `/v1/chat/completions` for a fixed duration, then prints
//! aggregate stats.

use clap::Parser;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const PROMPTS: &[&str] = &[
    "Explain the significance of distributed rate limiting in microservices.",
    "List three ways to optimize token usage when calling LLM APIs.",
    "Draft an email announcing a new AI assistant feature for our app.",
    "Summarize the latest sprint planning decisions in bullet points.",
    "Generate three creative marketing slogans for a coffee brand.",
];

#[derive(Parser)]
#[command(name = "load_client", about = "Load generator for the distributed rate limiter")]
struct Cli {
    /// Base URLs for rate limiter nodes, comma-separated.
    #[arg(long, value_delimiter = ',')]
    nodes: Vec<String>,

    /// API keys to rotate through, comma-separated.
    #[arg(long, value_delimiter = ',')]
    api_keys: Vec<String>,

    /// Test duration in seconds.
    #[arg(long, default_value_t = 20)]
    duration: u64,

    /// Number of concurrent workers.
    #[arg(long, default_value_t = 50)]
    concurrency: usize,
}

#[derive(Default)]
struct Stats {
    success: u64,
    throttled: u64,
    failed: u64,
    total_latency: Duration,
    per_node_success: HashMap<String, u64>,
    per_node_throttled: HashMap<String, u64>,
}

impl Stats {
    fn record(&mut self, node: &str, status: Option<u16>, latency: Duration) {
        match status {
            Some(200) => {
                self.success += 1;
                self.total_latency += latency;
                *self.per_node_success.entry(node.to_string()).or_insert(0) += 1;
            }
            Some(429) => {
                self.throttled += 1;
                *self.per_node_throttled.entry(node.to_string()).or_insert(0) += 1;
            }
            _ => self.failed += 1,
        }
    }

    fn merge(&mut self, other: Stats) {
        self.success += other.success;
        self.throttled += other.throttled;
        self.failed += other.failed;
        self.total_latency += other.total_latency;
        for (node, count) in other.per_node_success {
            *self.per_node_success.entry(node).or_insert(0) += count;
        }
        for (node, count) in other.per_node_throttled {
            *self.per_node_throttled.entry(node).or_insert(0) += count;
        }
    }
}

fn make_payload() -> serde_json::Value {
    let mut rng = rand::thread_rng();
    let prompt = PROMPTS.choose(&mut rng).unwrap();
    let max_tokens = rng.gen_range(32..=256);
    let temperature = (rng.gen_range(20..=100) as f64) / 100.0;
    json!({
        "model": "gpt-4o-mini",
        "messages": [
            {"role": "system", "content": "You are a concise assistant."},
            {"role": "user", "content": prompt},
        ],
        "max_tokens": max_tokens,
        "temperature": temperature,
    })
}

async fn worker(
    client: reqwest::Client,
    api_keys: Arc<Vec<String>>,
    nodes: Arc<Vec<String>>,
    payload_cache: Arc<Vec<Vec<u8>>>,
    end_time: Instant,
    stats: Arc<Mutex<Stats>>,
) {
    let mut local = Stats::default();
    let mut rng = rand::thread_rng();

    while Instant::now() < end_time {
        let node = nodes.choose(&mut rng).unwrap().clone();
        let api_key = api_keys.choose(&mut rng).unwrap().clone();
        let payload = payload_cache.choose(&mut rng).unwrap().clone();
        let url = format!("{}/v1/chat/completions", node.trim_end_matches('/'));

        let start = Instant::now();
        let status = client
            .post(&url)
            .bearer_auth(&api_key)
            .header("content-type", "application/json")
            .body(payload)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .ok()
            .map(|r| r.status().as_u16());
        let latency = start.elapsed();
        local.record(&node, status, latency);
    }

    stats.lock().unwrap().merge(local);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.nodes.is_empty() {
        anyhow::bail!("provide at least one --nodes URL");
    }
    if cli.api_keys.is_empty() {
        anyhow::bail!("provide at least one --api-keys value");
    }

    let payload_cache: Arc<Vec<Vec<u8>>> = Arc::new(
        (0..512)
            .map(|_| serde_json::to_vec(&make_payload()).unwrap())
            .collect(),
    );
    let nodes = Arc::new(cli.nodes.clone());
    let api_keys = Arc::new(cli.api_keys.clone());
    let client = reqwest::Client::builder().pool_max_idle_per_host(2000).build()?;
    let stats = Arc::new(Mutex::new(Stats::default()));
    let end_time = Instant::now() + Duration::from_secs(cli.duration);

    let mut handles = Vec::with_capacity(cli.concurrency);
    for _ in 0..cli.concurrency {
        handles.push(tokio::spawn(worker(
            client.clone(),
            api_keys.clone(),
            nodes.clone(),
            payload_cache.clone(),
            end_time,
            stats.clone(),
        )));
    }
    for h in handles {
        let _ = h.await;
    }

    let stats = Arc::try_unwrap(stats).unwrap().into_inner().unwrap();
    let total = stats.success + stats.throttled + stats.failed;
    let avg_latency_ms = if stats.success > 0 {
        stats.total_latency.as_secs_f64() * 1000.0 / stats.success as f64
    } else {
        0.0
    };

    println!(
        "{}",
        json!({
            "total": total,
            "success": stats.success,
            "throttled": stats.throttled,
            "failed": stats.failed,
            "avg_latency_ms": avg_latency_ms,
            "per_node_success": stats.per_node_success,
            "per_node_throttled": stats.per_node_throttled,
        })
    );

    Ok(())
}
