//! Mock TBM data endpoint
//!
//! Serves synthetic batches in the fetch endpoint's wire format so the monitor
//! can be exercised without the real service.
//! Run with: cargo run --bin mock_upstream

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use tbm_monitor::catalog::{self, CUTTERHEAD_TORQUE_ID};

const SOURCES: [&str; 4] = ["api", "predicted", "simulated", "cached"];

fn batch(rng: &mut StdRng, step: u64) -> Value {
    let ready = step >= 5;
    let mut torque = 0.0;
    let features: Vec<Value> = catalog::features()
        .iter()
        .map(|desc| {
            if rng.gen_bool(0.1) {
                return json!({"current_value": null, "current_source": null, "prediction_value": null});
            }
            let (low, high) = desc.band.synthetic;
            let value = rng.gen_range(low..high);
            if desc.id == CUTTERHEAD_TORQUE_ID {
                torque = value;
            }
            let source = SOURCES[rng.gen_range(0..SOURCES.len())];
            let prediction = ready.then(|| value * rng.gen_range(0.95..1.05));
            json!({
                "current_value": value,
                "current_source": source,
                "prediction_value": prediction,
            })
        })
        .collect();
    let status = if torque > 0.0 { "active" } else { "rest" };

    json!({
        "features": features,
        "step_count": step,
        "buffer_ready": ready,
        "tbm_status": status,
    })
}

fn main() -> Result<()> {
    let port: u16 = std::env::var("MOCK_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8765);
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))?;
    let mut rng = StdRng::from_entropy();
    let mut step = 0u64;

    println!("Mock TBM upstream running at http://localhost:{}", port);
    println!();
    println!("Endpoints:");
    println!("  GET /api/tbm-data - One batch per request");
    println!("  GET /api/health   - Health check");
    println!();

    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(s) => s,
            Err(_) => continue,
        };

        let request = match BufReader::new(&stream).lines().next() {
            Some(Ok(line)) => line,
            _ => continue,
        };

        let (status, content_type, body) = if request.starts_with("GET /api/tbm-data") {
            step += 1;
            ("200 OK", "application/json", batch(&mut rng, step).to_string())
        } else if request.starts_with("GET /api/health") {
            ("200 OK", "application/json", json!({"status": "ok", "step_count": step}).to_string())
        } else {
            ("404 NOT FOUND", "text/plain", "Not Found".to_string())
        };

        let response = format!(
            "HTTP/1.1 {}\r\n\
             Content-Type: {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Connection: close\r\n\
             Content-Length: {}\r\n\r\n{}",
            status,
            content_type,
            body.len(),
            body
        );

        let _ = stream.write_all(response.as_bytes());
    }
    Ok(())
}
