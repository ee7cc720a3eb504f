use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tbm_monitor::config::Config;
use tbm_monitor::logging::{log, obj, v_str, Domain, Level};
use tbm_monitor::present::TerminalSurface;
use tbm_monitor::scheduler::{Control, Dashboard};
use tbm_monitor::storage::HistoryStore;
use tbm_monitor::upstream::{HttpUpstream, UpstreamClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

fn parse_command(line: &str) -> Option<Control> {
    match line.trim() {
        "p" | "pause" => Some(Control::TogglePause),
        "r" | "refresh" => Some(Control::Refresh),
        "q" | "quit" | "stop" => Some(Control::Stop),
        _ => None,
    }
}

fn open_history(path: &str) -> Result<HistoryStore> {
    let mut store = HistoryStore::new(path)?;
    store.init()?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("endpoint", v_str(&cfg.endpoint)),
            ("tbm_id", v_str(&cfg.tbm_id)),
            ("poll_secs", json!(cfg.poll_secs)),
            ("fetch_timeout_ms", json!(cfg.fetch_timeout().as_millis() as u64)),
            ("history_db", cfg.history_db.as_deref().map(v_str).unwrap_or_default()),
        ]),
    );

    let client: Arc<dyn UpstreamClient> = Arc::new(HttpUpstream::from_config(&cfg)?);
    let mut dashboard = Dashboard::new(&cfg, client, Box::new(TerminalSurface::new(true)));
    if let Some(path) = cfg.history_db.as_deref() {
        match open_history(path) {
            Ok(store) => dashboard = dashboard.with_history(store),
            Err(e) => log(
                Level::Warn,
                Domain::Storage,
                "history_disabled",
                obj(&[("path", v_str(path)), ("error", v_str(&e.to_string()))]),
            ),
        }
    }

    let (tx, rx) = mpsc::channel(16);

    let console = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(cmd) = parse_command(&line) {
                if console.send(cmd).await.is_err() || cmd == Control::Stop {
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(Control::Stop).await;
        }
    });

    let summary = dashboard.run(rx).await;
    eprintln!(
        "session ended: {} cycles applied, {} discarded, {} on fallback, up {}s",
        summary.stats.applied, summary.stats.discarded, summary.stats.fallback, summary.uptime_secs
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("p"), Some(Control::TogglePause));
        assert_eq!(parse_command(" r \n"), Some(Control::Refresh));
        assert_eq!(parse_command("q"), Some(Control::Stop));
        assert_eq!(parse_command("x"), None);
    }
}
