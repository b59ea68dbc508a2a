mod auth;
mod backup;
mod db;
mod ipc;
mod stats;
mod timetable;

use std::io::{self, BufRead, Write};

use flexi_logger::{FileSpec, Logger};

/// Diagnostics go to stderr (or a file under REGISTRARD_LOG_DIR);
/// stdout carries the JSON-lines protocol and nothing else.
fn init_logging() -> Option<flexi_logger::LoggerHandle> {
    let result = match std::env::var("REGISTRARD_LOG_DIR") {
        Ok(dir) => Logger::try_with_env_or_str("info").and_then(|l| {
            l.log_to_file(FileSpec::default().directory(dir).basename("registrard"))
                .append()
                .start()
        }),
        Err(_) => Logger::try_with_env_or_str("info").and_then(|l| l.start()),
    };
    match result {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("registrard: logger init failed: {e}");
            None
        }
    }
}

fn main() {
    let _logger = init_logging();

    let mut state = ipc::AppState::new();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id; ignore.
                let _ = writeln!(
                    stdout,
                    "{{\"ok\":false,\"error\":{{\"code\":\"bad_json\",\"message\":\"{}\"}}}}",
                    e
                );
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
