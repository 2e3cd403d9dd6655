//! Thin dispatcher over the `eve` library's operations. Argument parsing is
//! deliberately minimal: the first word selects the operation, everything
//! else is operation-specific and passed straight through.

use std::process::ExitCode;

use tokio::sync::watch;
use tracing::{error, info};

fn usage() -> &'static str {
    "usage: eve <migrate|sync|enqueue|compute run|compute status|query> [args]"
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "eve=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", usage());
        return ExitCode::FAILURE;
    };

    let config = match eve_core::EveConfig::load() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let result = match command {
        "migrate" => print_result(eve::migrate(&config)),
        "sync" => match args.get(1) {
            Some(source_path) => print_result(eve::sync(&config, source_path)),
            None => {
                eprintln!("usage: eve sync <chat.db path>");
                return ExitCode::FAILURE;
            }
        },
        "enqueue" => match (args.get(1), args.get(2), args.get(3)) {
            (Some(job_type), Some(key), Some(payload_json)) => {
                match serde_json::from_str::<serde_json::Value>(payload_json) {
                    Ok(payload) => print_result(eve::enqueue(&config, job_type, key, payload)),
                    Err(e) => {
                        eprintln!("invalid payload json: {e}");
                        return ExitCode::FAILURE;
                    }
                }
            }
            _ => {
                eprintln!("usage: eve enqueue <analysis|embedding> <key> <payload-json>");
                return ExitCode::FAILURE;
            }
        },
        "compute" => match args.get(1).map(String::as_str) {
            Some("run") => {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                tokio::spawn(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("shutdown signal received");
                    let _ = shutdown_tx.send(true);
                });
                print_result(eve::compute_run(config, shutdown_rx).await)
            }
            Some("status") => print_result(eve::compute_status(&config)),
            _ => {
                eprintln!("usage: eve compute <run|status>");
                return ExitCode::FAILURE;
            }
        },
        "query" => match args.get(1).and_then(|s| s.parse::<i64>().ok()) {
            Some(conversation_id) => print_result(eve::query_conversation(&config, conversation_id)),
            None => {
                eprintln!("usage: eve query <conversation-id>");
                return ExitCode::FAILURE;
            }
        },
        other => {
            eprintln!("unknown command {other:?}\n{}", usage());
            return ExitCode::FAILURE;
        }
    };

    result
}

fn print_result<T: serde::Serialize>(result: eve::OperationResult<T>) -> ExitCode {
    let ok = result.ok;
    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to encode result: {e}"),
    }
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
