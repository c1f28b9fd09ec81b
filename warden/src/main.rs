use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, oneshot};

use venue::init_logger;
use venue::types::{Command, CommandResponse, ErrorCode};

use crate::config::{ConfigError, WardenConfig};
use crate::router::CommandRequest;
use crate::warden::{ConnectError, Warden};

mod config;
mod rebalancer;
mod router;
mod warden;

#[tokio::main]
async fn main() {
  dotenv::dotenv().ok();
  init_logger();
  std::process::exit(run().await);
}

async fn run() -> i32 {
  let path = std::env::args().nth(1).map(PathBuf::from);
  let cfg = match WardenConfig::read(path.as_deref()) {
    Ok(cfg) => cfg,
    Err(e) => {
      log::error!("{:#}", e);
      return 1;
    }
  };

  let (warden, handle) = match Warden::init(cfg).await {
    Ok(pair) => pair,
    Err(e) => {
      log::error!("init failed: {:#}", e);
      return if e.downcast_ref::<ConnectError>().is_some() {
        2
      } else if e.downcast_ref::<ConfigError>().is_some() {
        1
      } else {
        3
      };
    }
  };
  let handle = Arc::new(handle);

  // operator commands arrive as line-delimited JSON on stdin
  tokio::spawn(stdin_feed(handle.commands()));

  {
    let handle = handle.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        log::info!("interrupt received, shutting down");
        handle.shutdown();
      }
    });
  }

  match warden.run().await {
    Ok(()) => {
      if handle.is_critical() {
        3
      } else {
        0
      }
    }
    Err(e) => {
      log::error!("engine halted: {:#}", e);
      3
    }
  }
}

async fn stdin_feed(commands: mpsc::Sender<CommandRequest>) {
  let stdin = tokio::io::stdin();
  let mut lines = tokio::io::BufReader::new(stdin).lines();
  while let Ok(Some(line)) = lines.next_line().await {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }
    match serde_json::from_str::<Command>(line) {
      Ok(cmd) => {
        let (tx, rx) = oneshot::channel();
        if commands.send(CommandRequest { cmd, respond: tx }).await.is_err() {
          return;
        }
        if let Ok(resp) = rx.await {
          match serde_json::to_string(&resp) {
            Ok(json) => println!("{}", json),
            Err(e) => log::error!("response serialization failed: {}", e),
          }
        }
      }
      Err(e) => {
        let resp = CommandResponse::err("UNKNOWN", ErrorCode::InvalidRequest, format!("bad command: {}", e));
        println!("{}", serde_json::to_string(&resp).unwrap_or_default());
      }
    }
  }
}
