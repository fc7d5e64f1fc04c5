// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! `waitd`: the wait engine daemon. Boots the HTTP surface, the scheduler
//! loop, and the stuck-task detector, and tears all three down cleanly on
//! signal (spec.md §6's "Exit").

mod daemon;
mod error;
mod http;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use daemon::Daemon;
use waitd_config::Config;

fn main() -> anyhow::Result<()> {
  env_logger::init();
  let config_path = parse_args(std::env::args().skip(1))?;
  let config = Config::load(config_path.as_deref())?;

  let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
  runtime.block_on(run(config))
}

/// Parses the daemon's one recognized flag, `--config <path>`.
fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Option<PathBuf>> {
  while let Some(arg) = args.next() {
    if arg == "--config" {
      let path = args.next().ok_or_else(|| anyhow::anyhow!("--config requires a path argument"))?;
      return Ok(Some(PathBuf::from(path)));
    }
    anyhow::bail!("unrecognized argument {arg:?} (only --config <path> is supported)");
  }
  Ok(None)
}

async fn run(config: Config) -> anyhow::Result<()> {
  let bind_addr: SocketAddr = ([127, 0, 0, 1], 8765).into();

  let (daemon, wake_receiver) = Daemon::build(config)?;
  let daemon = Arc::new(daemon);

  let scheduler = daemon.scheduler.clone();
  let scheduler_shutdown = daemon.shutdown.clone();
  let scheduler_task = tokio::spawn(async move { scheduler.run(wake_receiver, scheduler_shutdown).await });

  let stuck_detector = daemon.stuck_detector.clone();
  let stuck_shutdown = daemon.shutdown.clone();
  let stuck_task = tokio::spawn(async move { stuck_detector.run(stuck_shutdown).await });

  let app = http::router(daemon.clone());
  let listener = tokio::net::TcpListener::bind(bind_addr).await?;
  log::info!("waitd listening on {bind_addr}");

  let shutdown_daemon = daemon.clone();
  axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown_signal(shutdown_daemon)).await?;

  let _ = tokio::join!(scheduler_task, stuck_task);
  Ok(())
}

/// Waits for Ctrl+C or SIGTERM, then releases every allocated display
/// before letting the HTTP server finish draining in-flight requests.
async fn wait_for_shutdown_signal(daemon: Arc<Daemon>) {
  let ctrl_c = async {
    let _ = tokio::signal::ctrl_c().await;
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut stream) => {
        stream.recv().await;
      }
      Err(e) => log::warn!("failed to install SIGTERM handler: {e}"),
    }
  };
  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {}
    _ = terminate => {}
  }

  log::info!("shutting down");
  daemon.shutdown().await;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_config_flag() {
    let args = vec!["--config".to_owned(), "/tmp/waitd.toml".to_owned()];
    let parsed = parse_args(args.into_iter()).unwrap();
    assert_eq!(parsed, Some(PathBuf::from("/tmp/waitd.toml")));
  }

  #[test]
  fn no_flags_means_default_config() {
    let parsed = parse_args(std::iter::empty()).unwrap();
    assert_eq!(parsed, None);
  }

  #[test]
  fn missing_config_value_is_an_error() {
    let args = vec!["--config".to_owned()];
    assert!(parse_args(args.into_iter()).is_err());
  }

  #[test]
  fn unknown_flag_is_an_error() {
    let args = vec!["--bogus".to_owned()];
    assert!(parse_args(args.into_iter()).is_err());
  }
}
