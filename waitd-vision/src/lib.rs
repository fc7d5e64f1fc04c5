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

//! Vision backends: the pluggable "ask a model whether the screenshots
//! satisfy this condition" boundary. Wire formats are backend-specific and
//! not specified here; this crate only fixes the trait both sides agree to.

mod backends;

use async_trait::async_trait;
use serde::Serialize;

pub use backends::{ClaudeBackend, OllamaBackend, PassthroughBackend, VllmBackend};

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
  #[error("vision backend request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("vision backend returned an unexpected response shape: {0}")]
  UnexpectedResponse(String),
}

pub type Result<T> = std::result::Result<T, VisionError>;

#[derive(Debug, Clone, Default)]
pub struct EvaluateOptions {
  pub model: Option<String>,
  pub job_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
  pub ok: bool,
  pub backend: &'static str,
  pub detail: String,
}

/// A vision model capable of judging whether a natural-language condition
/// is satisfied by a short sequence of screenshots.
///
/// Implementations are expected to be cheap to clone/share (`Arc<dyn
/// VisionBackend>`) and safe to call concurrently from many wait jobs at
/// once.
#[async_trait]
pub trait VisionBackend: Send + Sync {
  /// `images` are JPEG-encoded frames, oldest first, most recent last.
  /// Returns the backend's raw text reply — parsing happens in the caller
  /// (`waitd_jobcontext::parse_verdict`), not here.
  async fn evaluate_condition(&self, prompt: &str, images: &[Vec<u8>], opts: &EvaluateOptions) -> Result<String>;

  async fn check_health(&self) -> Health;
}
