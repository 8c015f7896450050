//! Challenge detection, solving, submission, and caching — the bot-gateway
//! bypass subsystem. See spec.md §4.3 for the full contract.

pub mod cache;
pub mod inflight;
pub mod solve;
pub mod submit;

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use solve::{AnubisChallenge, AnubisChallengeRules, ChallengeData, SolverResult};

use crate::net::NetworkClientFactory;
use crate::settings::{SettingsStore, StoreError};
use cache::CookieCache;
use inflight::{InflightMap, Slot, WaitError};
use submit::{build_submit_headers, build_submission_url_timed, submit, SubmitError, DEFAULT_AUTH_COOKIE_PREFIXES};

#[derive(Debug, Error)]
pub enum SolverError {
    /// Not an error condition per se: the body did not match challenge
    /// detection at all.
    #[error("body is not a challenge page")]
    NotAChallenge,
    #[error("challenge script found but payload was malformed or empty")]
    ParseError,
    #[error("solve cancelled")]
    Cancelled,
    #[error("submit transport error: {0}")]
    SubmitTransport(String),
    #[error("submit returned unexpected status {0}")]
    SubmitStatus(u16),
    #[error("submit succeeded but no auth cookie was present")]
    NoAuthCookie,
    #[error("inflight waiter completed but cache lookup returned empty")]
    CachePostconditionMissing,
    #[error("settings store error: {0}")]
    Store(#[from] StoreError),
}

impl From<SubmitError> for SolverError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Transport(e) => SolverError::SubmitTransport(e.to_string()),
            SubmitError::Build(msg) => SolverError::SubmitTransport(msg),
            SubmitError::Status(s) => SolverError::SubmitStatus(s.as_u16()),
            SubmitError::NoAuthCookie => SolverError::NoAuthCookie,
        }
    }
}

/// Result of classifying a response body for challenge content.
pub enum ChallengePage {
    /// No challenge script present at all.
    None,
    /// Challenge script present but the payload was null/empty — a
    /// rejection page that cannot be solved.
    Reject,
    /// A solvable challenge.
    Challenge(AnubisChallenge),
}

/// Parsed challenge plus the detected Anubis protocol version tag, if any.
pub struct ParsedChallenge {
    pub challenge: AnubisChallenge,
    pub version: String,
}

/// Classifies `html` per spec.md §4.3: a response is a challenge page iff
/// it contains `<script id="anubis_challenge" type="application/json">`
/// whose JSON payload is an object with non-empty `challenge.randomData`.
pub fn classify_challenge_page(html: &str) -> ChallengePage {
    if !html.contains("anubis_challenge") {
        return ChallengePage::None;
    }

    let document = Html::parse_document(html);
    let selector = match Selector::parse("#anubis_challenge") {
        Ok(s) => s,
        Err(_) => return ChallengePage::None,
    };

    let element = match document.select(&selector).next() {
        Some(el) => el,
        None => return ChallengePage::None,
    };

    let is_json_script = element
        .value()
        .attr("type")
        .map(|t| t.eq_ignore_ascii_case("application/json"))
        .unwrap_or(true); // tolerate missing type attribute, matching the teacher's lenient parser
    if !is_json_script {
        return ChallengePage::None;
    }

    let payload = element.text().collect::<String>();
    let trimmed = payload.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return ChallengePage::Reject;
    }

    match serde_json::from_str::<AnubisChallenge>(trimmed) {
        Ok(challenge) if !challenge.challenge.random_data.is_empty() => ChallengePage::Challenge(challenge),
        _ => ChallengePage::Reject,
    }
}

/// Convenience boolean view matching spec.md §8 invariant 2's phrasing.
pub fn is_anubis_challenge(html: &str) -> bool {
    matches!(classify_challenge_page(html), ChallengePage::Challenge(_))
}

/// Parses a challenge from HTML, also extracting the `#anubis_version` tag
/// if present. Returns `None` for anything that is not a solvable
/// challenge (absent script or reject page).
pub fn parse_challenge_from_html(html: &str) -> Option<ParsedChallenge> {
    let challenge = match classify_challenge_page(html) {
        ChallengePage::Challenge(c) => c,
        _ => return None,
    };

    let document = Html::parse_document(html);
    let version = Selector::parse("#anubis_version")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .and_then(|el| serde_json::from_str::<String>(&el.text().collect::<String>()).ok())
        .unwrap_or_else(|| "unknown".to_string());

    Some(ParsedChallenge { challenge, version })
}

/// Everything the caller knows about the request that triggered a
/// challenge page, needed to replay it after solving.
pub struct TriggerContext<'a> {
    pub scheme: &'a str,
    pub host: &'a str,
    pub redir_path_and_query: &'a str,
    pub initial_cookies: Option<&'a str>,
    pub headers: Option<&'a HeaderMap>,
}

/// Computes the request fingerprint the cache key is scoped by, when the
/// caller supplies per-request headers: a stable hash over user-agent,
/// accept, and sec-fetch-site (the set Anubis actually binds cookies to).
fn fingerprint(headers: &HeaderMap) -> String {
    let parts = ["user-agent", "accept", "sec-fetch-site"]
        .iter()
        .map(|name| headers.get(*name).and_then(|v| v.to_str().ok()).unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\u{1}");
    crate::util::sha256_hex(&parts)
}

fn cache_key(host: &str, headers: Option<&HeaderMap>) -> (String, Option<String>) {
    match headers.filter(|h| !h.is_empty()) {
        Some(h) => {
            let fp = fingerprint(h);
            (format!("{host}|{fp}"), Some(fp))
        }
        None => (host.to_string(), None),
    }
}

/// The solver: detection is the caller's job (via [`classify_challenge_page`]
/// or [`parse_challenge_from_html`]); this type owns solving, submission,
/// caching, and inflight dedup.
pub struct Solver {
    net: Arc<NetworkClientFactory>,
    cache: CookieCache,
    inflight: InflightMap,
    auth_cookie_prefixes: Vec<String>,
}

impl Solver {
    pub fn new(net: Arc<NetworkClientFactory>, store: Arc<dyn SettingsStore>) -> Self {
        Self {
            net,
            cache: CookieCache::new(store),
            inflight: InflightMap::default(),
            auth_cookie_prefixes: DEFAULT_AUTH_COOKIE_PREFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Registers an additional accepted auth-cookie name prefix, beyond the
    /// default `techaro.lol-anubis`.
    pub fn add_auth_cookie_prefix(&mut self, prefix: impl Into<String>) {
        self.auth_cookie_prefixes.push(prefix.into());
    }

    /// Solves a challenge extracted from a triggering response and returns
    /// the auth cookie string, deduplicating concurrent solves for the same
    /// cache key and populating both the scoped and host-only cache keys.
    pub async fn solve_from_body(
        &self,
        challenge: &AnubisChallenge,
        ctx: TriggerContext<'_>,
        cancel: CancellationToken,
    ) -> Result<String, SolverError> {
        let (key, fingerprint) = cache_key(ctx.host, ctx.headers);

        match self.inflight.claim(&key) {
            Slot::Owner(guard) => {
                let result = self.solve_and_submit(challenge, &ctx, fingerprint.as_deref(), &cancel).await;
                guard.finish();
                result
            }
            Slot::Waiter(rx) => {
                InflightMap::wait(rx, &cancel).await.map_err(|e| match e {
                    WaitError::Cancelled => SolverError::Cancelled,
                })?;
                let cookie = self.cache.get(ctx.host, fingerprint.as_deref())?;
                if cookie.is_empty() {
                    Err(SolverError::CachePostconditionMissing)
                } else {
                    Ok(cookie)
                }
            }
        }
    }

    async fn solve_and_submit(
        &self,
        challenge: &AnubisChallenge,
        ctx: &TriggerContext<'_>,
        fingerprint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, SolverError> {
        let start = Instant::now();

        let result = match challenge.algorithm() {
            "metarefresh" => {
                let result = solve::solve_metarefresh(challenge);
                wait_or_cancel(challenge.min_wait(), start, cancel).await?;
                result
            }
            "fast" | "slow" => {
                let challenge = challenge.clone();
                let cancel_for_blocking = cancel.clone();
                tokio::task::spawn_blocking(move || solve::solve_pow(&challenge, &cancel_for_blocking))
                    .await
                    .map_err(|_| SolverError::Cancelled)?
                    .map_err(|_| SolverError::Cancelled)?
            }
            // "preact", the explicit "unknown" tag, and any unrecognized tag
            // all fall back to the preact path.
            _ => {
                let result = solve::solve_preact(challenge);
                wait_or_cancel(challenge.min_wait(), start, cancel).await?;
                result
            }
        };

        let elapsed_ms = start.elapsed().as_millis();
        let url = build_submission_url_timed(ctx.scheme, ctx.host, challenge, &result, ctx.redir_path_and_query, elapsed_ms);
        let headers = build_submit_headers(ctx.headers, ctx.initial_cookies);

        let prefixes: Vec<&str> = self.auth_cookie_prefixes.iter().map(String::as_str).collect();
        let outcome = submit(&self.net, &url, headers, &prefixes).await?;

        let expires_at = chrono::Utc::now() + chrono::Duration::from_std(cache::DEFAULT_COOKIE_TTL).unwrap();
        // Cache-write failures are logged, not fatal, per spec.md §7.
        if let Err(err) = self.cache.set(ctx.host, fingerprint, &outcome.cookie, expires_at) {
            tracing::warn!(host = ctx.host, error = %err, "failed to cache solved cookie");
        }
        if fingerprint.is_some() {
            if let Err(err) = self.cache.set(ctx.host, None, &outcome.cookie, expires_at) {
                tracing::warn!(host = ctx.host, error = %err, "failed to populate host-only cookie fallback");
            }
        }

        Ok(outcome.cookie)
    }
}

async fn wait_or_cancel(min_wait: Option<Duration>, start: Instant, cancel: &CancellationToken) -> Result<(), SolverError> {
    let Some(min_wait) = min_wait else { return Ok(()) };
    let elapsed = start.elapsed();
    if elapsed >= min_wait {
        return Ok(());
    }
    let remaining = min_wait - elapsed;
    tokio::select! {
        _ = tokio::time::sleep(remaining) => Ok(()),
        _ = cancel.cancelled() => Err(SolverError::Cancelled),
    }
}
