//! Submission URL construction and the actual submit GET, including the
//! header-precedence and cookie-forwarding rules and acceptance check.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use thiserror::Error;

use super::solve::{AnubisChallenge, SolverResult};
use crate::net::{default_chrome_headers, NetworkClientFactory};

pub const SUBMISSION_PATH: &str = ".within.website/x/cmd/anubis/api/pass-challenge";

/// Cookie name prefixes that count as a valid auth cookie. The first entry
/// is Anubis's own; deployments may configure additional alternates.
pub const DEFAULT_AUTH_COOKIE_PREFIXES: &[&str] = &["techaro.lol-anubis"];

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("submit transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("submit returned unexpected status {0}")]
    Status(reqwest::StatusCode),
    #[error("submit succeeded but no auth cookie was present")]
    NoAuthCookie,
    #[error("failed to build submit request: {0}")]
    Build(String),
}

/// Builds the submission URL per algorithm, embedding the measured elapsed
/// time. `redir` is the original path-and-query (not a full URL) per
/// spec.md §4.3.
pub fn build_submission_url_timed(
    scheme: &str,
    host: &str,
    challenge: &AnubisChallenge,
    result: &SolverResult,
    redir: &str,
    elapsed_ms: u128,
) -> String {
    let id_param = challenge
        .challenge
        .id
        .as_ref()
        .map(|id| format!("&id={id}"))
        .unwrap_or_default();
    let encoded_redir = urlencoding::encode(redir);

    match challenge.algorithm() {
        "metarefresh" => format!(
            "{scheme}://{host}/{SUBMISSION_PATH}?challenge={}&redir={encoded_redir}&elapsedTime={elapsed_ms}{id_param}",
            result.hash
        ),
        "fast" | "slow" => format!(
            "{scheme}://{host}/{SUBMISSION_PATH}?response={}&nonce={}&redir={encoded_redir}&elapsedTime={elapsed_ms}{id_param}",
            result.hash,
            result.nonce.unwrap_or(0)
        ),
        // "preact", the explicit "unknown" tag, and any unrecognized tag all
        // submit the preact-shaped `result=` param.
        _ => format!(
            "{scheme}://{host}/{SUBMISSION_PATH}?result={}&redir={encoded_redir}&elapsedTime={elapsed_ms}{id_param}",
            result.hash
        ),
    }
}

/// Merges default headers, caller overrides (case-insensitive), and initial
/// cookies (which win over anything the caller set under `Cookie`).
pub fn build_submit_headers(caller: Option<&HeaderMap>, initial_cookies: Option<&str>) -> HeaderMap {
    let mut headers = default_chrome_headers();

    if let Some(caller) = caller {
        for (name, value) in caller.iter() {
            headers.insert(name.clone(), value.clone());
        }
    }

    if let Some(cookies) = initial_cookies {
        if let Ok(value) = HeaderValue::from_str(cookies) {
            headers.insert(COOKIE, value);
        }
    }

    headers
}

/// Result of a successful submission: the joined auth-cookie string.
pub struct SubmitOutcome {
    pub cookie: String,
}

/// Issues the submission GET with redirects disabled and checks acceptance
/// per spec.md §4.3: status 302/200 AND at least one cookie whose name
/// starts with a configured auth-cookie prefix.
pub async fn submit(
    net: &NetworkClientFactory,
    url: &str,
    headers: HeaderMap,
    auth_cookie_prefixes: &[&str],
) -> Result<SubmitOutcome, SubmitError> {
    let jar = Arc::new(reqwest::cookie::Jar::default());
    let client = net
        .browser_session(jar.clone(), Duration::from_secs(30), false)
        .map_err(|e| SubmitError::Build(e.to_string()))?;

    let parsed_url = reqwest::Url::parse(url).map_err(|e| SubmitError::Build(e.to_string()))?;

    let mut request = client.get(parsed_url.clone());
    for (name, value) in headers.iter() {
        request = request.header(name, value);
    }

    let response = request.send().await?;
    let status = response.status();

    if status != reqwest::StatusCode::FOUND && status != reqwest::StatusCode::OK {
        return Err(SubmitError::Status(status));
    }

    let cookie_header = jar.cookies(&parsed_url);
    let cookie_string = cookie_header
        .and_then(|v| v.to_str().ok().map(str::to_string))
        .unwrap_or_default();

    let matching: Vec<&str> = cookie_string
        .split(';')
        .map(str::trim)
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or("");
            auth_cookie_prefixes.iter().any(|prefix| name.starts_with(prefix))
        })
        .collect();

    if matching.is_empty() {
        return Err(SubmitError::NoAuthCookie);
    }

    Ok(SubmitOutcome { cookie: matching.join("; ") })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::solve::{AnubisChallengeRules, ChallengeData};

    fn challenge(algorithm: &str, id: Option<&str>) -> AnubisChallenge {
        AnubisChallenge {
            challenge: ChallengeData { id: id.map(str::to_string), random_data: "R".into() },
            rules: AnubisChallengeRules { difficulty: 0, algorithm: algorithm.into() },
        }
    }

    #[test]
    fn preact_submission_url_scenario_a() {
        let c = challenge("preact", Some("X"));
        let result = super::super::solve::solve_preact(&c);
        let url = build_submission_url_timed("https", "example.com", &c, &result, "/foo?bar=baz", 0);
        assert!(url.contains("result="));
        assert!(url.contains(&result.hash));
        assert!(url.contains("redir=%2Ffoo%3Fbar%3Dbaz"));
        assert!(url.contains("id=X"));
    }

    #[test]
    fn unknown_algorithm_falls_back_to_preact_submission_shape() {
        let c = challenge("unknown", Some("X"));
        let result = super::super::solve::solve_preact(&c);
        let url = build_submission_url_timed("https", "example.com", &c, &result, "/foo", 0);
        assert!(url.contains("result="));
        assert!(!url.contains("challenge="));
        assert!(!url.contains("response="));
    }

    #[test]
    fn pow_submission_url_carries_nonce_and_elapsed() {
        let c = challenge("fast", Some("X"));
        let result = SolverResult { hash: "deadbeef".into(), data: "R".into(), difficulty: 2, nonce: Some(7) };
        let url = build_submission_url_timed("https", "h", &c, &result, "/r", 123);
        assert!(url.contains("response=deadbeef"));
        assert!(url.contains("nonce=7"));
        assert!(url.contains("elapsedTime=123"));
    }

    #[test]
    fn initial_cookies_win_over_caller_cookie_header() {
        let mut caller = HeaderMap::new();
        caller.insert(COOKIE, HeaderValue::from_static("caller=1"));
        let headers = build_submit_headers(Some(&caller), Some("initial=1"));
        assert_eq!(headers.get(COOKIE).unwrap(), "initial=1");
    }

    #[test]
    fn caller_headers_override_defaults() {
        let mut caller = HeaderMap::new();
        caller.insert(reqwest::header::USER_AGENT, HeaderValue::from_static("custom-ua"));
        let headers = build_submit_headers(Some(&caller), None);
        assert_eq!(headers.get(reqwest::header::USER_AGENT).unwrap(), "custom-ua");
    }

    #[test]
    fn no_caller_headers_or_cookies_keeps_defaults() {
        let headers = build_submit_headers(None, None);
        assert!(headers.contains_key(reqwest::header::USER_AGENT));
        assert!(!headers.contains_key(COOKIE));
    }
}
