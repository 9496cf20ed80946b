//! Per-request rate limiting keyed by caller identity and path category.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::AppError;
use crate::rate_limit::{category_for_path, RateLimitDecision};
use crate::routes::http::USER_ID_HEADER;
use crate::state::AppState;
use crate::util::first_forwarded_hop;

/// `user:{id}` for identified callers, else the client address, else `anonymous`.
pub fn client_identity(headers: &HeaderMap) -> String {
  if let Some(user) = header(headers, USER_ID_HEADER) {
    return format!("user:{user}");
  }
  header(headers, "x-forwarded-for")
    .and_then(first_forwarded_hop)
    .map(str::to_string)
    .unwrap_or_else(|| "anonymous".to_string())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
  headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

pub async fn enforce_rate_limit(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
  let Some(category) = category_for_path(request.uri().path()) else {
    return next.run(request).await;
  };

  let client = client_identity(request.headers());
  let decision = state.limiter.check(&client, category);
  let mut response = if decision.allowed {
    next.run(request).await
  } else {
    AppError::rate_limited(&decision).into_response()
  };
  apply_headers(response.headers_mut(), &decision);
  response
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
  headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
  headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
  headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset_time.timestamp().max(0)));
}

#[cfg(test)]
mod tests {
  use super::*;

  fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in pairs {
      map.insert(*k, HeaderValue::from_static(v));
    }
    map
  }

  #[test]
  fn identified_callers_win_over_addresses() {
    assert_eq!(client_identity(&headers(&[("x-user-id", "u1"), ("x-forwarded-for", "1.2.3.4")])), "user:u1");
    assert_eq!(client_identity(&headers(&[("x-forwarded-for", "1.2.3.4, 10.0.0.1")])), "1.2.3.4");
    assert_eq!(client_identity(&headers(&[])), "anonymous");
  }
}
