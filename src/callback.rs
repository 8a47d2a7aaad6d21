//! User callback pipeline.
//!
//! Callbacks run sequentially over each response in the order supplied. A
//! failing callback is wrapped into its outcome slot and never aborts
//! dispatch.

use std::sync::Arc;

use log::debug;
use serde_json::Value;

use crate::types::Response;

/// Error type callbacks may return
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// A user callback invoked with each response
pub type Callback = Arc<dyn Fn(&Response) -> std::result::Result<Value, CallbackError> + Send + Sync>;

/// The recorded result of one callback invocation
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    /// The callback returned a value
    Value(Value),
    /// The callback failed; dispatch continued regardless
    Error(String),
}

/// Run `callbacks` over `response` in order; when `collect` is set, attach
/// the outcomes to the response.
pub(crate) fn run_callbacks(response: &mut Response, callbacks: &[Callback], collect: bool) {
    if callbacks.is_empty() {
        return;
    }
    let mut outcomes = Vec::with_capacity(callbacks.len());
    for callback in callbacks {
        match callback(response) {
            Ok(value) => outcomes.push(CallbackOutcome::Value(value)),
            Err(e) => {
                debug!("callback failed on {}: {e}", response.url());
                outcomes.push(CallbackOutcome::Error(e.to_string()));
            }
        }
    }
    if collect {
        response.set_callbacks(outcomes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, StatusCode};
    use serde_json::json;
    use url::Url;

    fn response() -> Response {
        Response::new(
            Method::GET,
            Url::parse("https://example.com").unwrap(),
            StatusCode::OK,
            HeaderMap::new(),
            b"body".to_vec(),
        )
    }

    #[test]
    fn test_outcomes_are_collected_in_order() {
        let mut resp = response();
        let callbacks: Vec<Callback> = vec![
            Arc::new(|r| Ok(json!(r.status().as_u16()))),
            Arc::new(|_| Err("boom".into())),
            Arc::new(|r| Ok(json!(r.text().len()))),
        ];
        run_callbacks(&mut resp, &callbacks, true);
        assert_eq!(
            resp.callbacks(),
            &[
                CallbackOutcome::Value(json!(200)),
                CallbackOutcome::Error("boom".to_string()),
                CallbackOutcome::Value(json!(4)),
            ]
        );
    }

    #[test]
    fn test_outcomes_are_discarded_without_collect() {
        let mut resp = response();
        let callbacks: Vec<Callback> = vec![Arc::new(|_| Ok(json!(1)))];
        run_callbacks(&mut resp, &callbacks, false);
        assert!(resp.callbacks().is_empty());
    }
}
