//! Request-scoped logging context.
//!
//! A request id is stored in task-local storage so log lines deep inside the
//! upstream client can be correlated with the inbound call without threading
//! the id through every function.

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

tokio::task_local! {
    /// Task-local storage for the inbound endpoint path.
    pub static ENDPOINT: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Get the current endpoint from context, if set.
pub fn get_endpoint() -> String {
    ENDPOINT.try_with(|e| e.clone()).unwrap_or_default()
}

/// Generate a new request ID: `req_` followed by 12 hex characters.
pub fn generate_request_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("req_{}", &hex[..12])
}

/// Generate a Protocol-B message ID: `msg_` followed by 24 hex characters.
pub fn generate_message_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}", &hex[..24])
}

/// Generate a Protocol-B tool-use ID for calls the upstream left unnamed.
pub fn generate_tool_use_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("toolu_{}", &hex[..24])
}

/// Execute an async block with request context (request_id, endpoint).
///
/// # Example
///
/// ```ignore
/// with_request_context!(request_id, "/v1/messages".to_string(), async {
///     // handler logic here
/// })
/// ```
#[macro_export]
macro_rules! with_request_context {
    ($request_id:expr, $endpoint:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, async {
                $crate::core::logging::ENDPOINT.scope($endpoint, $body).await
            })
            .await
    };
}
