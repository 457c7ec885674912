//! Echo handler.

use serde_json::Value;

use crate::handler::HandlerResult;

/// Return the request unchanged.
pub async fn echo(request: Value) -> HandlerResult {
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo() {
        let request = json!({"greetings": "hello", "now": 1700000000});
        assert_eq!(echo(request.clone()).await.unwrap(), request);
    }
}
