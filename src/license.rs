//! Startup license validation against the external licensing service.
//!
//! The validator itself is a separate collaborator; this is only its
//! client. When `LICENSING_SERVICE_ADDR` is unset the check is skipped.
//! A refusal or an unreachable validator is fatal — the service must not
//! start replicating unlicensed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::info;

use crate::error::KashoError;

const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    service: &'a str,
    version: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(default)]
    reason: String,
}

/// Block until the validator accepts us. Call once at startup.
pub async fn validate(addr: &str, service: &str) -> Result<(), KashoError> {
    let outcome = tokio::time::timeout(VALIDATION_TIMEOUT, validate_inner(addr, service)).await;
    match outcome {
        Ok(result) => result,
        Err(_) => Err(KashoError::License(format!(
            "licensing service {addr} did not answer within {}s",
            VALIDATION_TIMEOUT.as_secs()
        ))),
    }
}

async fn validate_inner(addr: &str, service: &str) -> Result<(), KashoError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| KashoError::License(format!("cannot reach licensing service {addr}: {e}")))?;
    let (read_half, mut write_half) = stream.into_split();

    let request = serde_json::to_string(&ValidateRequest {
        service,
        version: env!("CARGO_PKG_VERSION"),
    })
    .map_err(|e| KashoError::Internal(format!("encode license request: {e}")))?;
    write_half
        .write_all(format!("{request}\n").as_bytes())
        .await
        .map_err(|e| KashoError::License(format!("licensing service write failed: {e}")))?;

    let mut lines = BufReader::new(read_half).lines();
    let line = lines
        .next_line()
        .await
        .map_err(|e| KashoError::License(format!("licensing service read failed: {e}")))?
        .ok_or_else(|| KashoError::License("licensing service closed the connection".into()))?;
    let response: ValidateResponse = serde_json::from_str(&line)
        .map_err(|e| KashoError::License(format!("undecodable license response: {e}")))?;

    if !response.valid {
        return Err(KashoError::License(if response.reason.is_empty() {
            "license refused".to_string()
        } else {
            response.reason
        }));
    }
    info!(addr, "license validated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_validator(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.split();
            let mut lines = BufReader::new(read_half).lines();
            let _request = lines.next_line().await.unwrap();
            write_half
                .write_all(format!("{response}\n").as_bytes())
                .await
                .unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_accepts_valid_license() {
        let addr = fake_validator(r#"{"valid": true}"#).await;
        validate(&addr, "kasho-capture").await.unwrap();
    }

    #[tokio::test]
    async fn test_refusal_is_fatal() {
        let addr = fake_validator(r#"{"valid": false, "reason": "expired"}"#).await;
        let err = validate(&addr, "kasho-capture").await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_unreachable_is_fatal() {
        // Port 1 on localhost refuses connections.
        let err = validate("127.0.0.1:1", "kasho-capture").await.unwrap_err();
        assert!(matches!(err, KashoError::License(_)));
    }
}
