//! JSON-RPC ledger gateway.
//!
//! Uses `ureq` (sync) wrapped in `tokio::task::spawn_blocking`. Every request
//! shares one agent whose global timeout is the submission timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use agritrace_storage::{BlockRef, LedgerOperation, SubjectKind};

use crate::error::SubmissionError;
use crate::gateway::{
    LedgerGateway, LedgerInfo, LedgerRead, OnChainStep, OnChainSubject, ReceiptStatus,
};
use crate::signer::AccountSigner;
use crate::transaction::{GasSchedule, UnsignedTransaction};

/// The ledger refused the transaction's nonce.
const NONCE_CONFLICT: i64 = -32010;
/// Node overloaded or temporarily out of sync.
const NODE_BUSY: i64 = -32005;
const INTERNAL_ERROR: i64 = -32603;

/// Connection settings for [`JsonRpcGateway`].
#[derive(Debug, Clone)]
pub struct RpcSettings {
    pub endpoint: String,
    pub network: String,
    pub contract_address: String,
    pub timeout: Duration,
    pub gas: GasSchedule,
}

#[derive(Debug, Clone, PartialEq)]
enum RpcFailure {
    /// The request never left: connection refused, host unknown.
    Unreachable(String),
    /// The request went out but no usable HTTP reply came back.
    Transport(String),
    /// HTTP status outside 2xx.
    Http(u16),
    /// JSON-RPC error object.
    Rpc { code: i64, message: String },
    /// Reply arrived but was not a JSON-RPC response.
    Malformed(String),
}

impl RpcFailure {
    fn describe(&self) -> String {
        match self {
            RpcFailure::Unreachable(msg) | RpcFailure::Transport(msg) => msg.clone(),
            RpcFailure::Http(status) => format!("HTTP {}", status),
            RpcFailure::Rpc { code, message } => format!("rpc error {}: {}", code, message),
            RpcFailure::Malformed(msg) => format!("malformed reply: {}", msg),
        }
    }

    /// `tx_id` is the id of the transaction that was sent, reported back
    /// when the node may have accepted it without the reply arriving.
    fn into_submission_error(self, nonce: u64, tx_id: &str) -> SubmissionError {
        match self {
            RpcFailure::Unreachable(msg) => SubmissionError::Transport(msg),
            RpcFailure::Transport(message) => SubmissionError::Unacknowledged {
                tx_id: tx_id.to_string(),
                message,
            },
            RpcFailure::Http(status) if status == 429 || status >= 500 => {
                SubmissionError::Transport(format!("HTTP {}", status))
            }
            RpcFailure::Http(status) => SubmissionError::Rejected(format!("HTTP {}", status)),
            RpcFailure::Rpc { code, message } if code == NONCE_CONFLICT => {
                SubmissionError::NonceConflict { nonce, message }
            }
            RpcFailure::Rpc { code, message } if code == NODE_BUSY || code == INTERNAL_ERROR => {
                SubmissionError::Transport(format!("rpc error {}: {}", code, message))
            }
            RpcFailure::Rpc { message, .. } => SubmissionError::Rejected(message),
            RpcFailure::Malformed(msg) => SubmissionError::Unacknowledged {
                tx_id: tx_id.to_string(),
                message: format!("malformed reply: {}", msg),
            },
        }
    }
}

fn request_failure(err: ureq::Error) -> RpcFailure {
    match &err {
        ureq::Error::HostNotFound | ureq::Error::ConnectionFailed => {
            RpcFailure::Unreachable(err.to_string())
        }
        ureq::Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            RpcFailure::Unreachable(err.to_string())
        }
        _ => RpcFailure::Transport(err.to_string()),
    }
}

/// Gateway speaking JSON-RPC 2.0 to a ledger node.
pub struct JsonRpcGateway {
    settings: RpcSettings,
    signer: Option<Arc<AccountSigner>>,
    agent: ureq::Agent,
    next_id: AtomicU64,
}

impl JsonRpcGateway {
    pub fn new(settings: RpcSettings, signer: Option<Arc<AccountSigner>>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(settings.timeout))
            .http_status_as_error(false)
            .build()
            .into();
        JsonRpcGateway {
            settings,
            signer,
            agent,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value, RpcFailure> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let agent = self.agent.clone();
        let url = self.settings.endpoint.clone();

        let reply = tokio::task::spawn_blocking(move || {
            let response = agent
                .post(&url)
                .send_json(&body)
                .map_err(request_failure)?;
            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                return Err(RpcFailure::Http(status));
            }
            response
                .into_body()
                .read_json::<Value>()
                .map_err(|e| RpcFailure::Malformed(e.to_string()))
        })
        .await
        .map_err(|e| RpcFailure::Transport(format!("task join error: {}", e)))??;

        parse_reply(reply)
    }

    async fn contract_call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcFailure> {
        self.call(
            "ledger_call",
            json!([{
                "contract": self.settings.contract_address,
                "method": method,
                "args": args,
            }]),
        )
        .await
    }
}

fn parse_reply(reply: Value) -> Result<Value, RpcFailure> {
    if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
        return Err(RpcFailure::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    match reply.get("result") {
        Some(result) => Ok(result.clone()),
        None => Err(RpcFailure::Malformed("no result or error".to_string())),
    }
}

/// Translate a `ledger_getTransactionReceipt` result.
fn parse_receipt(result: &Value) -> ReceiptStatus {
    if result.is_null() {
        return ReceiptStatus::NotFound;
    }
    let block = || -> Option<BlockRef> {
        Some(BlockRef {
            number: result.get("blockNumber")?.as_u64()?,
            hash: result.get("blockHash")?.as_str()?.to_string(),
        })
    };
    match result.get("status").and_then(Value::as_str) {
        Some("pending") => ReceiptStatus::StillPending,
        Some("success") => match block() {
            Some(b) => ReceiptStatus::Confirmed(b),
            None => ReceiptStatus::Unreachable("receipt without block reference".to_string()),
        },
        Some("reverted") => match block() {
            Some(b) => ReceiptStatus::Reverted {
                block: b,
                reason: result
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("reverted")
                    .to_string(),
            },
            None => ReceiptStatus::Unreachable("receipt without block reference".to_string()),
        },
        other => ReceiptStatus::Unreachable(format!("unrecognized receipt status {:?}", other)),
    }
}

#[async_trait]
impl LedgerGateway for JsonRpcGateway {
    fn account(&self) -> Option<&str> {
        self.signer.as_deref().map(AccountSigner::address)
    }

    async fn submit(&self, op: &LedgerOperation, nonce: u64) -> Result<String, SubmissionError> {
        let signer = self
            .signer
            .as_deref()
            .ok_or_else(|| SubmissionError::Signing("no signing account configured".to_string()))?;
        let unsigned = UnsignedTransaction::for_operation(
            signer.address(),
            &self.settings.contract_address,
            &self.settings.gas,
            op,
            nonce,
        );
        let signed = signer.sign(unsigned).map_err(SubmissionError::Signing)?;
        let raw = signed.encode().map_err(SubmissionError::Signing)?;
        let local_id = signed.tx_id().map_err(SubmissionError::Signing)?;

        let result = self
            .call("ledger_sendRawTransaction", json!([raw]))
            .await
            .map_err(|f| f.into_submission_error(nonce, &local_id))?;
        let tx_id = result.as_str().map(str::to_string).unwrap_or(local_id);
        tracing::debug!(key = %op.key, nonce, tx = %tx_id, "transaction sent");
        Ok(tx_id)
    }

    async fn fetch_receipt(&self, tx_id: &str) -> ReceiptStatus {
        match self.call("ledger_getTransactionReceipt", json!([tx_id])).await {
            Ok(result) => parse_receipt(&result),
            Err(f) => ReceiptStatus::Unreachable(f.describe()),
        }
    }

    async fn account_nonce(&self, account: &str) -> LedgerRead<u64> {
        match self.call("ledger_getNonce", json!([account])).await {
            Ok(v) => match v.as_u64() {
                Some(n) => LedgerRead::Found(n),
                None => LedgerRead::Unknown(format!("nonce is not a number: {}", v)),
            },
            Err(f) => LedgerRead::Unknown(f.describe()),
        }
    }

    async fn get_subject(&self, code: &str) -> LedgerRead<OnChainSubject> {
        for (method, kind) in [
            ("getProduct", SubjectKind::Product),
            ("getBatch", SubjectKind::Batch),
        ] {
            match self.contract_call(method, vec![json!(code)]).await {
                Ok(Value::Null) => continue,
                Ok(details) => {
                    let creator = details
                        .get("creator")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    return LedgerRead::Found(OnChainSubject {
                        code: code.to_string(),
                        kind,
                        creator,
                        details,
                    });
                }
                Err(f) => return LedgerRead::Unknown(f.describe()),
            }
        }
        LedgerRead::NotFound
    }

    async fn get_step_history(&self, code: &str) -> LedgerRead<Vec<OnChainStep>> {
        match self.contract_call("getSupplyChainHistory", vec![json!(code)]).await {
            Ok(Value::Null) => LedgerRead::NotFound,
            Ok(v) => match serde_json::from_value::<Vec<OnChainStep>>(v) {
                Ok(steps) => LedgerRead::Found(steps),
                Err(e) => LedgerRead::Unknown(format!("unreadable step history: {}", e)),
            },
            Err(f) => LedgerRead::Unknown(f.describe()),
        }
    }

    async fn is_verified(&self, code: &str) -> LedgerRead<bool> {
        match self.contract_call("isProductVerified", vec![json!(code)]).await {
            Ok(Value::Null) => LedgerRead::NotFound,
            Ok(Value::Bool(b)) => LedgerRead::Found(b),
            Ok(other) => LedgerRead::Unknown(format!("unexpected verification value: {}", other)),
            Err(f) => LedgerRead::Unknown(f.describe()),
        }
    }

    async fn ledger_info(&self) -> LedgerInfo {
        let account = self.account().map(str::to_string);
        let (connected, balance) = match &account {
            Some(addr) => match self.call("ledger_getBalance", json!([addr])).await {
                Ok(v) => (true, Some(v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))),
                Err(f) => {
                    tracing::debug!(error = %f.describe(), "balance query failed");
                    (false, None)
                }
            },
            None => (self.call("ledger_blockNumber", json!([])).await.is_ok(), None),
        };
        LedgerInfo {
            connected,
            network: self.settings.network.clone(),
            endpoint: self.settings.endpoint.clone(),
            account,
            balance,
            contract_address: Some(self.settings.contract_address.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(endpoint: &str) -> RpcSettings {
        RpcSettings {
            endpoint: endpoint.to_string(),
            network: "testnet".to_string(),
            contract_address: "0xcontract".to_string(),
            timeout: Duration::from_secs(2),
            gas: GasSchedule::default(),
        }
    }

    #[test]
    fn receipt_statuses_map_to_local_types() {
        assert_eq!(parse_receipt(&Value::Null), ReceiptStatus::NotFound);
        assert_eq!(
            parse_receipt(&json!({"status": "pending"})),
            ReceiptStatus::StillPending
        );
        assert_eq!(
            parse_receipt(&json!({"status": "success", "blockNumber": 7, "blockHash": "0xb7"})),
            ReceiptStatus::Confirmed(BlockRef {
                number: 7,
                hash: "0xb7".to_string()
            })
        );
        assert!(matches!(
            parse_receipt(&json!({"status": "reverted", "blockNumber": 8, "blockHash": "0xb8", "reason": "batch exists"})),
            ReceiptStatus::Reverted { reason, .. } if reason == "batch exists"
        ));
        assert!(matches!(
            parse_receipt(&json!({"status": "success"})),
            ReceiptStatus::Unreachable(_)
        ));
    }

    #[test]
    fn rpc_errors_are_classified() {
        let conflict = RpcFailure::Rpc {
            code: NONCE_CONFLICT,
            message: "nonce too low".to_string(),
        };
        assert!(matches!(
            conflict.into_submission_error(4, "0xt"),
            SubmissionError::NonceConflict { nonce: 4, .. }
        ));
        let busy = RpcFailure::Rpc {
            code: NODE_BUSY,
            message: "busy".to_string(),
        };
        assert!(busy.into_submission_error(1, "0xt").is_retryable());
        let funds = RpcFailure::Rpc {
            code: -32000,
            message: "insufficient funds".to_string(),
        };
        assert_eq!(
            funds.into_submission_error(1, "0xt"),
            SubmissionError::Rejected("insufficient funds".to_string())
        );
        assert!(RpcFailure::Http(503).into_submission_error(1, "0xt").is_retryable());
        assert!(RpcFailure::Http(429).into_submission_error(1, "0xt").is_retryable());
        assert!(!RpcFailure::Http(400).into_submission_error(1, "0xt").is_retryable());
    }

    #[test]
    fn lost_reply_reports_the_sent_transaction() {
        let lost = RpcFailure::Transport("timeout: global".to_string());
        assert_eq!(
            lost.into_submission_error(3, "0xt3"),
            SubmissionError::Unacknowledged {
                tx_id: "0xt3".to_string(),
                message: "timeout: global".to_string(),
            }
        );
        let garbled = RpcFailure::Malformed("expected value".to_string());
        assert_eq!(garbled.into_submission_error(3, "0xt3").possibly_sent(), Some("0xt3"));
        let refused = RpcFailure::Unreachable("connection refused".to_string());
        assert_eq!(refused.into_submission_error(3, "0xt3").possibly_sent(), None);
    }

    #[test]
    fn error_object_wins_over_result() {
        let reply = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32010, "message": "nonce too low"}});
        assert_eq!(
            parse_reply(reply),
            Err(RpcFailure::Rpc {
                code: -32010,
                message: "nonce too low".to_string()
            })
        );
        assert_eq!(
            parse_reply(json!({"jsonrpc": "2.0", "id": 1, "result": null})),
            Ok(Value::Null)
        );
    }

    #[tokio::test]
    async fn submit_without_signer_is_a_signing_error() {
        let gateway = JsonRpcGateway::new(settings("http://127.0.0.1:1"), None);
        let op = LedgerOperation::new(
            agritrace_storage::OperationPayload::MarkVerified(
                agritrace_storage::VerificationRequest {
                    qr_code: "P1".to_string(),
                },
            ),
            time::OffsetDateTime::UNIX_EPOCH,
        );
        let err = gateway.submit(&op, 1).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Signing(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_retryable_or_unknown() {
        let signer = Arc::new(AccountSigner::generate());
        let gateway = JsonRpcGateway::new(settings("http://127.0.0.1:1"), Some(signer));
        let op = LedgerOperation::new(
            agritrace_storage::OperationPayload::MarkVerified(
                agritrace_storage::VerificationRequest {
                    qr_code: "P1".to_string(),
                },
            ),
            time::OffsetDateTime::UNIX_EPOCH,
        );
        let err = gateway.submit(&op, 1).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Transport(_)));
        assert!(matches!(
            gateway.fetch_receipt("0xabc").await,
            ReceiptStatus::Unreachable(_)
        ));
        assert!(matches!(
            gateway.is_verified("P1").await,
            LedgerRead::Unknown(_)
        ));
        assert!(!gateway.ledger_info().await.connected);
    }
}
