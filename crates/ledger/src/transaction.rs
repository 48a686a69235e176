//! Contract calls, gas, and the signed transaction envelope.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use agritrace_storage::{LedgerOperation, OperationKind, OperationPayload};

/// Gas price and per-operation gas limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasSchedule {
    pub gas_price: u64,
    pub register_batch: u64,
    pub register_product: u64,
    pub record_transfer: u64,
    pub append_step: u64,
    pub mark_verified: u64,
}

impl Default for GasSchedule {
    fn default() -> Self {
        GasSchedule {
            gas_price: 1_000_000_000,
            register_batch: 300_000,
            register_product: 500_000,
            record_transfer: 400_000,
            append_step: 350_000,
            mark_verified: 200_000,
        }
    }
}

impl GasSchedule {
    pub fn limit_for(&self, kind: OperationKind) -> u64 {
        match kind {
            OperationKind::RegisterBatch => self.register_batch,
            OperationKind::RegisterProduct => self.register_product,
            OperationKind::RecordTransfer => self.record_transfer,
            OperationKind::AppendStep => self.append_step,
            OperationKind::MarkVerified => self.mark_verified,
        }
    }
}

/// A call into the provenance contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCall {
    pub method: String,
    pub args: Vec<serde_json::Value>,
}

impl ContractCall {
    pub fn for_payload(payload: &OperationPayload) -> ContractCall {
        let (method, args) = match payload {
            OperationPayload::RegisterBatch(b) => (
                "registerBatch",
                vec![
                    json!(b.batch_number),
                    json!(b.seed_variety),
                    json!(b.planting_date),
                    json!(b.total_quantity.to_string()),
                ],
            ),
            OperationPayload::RegisterProduct(p) => (
                "registerProduct",
                vec![
                    json!(p.qr_code),
                    json!(p.name),
                    json!(p.variety),
                    json!(p.iron_content),
                    json!(p.biofortified),
                    json!(p.quantity.to_string()),
                    json!(p.harvest_date),
                    json!(p.ipfs_hash),
                ],
            ),
            OperationPayload::RecordTransfer(t) => (
                "recordTransaction",
                vec![
                    json!(t.to_address),
                    json!(t.qr_code),
                    json!(t.quantity.to_string()),
                    json!(t.price.map(|p| p.to_string()).unwrap_or_else(|| "0".to_string())),
                    json!(t.transaction_type.as_str()),
                    json!(t.transfer_id),
                ],
            ),
            OperationPayload::AppendStep(s) => (
                "addSupplyChainStep",
                vec![
                    json!(s.subject_code),
                    json!(s.step_number),
                    json!(s.action.as_str()),
                    json!(s.description),
                    json!(s.location.clone().unwrap_or_default()),
                ],
            ),
            OperationPayload::MarkVerified(v) => ("verifyProduct", vec![json!(v.qr_code)]),
        };
        ContractCall {
            method: method.to_string(),
            args,
        }
    }
}

/// The transaction body covered by the signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub from: String,
    pub contract: String,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub call: ContractCall,
    /// Idempotency key of the operation, carried as an opaque memo.
    pub memo: String,
}

impl UnsignedTransaction {
    pub fn for_operation(
        from: &str,
        contract: &str,
        gas: &GasSchedule,
        op: &LedgerOperation,
        nonce: u64,
    ) -> Self {
        UnsignedTransaction {
            from: from.to_string(),
            contract: contract.to_string(),
            nonce,
            gas_limit: gas.limit_for(op.kind),
            gas_price: gas.gas_price,
            call: ContractCall::for_payload(&op.payload),
            memo: op.key.to_string(),
        }
    }

    /// Canonical bytes for signing. Struct fields serialize in declaration order.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(self).map_err(|e| format!("cannot encode transaction: {}", e))
    }
}

/// A signed transaction ready to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx: UnsignedTransaction,
    /// Base64 Ed25519 signature over `tx.signing_bytes()`.
    pub signature: String,
    /// Base64 Ed25519 verifying key of the sender.
    pub public_key: String,
}

impl SignedTransaction {
    /// Base64 wire form sent to the ledger.
    pub fn encode(&self) -> Result<String, String> {
        let bytes = serde_json::to_vec(self).map_err(|e| format!("cannot encode envelope: {}", e))?;
        Ok(BASE64.encode(bytes))
    }

    pub fn decode(raw: &str) -> Result<SignedTransaction, String> {
        let bytes = BASE64
            .decode(raw.trim())
            .map_err(|e| format!("invalid base64 transaction: {}", e))?;
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid transaction envelope: {}", e))
    }

    /// Transaction id: sha256 of the wire form.
    pub fn tx_id(&self) -> Result<String, String> {
        let raw = self.encode()?;
        Ok(format!("0x{:x}", Sha256::digest(raw.as_bytes())))
    }

    /// Check the signature and that `from` matches the signing key.
    pub fn verify(&self) -> Result<(), String> {
        let pk_bytes: [u8; 32] = BASE64
            .decode(&self.public_key)
            .map_err(|e| format!("invalid public key encoding: {}", e))?
            .try_into()
            .map_err(|_| "invalid public key length".to_string())?;
        let verifying_key =
            VerifyingKey::from_bytes(&pk_bytes).map_err(|e| format!("invalid public key: {}", e))?;
        if crate::signer::address_of(&verifying_key) != self.tx.from {
            return Err("sender does not match signing key".to_string());
        }
        let sig_bytes: [u8; 64] = BASE64
            .decode(&self.signature)
            .map_err(|e| format!("invalid signature encoding: {}", e))?
            .try_into()
            .map_err(|_| "invalid signature length".to_string())?;
        let signature = Signature::from_bytes(&sig_bytes);
        verifying_key
            .verify(&self.tx.signing_bytes()?, &signature)
            .map_err(|_| "signature does not verify".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agritrace_storage::{ActorType, StepAction, StepRecord, VerificationRequest};

    #[test]
    fn step_call_carries_step_number() {
        let call = ContractCall::for_payload(&OperationPayload::AppendStep(StepRecord {
            subject_code: "B1".to_string(),
            step_number: 4,
            action: StepAction::Packaged,
            actor: "proc-1".to_string(),
            actor_type: ActorType::Processor,
            description: "50kg bags".to_string(),
            location: None,
            temperature: None,
            humidity: None,
        }));
        assert_eq!(call.method, "addSupplyChainStep");
        assert_eq!(call.args[1], json!(4));
        assert_eq!(call.args[2], json!("packaged"));
        assert_eq!(call.args[4], json!(""));
    }

    #[test]
    fn gas_limits_follow_kind() {
        let gas = GasSchedule::default();
        assert_eq!(gas.limit_for(OperationKind::RegisterProduct), 500_000);
        assert_eq!(gas.limit_for(OperationKind::MarkVerified), 200_000);
    }

    #[test]
    fn verify_call_takes_only_the_code() {
        let call = ContractCall::for_payload(&OperationPayload::MarkVerified(VerificationRequest {
            qr_code: "P1".to_string(),
        }));
        assert_eq!(call.method, "verifyProduct");
        assert_eq!(call.args, vec![json!("P1")]);
    }
}
