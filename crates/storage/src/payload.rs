use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::record::{IdempotencyKey, OperationKind};

/// Supply-chain action recorded by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Planted,
    Harvested,
    Collected,
    Transported,
    Processed,
    Packaged,
    Distributed,
    Sold,
}

impl StepAction {
    pub const ALL: [StepAction; 8] = [
        StepAction::Planted,
        StepAction::Harvested,
        StepAction::Collected,
        StepAction::Transported,
        StepAction::Processed,
        StepAction::Packaged,
        StepAction::Distributed,
        StepAction::Sold,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Planted => "planted",
            StepAction::Harvested => "harvested",
            StepAction::Collected => "collected",
            StepAction::Transported => "transported",
            StepAction::Processed => "processed",
            StepAction::Packaged => "packaged",
            StepAction::Distributed => "distributed",
            StepAction::Sold => "sold",
        }
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepAction::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown step action '{}'", s))
    }
}

/// Role of the actor performing a supply-chain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Farmer,
    Trader,
    Processor,
    Retailer,
    Consumer,
}

/// Kind of a recorded transfer between two parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Harvest,
    Transfer,
    Processing,
    Sale,
    Return,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Harvest => "harvest",
            TransactionType::Transfer => "transfer",
            TransactionType::Processing => "processing",
            TransactionType::Sale => "sale",
            TransactionType::Return => "return",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRegistration {
    pub batch_number: String,
    pub seed_variety: String,
    /// Unix seconds.
    pub planting_date: i64,
    pub total_quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRegistration {
    pub qr_code: String,
    pub name: String,
    pub variety: String,
    /// Iron content in ppm.
    pub iron_content: u32,
    pub biofortified: bool,
    pub quantity: Decimal,
    /// Unix seconds.
    pub harvest_date: i64,
    #[serde(default)]
    pub ipfs_hash: String,
}

/// A transfer of product between two parties.
///
/// `transfer_id` is the relational store's identifier for the transaction row;
/// it keeps retries of the same transfer on one idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub to_address: String,
    pub qr_code: String,
    pub quantity: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
    pub transaction_type: TransactionType,
}

/// Ledger mirror of one committed supply-chain step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub subject_code: String,
    pub step_number: u32,
    pub action: StepAction,
    pub actor: String,
    pub actor_type: ActorType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub temperature: Option<Decimal>,
    #[serde(default)]
    pub humidity: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub qr_code: String,
}

/// The typed body of a ledger operation. The variant fixes the operation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationPayload {
    RegisterBatch(BatchRegistration),
    RegisterProduct(ProductRegistration),
    RecordTransfer(TransferRecord),
    AppendStep(StepRecord),
    MarkVerified(VerificationRequest),
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::RegisterBatch(_) => OperationKind::RegisterBatch,
            OperationPayload::RegisterProduct(_) => OperationKind::RegisterProduct,
            OperationPayload::RecordTransfer(_) => OperationKind::RecordTransfer,
            OperationPayload::AppendStep(_) => OperationKind::AppendStep,
            OperationPayload::MarkVerified(_) => OperationKind::MarkVerified,
        }
    }

    /// External code of the subject this payload concerns.
    pub fn subject_code(&self) -> &str {
        match self {
            OperationPayload::RegisterBatch(b) => &b.batch_number,
            OperationPayload::RegisterProduct(p) => &p.qr_code,
            OperationPayload::RecordTransfer(t) => &t.qr_code,
            OperationPayload::AppendStep(s) => &s.subject_code,
            OperationPayload::MarkVerified(v) => &v.qr_code,
        }
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        match self {
            OperationPayload::AppendStep(s) => IdempotencyKey::for_step(&s.subject_code, s.step_number),
            OperationPayload::RecordTransfer(t) => {
                IdempotencyKey::for_transfer(&t.qr_code, &t.transfer_id)
            }
            other => IdempotencyKey::for_subject(other.kind(), other.subject_code()),
        }
    }

    /// Reject payloads the ledger would refuse outright.
    ///
    /// Runs before anything is enqueued; a failure here is fatal for the request.
    pub fn validate(&self) -> Result<(), String> {
        if self.subject_code().trim().is_empty() {
            return Err(format!("{}: subject code must not be empty", self.kind()));
        }
        match self {
            OperationPayload::RegisterBatch(b) => {
                if b.seed_variety.trim().is_empty() {
                    return Err("register_batch: seed_variety must not be empty".to_string());
                }
                non_negative("total_quantity", b.total_quantity)
            }
            OperationPayload::RegisterProduct(p) => {
                if p.name.trim().is_empty() {
                    return Err("register_product: name must not be empty".to_string());
                }
                non_negative("quantity", p.quantity)
            }
            OperationPayload::RecordTransfer(t) => {
                if t.transfer_id.trim().is_empty() {
                    return Err("record_transfer: transfer_id must not be empty".to_string());
                }
                if t.to_address.trim().is_empty() {
                    return Err("record_transfer: to_address must not be empty".to_string());
                }
                non_negative("quantity", t.quantity)?;
                match t.price {
                    Some(price) => non_negative("price", price),
                    None => Ok(()),
                }
            }
            OperationPayload::AppendStep(s) => {
                if s.step_number == 0 {
                    return Err("append_step: step numbers start at 1".to_string());
                }
                if s.actor.trim().is_empty() {
                    return Err("append_step: actor must not be empty".to_string());
                }
                if let Some(h) = s.humidity {
                    if h < Decimal::ZERO || h > Decimal::ONE_HUNDRED {
                        return Err(format!("append_step: humidity {} outside 0..=100", h));
                    }
                }
                Ok(())
            }
            OperationPayload::MarkVerified(_) => Ok(()),
        }
    }
}

fn non_negative(field: &str, value: Decimal) -> Result<(), String> {
    if value.is_sign_negative() && !value.is_zero() {
        Err(format!("{} must not be negative (got {})", field, value))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(n: u32) -> StepRecord {
        StepRecord {
            subject_code: "B1".to_string(),
            step_number: n,
            action: StepAction::Harvested,
            actor: "farmer-1".to_string(),
            actor_type: ActorType::Farmer,
            description: String::new(),
            location: None,
            temperature: None,
            humidity: None,
        }
    }

    #[test]
    fn step_key_includes_step_number() {
        let p = OperationPayload::AppendStep(step(3));
        assert_eq!(p.idempotency_key().as_str(), "append_step:B1:3");
        assert_eq!(p.kind(), OperationKind::AppendStep);
    }

    #[test]
    fn verification_key_ignores_everything_but_code() {
        let p = OperationPayload::MarkVerified(VerificationRequest {
            qr_code: "P1".to_string(),
        });
        assert_eq!(p.idempotency_key().as_str(), "mark_verified:P1");
    }

    #[test]
    fn step_zero_is_rejected() {
        let p = OperationPayload::AppendStep(step(0));
        assert!(p.validate().is_err());
    }

    #[test]
    fn humidity_out_of_range_is_rejected() {
        let mut s = step(1);
        s.humidity = Some(Decimal::new(1015, 1));
        assert!(OperationPayload::AppendStep(s).validate().is_err());
    }

    #[test]
    fn negative_transfer_price_is_rejected() {
        let p = OperationPayload::RecordTransfer(TransferRecord {
            transfer_id: "t-1".to_string(),
            to_address: "0xabc".to_string(),
            qr_code: "P1".to_string(),
            quantity: Decimal::new(10, 0),
            price: Some(Decimal::new(-5, 0)),
            transaction_type: TransactionType::Sale,
        });
        assert!(p.validate().unwrap_err().contains("price"));
    }

    #[test]
    fn empty_subject_code_is_rejected() {
        let p = OperationPayload::MarkVerified(VerificationRequest {
            qr_code: "  ".to_string(),
        });
        assert!(p.validate().is_err());
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let p = OperationPayload::MarkVerified(VerificationRequest {
            qr_code: "P1".to_string(),
        });
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["kind"], "mark_verified");
        assert_eq!(json["qr_code"], "P1");
    }

    #[test]
    fn step_action_parses_from_str() {
        assert_eq!("sold".parse::<StepAction>().unwrap(), StepAction::Sold);
        assert!("eaten".parse::<StepAction>().is_err());
    }
}
