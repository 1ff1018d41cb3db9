// ============================================================================
// Contract Record
// The durable form of an escrow contract
// ============================================================================

use super::contract::{ContractState, Role};
use crate::domain::{PeerId, TransactionId};
use crate::interfaces::{LedgerAddress, LedgerTxId};
use crate::numeric::Amount;
use chrono::{DateTime, Utc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// What is written to the durable store on activation and on every later
/// persisted transition. Poll bookkeeping is not part of it: a recovered
/// contract starts a fresh observation window.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ContractRecord {
    pub transaction_id: TransactionId,
    pub role: Role,
    pub crypto_amount: Amount,
    pub fee: Amount,
    pub fiat_price: Amount,
    pub currency: String,
    pub counterparty: PeerId,
    pub destination: Option<LedgerAddress>,
    pub ledger_tx_id: Option<LedgerTxId>,
    pub state: ContractState,
    pub created_at: DateTime<Utc>,
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use super::*;

    #[test]
    fn test_record_json_keeps_amounts_exact() {
        let record = ContractRecord {
            transaction_id: TransactionId::new(),
            role: Role::Receiver,
            crypto_amount: "0.00012345".parse::<Amount>().unwrap(),
            fee: "0.0001".parse::<Amount>().unwrap(),
            fiat_price: "29999.99".parse::<Amount>().unwrap(),
            currency: "EUR".to_string(),
            counterparty: PeerId::new("bob"),
            destination: Some(LedgerAddress::new("bc1qxyz")),
            ledger_tx_id: Some(LedgerTxId::new("deadbeef")),
            state: ContractState::AwaitingConfirmation,
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"0.00012345\""));
        let decoded: ContractRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }
}
