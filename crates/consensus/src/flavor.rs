use storage::AccountStore;
use thiserror::Error;
use types::Transaction;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("transaction flavor does not match node configuration")]
    WrongFlavor,
    #[error("insufficient balance: {account} has {balance}, needs {needed}")]
    InsufficientBalance {
        account: String,
        balance: u64,
        needed: u64,
    },
    #[error("malformed model payload: {0}")]
    MalformedModel(String),
}

/// Flavor-specific acceptance validator (spec §4.4.5 step 3). Invoked both
/// at mempool-admission time and again, against a fresh per-block
/// accumulator, during `construct_block` (spec §4.4.6 step 1).
pub trait TxValidator: Send + Sync {
    /// `pending` is the set of other transactions already provisionally
    /// accepted in this pass (the live mempool at admission time, or the
    /// in-progress block accumulator during construction) — needed so a
    /// sequence of financial transactions draining the same account is
    /// checked against each other, not just against committed balances.
    fn validate(
        &self,
        tx: &Transaction,
        pending: &[Transaction],
        accounts: &dyn AccountStore,
    ) -> Result<(), ValidationError>;
}

/// Balance-feasibility validator for the financial flavor: a transaction is
/// only accepted if its `from` account can cover `amount` given its
/// committed balance, adjusted by every other pending transaction that
/// moves funds into or out of that same account. This lets a chain of
/// transactions within one round settle in the same block even though no
/// single one of them is covered by the committed ledger alone (e.g.
/// A pays B, and B — currently at a committed balance of 0 — spends part
/// of that incoming amount in the same round).
pub struct FinancialValidator;

impl TxValidator for FinancialValidator {
    fn validate(
        &self,
        tx: &Transaction,
        pending: &[Transaction],
        accounts: &dyn AccountStore,
    ) -> Result<(), ValidationError> {
        let Some(financial) = tx.as_financial() else {
            return Err(ValidationError::WrongFlavor);
        };

        let committed = accounts.balance(&financial.from) as i128;
        let net_pending: i128 = pending
            .iter()
            .filter_map(|other| other.as_financial())
            .map(|other| {
                let mut delta = 0i128;
                if other.from == financial.from {
                    delta -= other.amount as i128;
                }
                if other.to == financial.from {
                    delta += other.amount as i128;
                }
                delta
            })
            .sum();

        let available = (committed + net_pending).max(0) as u64;
        if available < financial.amount {
            return Err(ValidationError::InsufficientBalance {
                account: financial.from.to_string(),
                balance: available,
                needed: financial.amount,
            });
        }
        Ok(())
    }
}

/// Structural validator for the ML flavor: accepts any `MlTx` whose model
/// payload is well-formed. Deep model parsing and training-data
/// verification are out of scope (spec §1's "Transaction-level validation
/// internals... are out of scope").
pub struct MlValidator;

impl TxValidator for MlValidator {
    fn validate(
        &self,
        tx: &Transaction,
        _pending: &[Transaction],
        _accounts: &dyn AccountStore,
    ) -> Result<(), ValidationError> {
        let Some(ml) = tx.as_ml() else {
            return Err(ValidationError::WrongFlavor);
        };
        if ml.model.model_bytes.is_empty() {
            return Err(ValidationError::MalformedModel("empty model payload".into()));
        }
        if ml.model.intervals_validity.is_empty() {
            return Err(ValidationError::MalformedModel(
                "model declares no validation intervals".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::InMemoryStorage;
    use types::{AccountKey, FinancialTx, ModelData, MlTx, TxUid};

    fn financial(uid: &str, from: &str, to: &str, amount: u64) -> Transaction {
        Transaction::Financial(FinancialTx {
            uid: TxUid(uid.as_bytes().to_vec()),
            from: AccountKey(from.into()),
            to: AccountKey(to.into()),
            amount,
            signature: vec![],
        })
    }

    #[test]
    fn financial_validator_accepts_when_balance_covers_amount() {
        let mut store = InMemoryStorage::default();
        store.set_balance(AccountKey("A".into()), 10);
        let tx = financial("uid-1", "A", "B", 5);

        FinancialValidator.validate(&tx, &[], &store).unwrap();
    }

    #[test]
    fn financial_validator_accepts_spend_of_incoming_pending_credit() {
        let store = InMemoryStorage::default();
        // B starts at 0 but receives 5 from A earlier in the same round.
        let credit = financial("uid-1", "A", "B", 5);
        let spend = financial("uid-2", "B", "C", 3);

        FinancialValidator.validate(&spend, &[credit], &store).unwrap();
    }

    #[test]
    fn financial_validator_rejects_when_pending_drains_balance() {
        let mut store = InMemoryStorage::default();
        store.set_balance(AccountKey("A".into()), 10);
        let already_pending = financial("uid-1", "A", "B", 8);
        let tx = financial("uid-2", "A", "C", 5);

        let err = FinancialValidator
            .validate(&tx, &[already_pending], &store)
            .unwrap_err();
        assert!(matches!(err, ValidationError::InsufficientBalance { .. }));
    }

    #[test]
    fn ml_validator_rejects_empty_model() {
        let tx = Transaction::Ml(MlTx {
            uid: TxUid(b"uid-1".to_vec()),
            model: ModelData {
                model_bytes: vec![],
                intervals_validity: vec![true],
            },
            signature: vec![],
        });
        let store = InMemoryStorage::default();
        let err = MlValidator.validate(&tx, &[], &store).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedModel(_)));
    }

    #[test]
    fn ml_validator_accepts_well_formed_model() {
        let tx = Transaction::Ml(MlTx {
            uid: TxUid(b"uid-1".to_vec()),
            model: ModelData {
                model_bytes: vec![1, 2, 3],
                intervals_validity: vec![true, false],
            },
            signature: vec![],
        });
        let store = InMemoryStorage::default();
        MlValidator.validate(&tx, &[], &store).unwrap();
    }
}
