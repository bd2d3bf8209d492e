//! Idempotent create with race recovery
//!
//! The store has no transactions, so two processes can both miss the
//! existence check and both create. After creating, the caller re-reads;
//! the earliest-created record for the key wins and a losing duplicate is
//! marked `superseded_by` the winner. Either way every caller ends up with
//! the winner's id, and all but the creator of the winner see
//! `deduped: true`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::collection::{Collection, Document};
use crate::error::Result;
use crate::record::Filter;

/// Result of an idempotent create
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOutcome<T> {
    pub document: Document<T>,
    /// The record already existed (or another caller won the race)
    pub deduped: bool,
}

impl<T> CreateOutcome<T> {
    pub fn id(&self) -> &str {
        &self.document.id
    }
}

/// Create `value` unless a live record with `key_field == key` exists.
///
/// `key_field` is written into the record, overriding whatever `value`
/// serializes there.
pub async fn create_idempotent<T>(
    collection: &Collection<T>,
    key_field: &str,
    key: &str,
    value: &T,
) -> Result<CreateOutcome<T>>
where
    T: Serialize + DeserializeOwned,
{
    let by_key = Filter::new().eq(key_field, key);

    if let Some(existing) = collection.find_one(&by_key).await? {
        debug!(
            entity = collection.entity(),
            key = %key,
            id = %existing.id,
            "Idempotent create matched existing record"
        );
        return Ok(CreateOutcome {
            document: existing,
            deduped: true,
        });
    }

    let mut data: Map<String, Value> = collection.encode(value)?;
    data.insert(key_field.to_string(), Value::String(key.to_string()));

    let created = match collection.create_data(data).await {
        Ok(created) => created,
        // A store with a unique constraint on the key rejected our insert
        Err(e) if e.is_conflict() => {
            return match collection.find_one(&by_key).await? {
                Some(winner) => Ok(CreateOutcome {
                    document: winner,
                    deduped: true,
                }),
                None => Err(e),
            };
        }
        Err(e) => return Err(e),
    };

    let winner = collection.find_one(&by_key).await?;
    match winner {
        Some(winner) if winner.id != created.id => {
            info!(
                entity = collection.entity(),
                key = %key,
                winner = %winner.id,
                loser = %created.id,
                "Create race lost, superseding duplicate"
            );
            collection
                .supersede(&created.id, &winner.id, Map::new())
                .await?;
            Ok(CreateOutcome {
                document: winner,
                deduped: true,
            })
        }
        _ => Ok(CreateOutcome {
            document: created,
            deduped: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::Collections;
    use crate::memory::MemoryStore;
    use crate::registry::PAYOUT_REQUEST;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payout {
        #[serde(default)]
        idempotency_key: String,
        amount: String,
        currency: String,
        destination: String,
        status: String,
    }

    fn payout() -> Payout {
        Payout {
            idempotency_key: String::new(),
            amount: "300".into(),
            currency: "USD".into(),
            destination: "acct_1".into(),
            status: "REQUESTED".into(),
        }
    }

    #[tokio::test]
    async fn test_second_call_is_deduped() {
        let collections = Collections::standard(Arc::new(MemoryStore::new()));
        let payouts = collections.collection::<Payout>(PAYOUT_REQUEST).unwrap();

        let first = create_idempotent(&payouts, "idempotency_key", "payout:q1", &payout())
            .await
            .unwrap();
        assert!(!first.deduped);
        assert_eq!(first.document.value.idempotency_key, "payout:q1");

        let second = create_idempotent(&payouts, "idempotency_key", "payout:q1", &payout())
            .await
            .unwrap();
        assert!(second.deduped);
        assert_eq!(second.id(), first.id());
    }

    #[tokio::test]
    async fn test_unique_constraint_conflict_is_deduped() {
        let store = Arc::new(MemoryStore::new().with_unique(PAYOUT_REQUEST, "idempotency_key"));
        let collections = Collections::standard(store.clone());
        let payouts = collections.collection::<Payout>(PAYOUT_REQUEST).unwrap();

        let (p1, p2) = (payout(), payout());
        let (a, b) = futures::join!(
            create_idempotent(&payouts, "idempotency_key", "k", &p1),
            create_idempotent(&payouts, "idempotency_key", "k", &p2),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.id(), b.id());
        assert!(a.deduped != b.deduped);
        assert_eq!(store.dump(PAYOUT_REQUEST).len(), 1);
    }
}
