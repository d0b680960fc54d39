//! # Trust Resolution
//!
//! A query fanned out to many peers usually comes back with conflicting
//! answers. This module decides which one to believe, in two independent
//! steps:
//!
//! 1. **Authenticity** - every candidate envelope is verified against the
//!    publisher hash pinned by the query; entries that fail are discarded
//!    outright, whatever their owner's standing.
//! 2. **Trust** - among verified entries, the owner with the strictly
//!    highest operator-assigned weight wins. A tie between positive
//!    weights means the operator gave no basis to prefer either, so there
//!    is no trusted answer. When no owner carries positive weight, the
//!    first verified entry's owner is tentatively accepted.
//!
//! All verified values belonging to the selected owner are merged into the
//! answer, so one publisher can serve several records under one name.

use tracing::debug;

use crate::auth::verify_record;
use crate::dht::Entry;
use crate::identity::Contact;
use crate::protocols::RecordCodec;

/// The winning publisher's answer for one query.
#[derive(Debug, Clone)]
pub struct TrustedAnswer {
    pub owner: Contact,
    /// Verified values from the selected owner, envelope stripped.
    pub values: Vec<Vec<u8>>,
}

/// Pick the answer to believe among the entries returned for one query.
///
/// Returns `None` when nothing verifies, when there are no entries at all,
/// or when positive trust weights tie.
pub fn resolve_trusted(expected_hash: &[u8], entries: &[Entry]) -> Option<TrustedAnswer> {
    let mut verified: Vec<(&Contact, Vec<u8>)> = Vec::new();
    for entry in entries {
        match verify_record(expected_hash, &entry.value) {
            Some(value) => verified.push((&entry.owner, value)),
            None => {
                debug!(owner = %entry.owner, "discarding entry that failed verification");
            }
        }
    }
    if verified.is_empty() {
        debug!("no verified entries to resolve");
        return None;
    }

    let max_weight = verified
        .iter()
        .map(|(owner, _)| owner.weight())
        .fold(0.0f64, f64::max);

    let selected: Contact = if max_weight > 0.0 {
        let mut at_max: Vec<&Contact> = Vec::new();
        for (owner, _) in &verified {
            if owner.weight() == max_weight && !at_max.contains(owner) {
                at_max.push(*owner);
            }
        }
        if at_max.len() > 1 {
            debug!(
                weight = max_weight,
                candidates = at_max.len(),
                "positive trust weights tie, refusing to pick"
            );
            return None;
        }
        at_max[0].clone()
    } else {
        // Nothing positively weighted: tentatively accept the first
        // verified owner encountered.
        verified[0].0.clone()
    };

    let values: Vec<Vec<u8>> = verified
        .iter()
        .filter(|(owner, _)| **owner == selected)
        .map(|(_, value)| value.clone())
        .collect();

    debug!(
        owner = %selected,
        weight = selected.weight(),
        values = values.len(),
        "selected trusted answer"
    );
    Some(TrustedAnswer {
        owner: selected,
        values,
    })
}

/// Decode the winning values through the external record codec.
///
/// Values the codec rejects are dropped; the name is passed through so the
/// codec can contextualize the record.
pub fn decode_answer<C: RecordCodec>(codec: &C, name: &str, answer: &TrustedAnswer) -> Vec<C::Record> {
    answer
        .values
        .iter()
        .filter_map(|value| codec.decode_record(name, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{sign_record, Keypair};
    use crate::identity::Identifier;

    struct Utf8Codec;

    impl RecordCodec for Utf8Codec {
        type Record = String;

        fn encode_record(&self, record: &String) -> Vec<u8> {
            record.as_bytes().to_vec()
        }

        fn decode_record(&self, _name: &str, bytes: &[u8]) -> Option<String> {
            let text = String::from_utf8(bytes.to_vec()).ok()?;
            if text.is_empty() {
                return None;
            }
            Some(text)
        }
    }

    fn contact(name: &str, weight: Option<f64>) -> Contact {
        let addr = "127.0.0.1:12000".parse().unwrap();
        match weight {
            Some(w) => Contact::trusted(Identifier::hash(name.as_bytes()), addr, w),
            None => Contact::new(Identifier::hash(name.as_bytes()), addr),
        }
    }

    fn signed_entry(owner: &Contact, publisher: &Keypair, value: &[u8]) -> Entry {
        Entry {
            owner: owner.clone(),
            key: Identifier::hash(b"query"),
            value: sign_record(publisher, value),
        }
    }

    #[test]
    fn highest_weight_verified_owner_wins() {
        let publisher = Keypair::generate();
        let hash = publisher.public_key_hash();

        let low = contact("low", Some(0.2));
        let high = contact("high", Some(0.9));
        let mid = contact("mid", Some(0.5));

        let entries = vec![
            signed_entry(&low, &publisher, b"low answer"),
            signed_entry(&high, &publisher, b"high answer"),
            signed_entry(&mid, &publisher, b"mid answer"),
        ];

        let answer = resolve_trusted(&hash, &entries).expect("no answer selected");
        assert_eq!(answer.owner, high);
        assert_eq!(answer.values, vec![b"high answer".to_vec()]);
    }

    #[test]
    fn failed_verification_discards_even_the_heaviest_owner() {
        let publisher = Keypair::generate();
        let forger = Keypair::generate();
        let hash = publisher.public_key_hash();

        let heavy = contact("heavy", Some(0.9));
        let light = contact("light", Some(0.2));

        let entries = vec![
            signed_entry(&heavy, &forger, b"forged"),
            signed_entry(&light, &publisher, b"genuine"),
        ];

        let answer = resolve_trusted(&hash, &entries).expect("no answer selected");
        assert_eq!(answer.owner, light);
        assert_eq!(answer.values, vec![b"genuine".to_vec()]);
    }

    #[test]
    fn all_zero_weights_accept_a_single_verified_owner() {
        let publisher = Keypair::generate();
        let forger = Keypair::generate();
        let hash = publisher.public_key_hash();

        let a = contact("a", None);
        let b = contact("b", Some(0.0));
        let forged_owner = contact("c", None);

        let entries = vec![
            signed_entry(&forged_owner, &forger, b"forged"),
            signed_entry(&a, &publisher, b"first"),
            signed_entry(&b, &publisher, b"second"),
        ];

        let answer = resolve_trusted(&hash, &entries).expect("no answer selected");
        // Any single verified owner may win, but never the forged one.
        assert_ne!(answer.owner, forged_owner);
        assert!(answer.owner == a || answer.owner == b);
    }

    #[test]
    fn positive_weight_tie_yields_no_answer() {
        let publisher = Keypair::generate();
        let hash = publisher.public_key_hash();

        let first = contact("first", Some(0.6));
        let second = contact("second", Some(0.6));

        let entries = vec![
            signed_entry(&first, &publisher, b"one"),
            signed_entry(&second, &publisher, b"two"),
        ];

        assert!(resolve_trusted(&hash, &entries).is_none());
    }

    #[test]
    fn winning_owners_values_are_merged() {
        let publisher = Keypair::generate();
        let hash = publisher.public_key_hash();

        let winner = contact("winner", Some(0.8));
        let loser = contact("loser", Some(0.1));

        let entries = vec![
            signed_entry(&winner, &publisher, b"addr one"),
            signed_entry(&loser, &publisher, b"other"),
            signed_entry(&winner, &publisher, b"addr two"),
        ];

        let answer = resolve_trusted(&hash, &entries).expect("no answer selected");
        assert_eq!(
            answer.values,
            vec![b"addr one".to_vec(), b"addr two".to_vec()]
        );
    }

    #[test]
    fn no_entries_and_nothing_verified_yield_no_answer() {
        let publisher = Keypair::generate();
        let forger = Keypair::generate();
        let hash = publisher.public_key_hash();

        assert!(resolve_trusted(&hash, &[]).is_none());

        let entries = vec![signed_entry(&contact("x", Some(0.9)), &forger, b"forged")];
        assert!(resolve_trusted(&hash, &entries).is_none());
    }

    #[test]
    fn decode_answer_filters_through_the_codec() {
        let publisher = Keypair::generate();
        let hash = publisher.public_key_hash();
        let owner = contact("owner", Some(0.5));

        let entries = vec![
            signed_entry(&owner, &publisher, b"valid record"),
            signed_entry(&owner, &publisher, &[0xFF, 0xFE]),
        ];

        let answer = resolve_trusted(&hash, &entries).expect("no answer selected");
        let records = decode_answer(&Utf8Codec, "www.example.p2p", &answer);
        assert_eq!(records, vec!["valid record".to_string()]);
    }
}
