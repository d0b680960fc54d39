//! End-to-end authenticated resolution across live nodes.
//!
//! Exercises the full pipeline: a publisher signs a record into an
//! envelope, stores it in the DHT, a consumer queries all peers, and the
//! trust resolver picks the verified answer from the highest-weighted
//! publisher.

use fidium::{
    decode_answer, resolve_trusted, sign_record, verify_record, Contact, Identifier, Keypair,
    Node, RecordCodec,
};

/// Stand-in for the external name-record codec: UTF-8 text records.
struct TextCodec;

impl RecordCodec for TextCodec {
    type Record = String;

    fn encode_record(&self, record: &String) -> Vec<u8> {
        record.as_bytes().to_vec()
    }

    fn decode_record(&self, _name: &str, bytes: &[u8]) -> Option<String> {
        String::from_utf8(bytes.to_vec()).ok()
    }
}

async fn bind_node() -> Node {
    Node::bind("127.0.0.1:0").await.expect("bind failed")
}

#[tokio::test]
async fn verified_answer_from_the_most_trusted_peer_wins() {
    let keypair = Keypair::generate();
    let forger = Keypair::generate();

    // The query name pins the genuine publisher's key hash.
    let key = Identifier::hash(b"www.example.p2p.cname-target.key");
    let expected_hash = keypair.public_key_hash();

    let honest = bind_node().await;
    let hostile = bind_node().await;
    let consumer = bind_node().await;

    honest.put(key, sign_record(&keypair, b"203.0.113.7"));
    hostile.put(key, sign_record(&forger, b"198.51.100.66"));

    consumer.add_peer(Contact::trusted(
        honest.identifier(),
        honest.local_addr(),
        0.9,
    ));
    consumer.add_peer(Contact::trusted(
        hostile.identifier(),
        hostile.local_addr(),
        0.5,
    ));

    let entries = consumer.get(key).await;
    assert_eq!(entries.len(), 2, "both peers should have answered");

    let answer = resolve_trusted(&expected_hash, &entries).expect("no trusted answer");
    assert_eq!(answer.owner.identifier, honest.identifier());
    assert_eq!(answer.values, vec![b"203.0.113.7".to_vec()]);

    let records = decode_answer(&TextCodec, "www.example.p2p", &answer);
    assert_eq!(records, vec!["203.0.113.7".to_string()]);

    honest.shutdown().await;
    hostile.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn forged_answers_lose_even_with_higher_trust() {
    let keypair = Keypair::generate();
    let forger = Keypair::generate();

    let key = Identifier::hash(b"bank.p2p.key");
    let expected_hash = keypair.public_key_hash();

    // The heavily-trusted peer serves a forgery; the lightly-trusted one is
    // genuine. Authenticity screens before trust ranks.
    let trusted_but_forging = bind_node().await;
    let genuine = bind_node().await;
    let consumer = bind_node().await;

    trusted_but_forging.put(key, sign_record(&forger, b"198.51.100.1"));
    genuine.put(key, sign_record(&keypair, b"203.0.113.99"));

    consumer.add_peer(Contact::trusted(
        trusted_but_forging.identifier(),
        trusted_but_forging.local_addr(),
        0.95,
    ));
    consumer.add_peer(Contact::trusted(
        genuine.identifier(),
        genuine.local_addr(),
        0.1,
    ));

    let entries = consumer.get(key).await;
    let answer = resolve_trusted(&expected_hash, &entries).expect("no trusted answer");

    assert_eq!(answer.owner.identifier, genuine.identifier());
    assert_eq!(answer.values, vec![b"203.0.113.99".to_vec()]);

    trusted_but_forging.shutdown().await;
    genuine.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn one_publisher_can_serve_several_records_per_name() {
    let keypair = Keypair::generate();
    let key = Identifier::hash(b"mx.example.p2p.key");
    let expected_hash = keypair.public_key_hash();

    let publisher = bind_node().await;
    let consumer = bind_node().await;

    // Several address records under one name, all from the same publisher.
    publisher.put(key, sign_record(&keypair, b"mx1.example.p2p"));
    publisher.put(key, sign_record(&keypair, b"mx2.example.p2p"));

    consumer.add_peer(Contact::trusted(
        publisher.identifier(),
        publisher.local_addr(),
        0.7,
    ));

    let entries = consumer.get(key).await;
    let answer = resolve_trusted(&expected_hash, &entries).expect("no trusted answer");

    let mut values = answer.values.clone();
    values.sort();
    assert_eq!(values, vec![b"mx1.example.p2p".to_vec(), b"mx2.example.p2p".to_vec()]);

    publisher.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn envelope_survives_the_wire_intact() {
    let keypair = Keypair::generate();
    let key = Identifier::hash(b"intact.p2p.key");

    let publisher = bind_node().await;
    let consumer = bind_node().await;

    let envelope = sign_record(&keypair, b"payload");
    publisher.put(key, envelope.clone());
    consumer.add_peer(Contact::new(publisher.identifier(), publisher.local_addr()));

    let entries = consumer.get(key).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].value, envelope);

    // The transported envelope still verifies byte-for-byte.
    assert_eq!(
        verify_record(&keypair.public_key_hash(), &entries[0].value).as_deref(),
        Some(&b"payload"[..])
    );

    publisher.shutdown().await;
    consumer.shutdown().await;
}
