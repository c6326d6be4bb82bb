//! Outbound event envelope encoding, reusing [`oms_outbox::CloudEvent`]'s
//! CloudEvents v1.0 wire shape.

use oms_outbox::CloudEvent;

/// Encode an envelope to its CloudEvents JSON wire shape.
pub fn encode(envelope: &CloudEvent) -> serde_json::Value {
    envelope.to_json()
}

/// Decode a CloudEvents JSON wire value back into a typed envelope.
pub fn decode(value: &serde_json::Value) -> Result<CloudEvent, String> {
    CloudEvent::from_json(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oms_outbox::Event;

    #[test]
    fn encode_then_decode_round_trips() {
        let event = Event::BranchCreated(oms_outbox::event::BranchCreatedData {
            branch: oms_core::BranchName::new("main").unwrap(),
            parent: None,
            commit_hash: oms_core::CommitHash::compute(b"c"),
            author: "alice".into(),
        });
        let envelope = CloudEvent::new("oms/api", event);
        let json = encode(&envelope);
        let decoded = decode(&json).unwrap();
        assert_eq!(decoded, envelope);
    }
}
