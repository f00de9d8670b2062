//! Broker payloads
//!
//! The node publishes its identity as JSON and the broker answers on the
//! correlation topic with `success=true;type1=id1;type2=id2;...`.

use crate::BoardError;
use crate::records::{SensorCredentials, UserEntry};
use alloc::string::String;
use log::debug;
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest<'a> {
    id: &'a str,
    name: &'a str,
    password: &'a str,
    serial_code: &'a str,
    cpf: &'a str,
}

/// JSON body published to the sync topic
pub fn sync_request_json(entry: &UserEntry) -> Result<String, BoardError> {
    let request = SyncRequest {
        id: &entry.id,
        name: &entry.name,
        password: &entry.password,
        serial_code: &entry.serial_code,
        cpf: &entry.cpf,
    };
    serde_json::to_string(&request).map_err(|_| BoardError::InvalidPayload)
}

/// Parse the broker response into a credential set
///
/// `Empty` is returned for a valid response that binds no sensor.
pub fn parse_response(payload: &str) -> Result<SensorCredentials, BoardError> {
    if payload.is_empty() {
        return Err(BoardError::StructuralParseError);
    }

    let mut segments = payload.split(';');
    let head = segments.next().unwrap_or_default();
    let success = match head.split_once('=') {
        Some(("success", flag)) => flag,
        _ => return Err(BoardError::StructuralParseError),
    };
    if success != "true" {
        return Err(BoardError::InvalidPayload);
    }

    let mut credentials = SensorCredentials::new();
    for segment in segments {
        match segment.split_once('=') {
            Some((kind, id)) if !kind.is_empty() => credentials.insert(kind, id),
            _ => debug!("[BROKER] Skipping segment {:?}", segment),
        }
    }

    if credentials.is_empty() {
        return Err(BoardError::Empty);
    }
    Ok(credentials)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_with_pairs() {
        let set = parse_response("success=true;humidity=abc;ph=def").unwrap();
        let pairs: alloc::vec::Vec<(&str, &str)> = set
            .iter()
            .map(|e| (e.kind.as_str(), e.id.as_str()))
            .collect();
        assert_eq!(pairs, [("humidity", "abc"), ("ph", "def")]);
    }

    #[test]
    fn success_flag_must_be_exactly_true() {
        assert_eq!(
            parse_response("success=false;humidity=abc"),
            Err(BoardError::InvalidPayload)
        );
        assert_eq!(
            parse_response("success=TRUE;humidity=abc"),
            Err(BoardError::InvalidPayload)
        );
    }

    #[test]
    fn empty_or_headless_payload_is_structural() {
        assert_eq!(parse_response(""), Err(BoardError::StructuralParseError));
        assert_eq!(
            parse_response("garbage"),
            Err(BoardError::StructuralParseError)
        );
    }

    #[test]
    fn first_pair_must_be_the_success_flag() {
        assert_eq!(
            parse_response("ok=true;ph=1"),
            Err(BoardError::StructuralParseError)
        );
        assert_eq!(
            parse_response("ph=1;success=true"),
            Err(BoardError::StructuralParseError)
        );
    }

    #[test]
    fn no_pairs_is_empty_not_an_error_of_shape() {
        assert_eq!(parse_response("success=true"), Err(BoardError::Empty));
        assert_eq!(parse_response("success=true;"), Err(BoardError::Empty));
    }

    #[test]
    fn malformed_segments_are_skipped() {
        let set = parse_response("success=true;noequals;=orphan;ph=def").unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("ph"), Some("def"));
    }

    #[test]
    fn value_keeps_everything_after_the_first_equals() {
        let set = parse_response("success=true;token=a=b").unwrap();
        assert_eq!(set.get("token"), Some("a=b"));
    }

    #[test]
    fn request_uses_wire_field_names() {
        let entry = UserEntry::new("ana", "pw", "SN-42", "123").with_id("tok");
        assert_eq!(
            sync_request_json(&entry).unwrap(),
            r#"{"id":"tok","name":"ana","password":"pw","serialCode":"SN-42","cpf":"123"}"#
        );
    }
}
