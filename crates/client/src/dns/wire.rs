//! DNS message construction and parsing.
//!
//! Uses `hickory-proto` for the wire format; only A/AAAA lookups are needed.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};

use super::ResolveError;

/// A fresh query id. `RandomState` is randomly keyed per instance.
fn next_query_id() -> u16 {
    RandomState::new().build_hasher().finish() as u16
}

/// Encode a recursive query for `host`. Returns the query id and the bytes.
pub fn build_query(host: &str, record_type: RecordType) -> Result<(u16, Vec<u8>), ResolveError> {
    let mut name = Name::from_ascii(host).map_err(|e| ResolveError::Protocol(format!("invalid name {host}: {e}")))?;
    name.set_fqdn(true);

    let id = next_query_id();
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));

    let bytes = message.to_vec().map_err(|e| ResolveError::Protocol(e.to_string()))?;
    Ok((id, bytes))
}

/// Decode a reply and collect its A and AAAA answers in order.
///
/// Fails if the id does not match `expected_id` or the server reported an
/// error. An empty answer section is not an error here.
pub fn parse_reply(bytes: &[u8], expected_id: u16) -> Result<Vec<IpAddr>, ResolveError> {
    let reply = Message::from_vec(bytes).map_err(|e| ResolveError::Protocol(e.to_string()))?;

    if reply.id() != expected_id {
        return Err(ResolveError::Protocol(format!("reply id {} does not match query id {expected_id}", reply.id())));
    }
    if reply.message_type() != MessageType::Response {
        return Err(ResolveError::Protocol("message is not a response".into()));
    }

    match reply.response_code() {
        ResponseCode::NoError | ResponseCode::NXDomain => {}
        code => return Err(ResolveError::Protocol(format!("server returned {code}"))),
    }

    let ips = reply
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect();
    Ok(ips)
}

/// Test helper: answer `query` with the given addresses.
#[cfg(test)]
pub(crate) fn answer(query: &[u8], ips: &[IpAddr]) -> Vec<u8> {
    use hickory_proto::rr::Record;
    use hickory_proto::rr::rdata::{A, AAAA};

    let request = Message::from_vec(query).unwrap();
    let question = request.queries()[0].clone();
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_recursion_available(true)
        .add_query(question.clone());

    for ip in ips {
        let rdata = match (ip, question.query_type()) {
            (IpAddr::V4(v4), RecordType::A) => RData::A(A(*v4)),
            (IpAddr::V6(v6), RecordType::AAAA) => RData::AAAA(AAAA(*v6)),
            _ => continue,
        };
        reply.add_answer(Record::from_rdata(question.name().clone(), 60, rdata));
    }
    reply.to_vec().unwrap()
}
