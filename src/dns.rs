//! DNS message inspection and construction.
//!
//! Thin helpers over `hickory_proto::op::Message` used by the cache, the
//! group dispatcher, the redirectors and the handler.

use std::net::IpAddr;

use hickory_proto::op::{Edns, Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::{RData, Record, RecordType};
use ipnet::IpNet;

/// EDNS payload size advertised when we have to add an OPT record ourselves.
const EDNS_PAYLOAD: u16 = 1232;

/// First question of a message, if any.
pub fn question(message: &Message) -> Option<&Query> {
    message.queries().first()
}

/// Canonical form of a question name: lowercase with a trailing dot.
pub fn qname(query: &Query) -> String {
    canonical(&query.name().to_ascii())
}

/// Lowercase `domain` and make sure it ends with a dot.
pub fn canonical(domain: &str) -> String {
    let mut name = domain.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// Returns true for A and AAAA.
pub fn is_address_type(rtype: RecordType) -> bool {
    matches!(rtype, RecordType::A | RecordType::AAAA)
}

/// Cache key for a query: name, type and the client subnet if one was sent.
pub fn fingerprint(message: &Message) -> Option<String> {
    let query = question(message)?;
    let mut key = format!("{}|{}", qname(query), query.query_type());
    if let Some((addr, prefix)) = client_subnet(message) {
        key.push_str(&format!("|{addr}/{prefix}"));
    }
    Some(key)
}

/// Client subnet (address, source prefix) carried in the EDNS options.
pub fn client_subnet(message: &Message) -> Option<(IpAddr, u8)> {
    let edns = message.extensions().as_ref()?;
    match edns.options().get(EdnsCode::Subnet)? {
        EdnsOption::Subnet(subnet) => decode_subnet(&Vec::<u8>::try_from(subnet).ok()?),
        _ => None,
    }
}

/// Decode the option payload: family, source prefix, scope prefix, then the
/// address truncated to the source prefix.
fn decode_subnet(bytes: &[u8]) -> Option<(IpAddr, u8)> {
    let (header, addr) = bytes.split_at_checked(4)?;
    let family = u16::from_be_bytes([header[0], header[1]]);
    let prefix = header[2];
    match family {
        1 => {
            let mut octets = [0u8; 4];
            octets.get_mut(..addr.len())?.copy_from_slice(addr);
            Some((IpAddr::from(octets), prefix))
        }
        2 => {
            let mut octets = [0u8; 16];
            octets.get_mut(..addr.len())?.copy_from_slice(addr);
            Some((IpAddr::from(octets), prefix))
        }
        _ => None,
    }
}

/// Address carried by an A or AAAA record.
pub fn record_ip(record: &Record) -> Option<IpAddr> {
    match record.data()? {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

/// All A/AAAA answer addresses in answer order.
pub fn answer_ips(message: &Message) -> Vec<IpAddr> {
    message.answers().iter().filter_map(record_ip).collect()
}

/// Build an answer-less response to `query`.
///
/// Echoes the ID, opcode, RD flag and question section so the client always
/// receives a well-formed reply.
pub fn empty_reply(query: &Message, code: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code);
    for q in query.queries() {
        reply.add_query(q.clone());
    }
    reply
}

/// Stamp a stored or upstream reply with the header of the client's query.
pub fn finalize(reply: &mut Message, query: &Message) {
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_recursion_desired(query.recursion_desired());
}

/// Rewrite the TTL of every answer record.
pub fn set_answer_ttl(message: &mut Message, ttl: u32) {
    let mut answers = message.take_answers();
    for record in &mut answers {
        record.set_ttl(ttl);
    }
    message.insert_answers(answers);
}

/// Smallest TTL across the answer section.
pub fn min_answer_ttl(message: &Message) -> Option<u32> {
    message.answers().iter().map(Record::ttl).min()
}

/// Remove the EDNS cookie option. Returns true if one was present.
pub fn strip_cookie(message: &mut Message) -> bool {
    let Some(edns) = message.extensions_mut().as_mut() else {
        return false;
    };
    if edns.options().get(EdnsCode::Cookie).is_none() {
        return false;
    }
    edns.options_mut().remove(EdnsCode::Cookie);
    true
}

/// Attach `subnet` as the client-subnet option unless the query already
/// carries one.
pub fn ensure_client_subnet(message: &mut Message, subnet: IpNet) {
    if client_subnet(message).is_some() {
        return;
    }
    let edns = message.extensions_mut().get_or_insert_with(|| {
        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_PAYLOAD);
        edns
    });
    edns.options_mut().insert(EdnsOption::Subnet(ClientSubnet::new(
        subnet.network(),
        subnet.prefix_len(),
        0,
    )));
}

/// Drop every address record except the ones pointing at `ip`.
///
/// Non-address records (CNAME chains and the like) are kept in place.
pub fn keep_single_address(message: &mut Message, ip: IpAddr) {
    let answers = message
        .take_answers()
        .into_iter()
        .filter(|record| record_ip(record).is_none_or(|addr| addr == ip))
        .collect();
    message.insert_answers(answers);
}
