//! Captive DNS replies
//!
//! Every standard query is answered with one A record pointing at the portal,
//! so whatever name a phone probes lands on the provisioning form.

/// DNS header length
const HEADER_LEN: usize = 12;
/// Name pointer, type, class, TTL, rdlength, address
const ANSWER_LEN: usize = 16;

/// Build the reply to `query` in `out`
///
/// Returns the reply length, or `None` for responses, non-standard opcodes,
/// malformed packets and buffers too small for the reply.
pub fn captive_reply(query: &[u8], ip: [u8; 4], ttl: u32, out: &mut [u8]) -> Option<usize> {
    if query.len() < HEADER_LEN {
        return None;
    }

    // QR set means this is a response
    if query[2] & 0x80 != 0 {
        return None;
    }
    let opcode = (query[2] >> 3) & 0x0f;
    if opcode != 0 {
        return None;
    }
    let questions = u16::from_be_bytes([query[4], query[5]]);
    if questions == 0 {
        return None;
    }

    let question_end = question_end(query)?;
    let question = &query[HEADER_LEN..question_end];
    let total = HEADER_LEN + question.len() + ANSWER_LEN;
    if out.len() < total {
        return None;
    }

    // Header: same id, authoritative response, RD echoed, one question, one answer
    out[0] = query[0];
    out[1] = query[1];
    out[2] = 0x84 | (query[2] & 0x01);
    out[3] = 0x00;
    out[4..6].copy_from_slice(&1u16.to_be_bytes());
    out[6..8].copy_from_slice(&1u16.to_be_bytes());
    out[8..12].fill(0);

    out[HEADER_LEN..HEADER_LEN + question.len()].copy_from_slice(question);

    let answer = &mut out[HEADER_LEN + question.len()..total];
    answer[0] = 0xC0;
    answer[1] = HEADER_LEN as u8; // pointer to the question name
    answer[2..4].copy_from_slice(&1u16.to_be_bytes()); // Type: A
    answer[4..6].copy_from_slice(&1u16.to_be_bytes()); // Class: IN
    answer[6..10].copy_from_slice(&ttl.to_be_bytes());
    answer[10..12].copy_from_slice(&4u16.to_be_bytes());
    answer[12..16].copy_from_slice(&ip);

    Some(total)
}

/// Offset just past the first question (name, type, class)
fn question_end(packet: &[u8]) -> Option<usize> {
    let mut offset = HEADER_LEN;
    loop {
        let len = *packet.get(offset)? as usize;
        // Compression pointers are not valid in the question of a query
        if len & 0xC0 != 0 {
            return None;
        }
        offset += 1;
        if len == 0 {
            break;
        }
        offset += len;
    }

    let end = offset + 4;
    (end <= packet.len()).then_some(end)
}

/// Extract the dotted name of the first question, for logging
pub fn query_name(packet: &[u8]) -> Option<heapless::String<64>> {
    question_end(packet)?;
    let mut name = heapless::String::new();
    let mut offset = HEADER_LEN;
    loop {
        let len = packet[offset] as usize;
        offset += 1;
        if len == 0 {
            break;
        }
        if !name.is_empty() {
            name.push('.').ok()?;
        }
        let label = core::str::from_utf8(&packet[offset..offset + len]).ok()?;
        name.push_str(label).ok()?;
        offset += len;
    }
    Some(name)
}
