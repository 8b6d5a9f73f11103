//! Incremental codec for the communicator's XML element stream
//!
//! The communicator does not send a document. It writes one top-level XML
//! element per message, with no declaration and no common root, so a normal
//! XML reader cannot be pointed at the socket directly. `WireCodec` frames
//! the byte stream into complete top-level elements and hands each one to
//! `quick_xml` for parsing.
//!
//! ## Framing
//!
//! ```text
//!  feed(bytes) --> [ buffer ] --scan--> complete top-level element --quick_xml--> ElementClosed*
//!                      ^                      |
//!                      +---- incomplete ------+   (kept, not an error)
//! ```
//!
//! Once a top-level element has been decoded its bytes are skipped and
//! scanning starts over at the next byte. Consumed bytes are compacted away
//! once the buffer runs out of complete elements. Only an unterminated
//! element larger than `MAX_BUFFERED` is discarded. Nested elements are reported in
//! closing order, followed by their parent. Because events are only produced
//! for complete top-level elements, the event sequence does not depend on how
//! the input was chunked.

use std::collections::VecDeque;

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::{trace, warn};

use super::error::CodecError;
use super::types::{ElementClosed, Request};

/// Upper bound for an element that is still waiting for its end
const MAX_BUFFERED: usize = 1024 * 1024;

/// Result of scanning the front of the buffer
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// More bytes are needed
    Incomplete,
    /// Markup that carries no message (declaration, comment); drop n bytes
    Skip(usize),
    /// A complete top-level element spans the first n bytes
    Element(usize),
}

/// Encoder/decoder for the communicator wire format
#[derive(Debug, Default)]
pub struct WireCodec {
    buffer: Vec<u8>,
    /// Bytes at the front of `buffer` that have already been decoded
    consumed: usize,
    pending: VecDeque<ElementClosed>,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize a request as a single XML element followed by a newline
    pub fn encode(request: Request) -> Result<Vec<u8>, CodecError> {
        let mut element = BytesStart::new(request.tag());
        for (key, value) in request.attributes() {
            element.push_attribute((*key, *value));
        }

        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Empty(element))?;

        let mut bytes = writer.into_inner();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Append received bytes to the decode buffer
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Iterate over every element closed since the last call
    ///
    /// The iterator is lazy: elements are framed and parsed as it is
    /// advanced. Events not consumed before the iterator is dropped are kept
    /// and returned by the next call.
    pub fn read_events(&mut self) -> ReadEvents<'_> {
        ReadEvents { codec: self }
    }

    /// Drop all buffered input and undelivered events
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.consumed = 0;
        self.pending.clear();
    }

    /// Number of bytes not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    fn compact(&mut self) {
        self.buffer.drain(..self.consumed);
        self.consumed = 0;
    }

    /// Frame and decode the next complete top-level element
    ///
    /// Returns `false` when the buffer holds no complete element.
    fn decode_next(&mut self) -> bool {
        loop {
            let rest = &self.buffer[self.consumed..];
            let start = rest
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .unwrap_or(rest.len());
            self.consumed += start;
            if self.consumed == self.buffer.len() {
                self.compact();
                return false;
            }

            let rest = &self.buffer[self.consumed..];
            if rest[0] != b'<' {
                let junk = rest.iter().position(|b| *b == b'<').unwrap_or(rest.len());
                trace!(bytes = junk, "Skipping text outside of any element");
                self.consumed += junk;
                continue;
            }

            match scan(rest) {
                Scan::Incomplete => {
                    self.compact();
                    if self.buffer.len() > MAX_BUFFERED {
                        warn!(
                            buffered = self.buffer.len(),
                            "Discarding oversized unterminated input from communicator"
                        );
                        self.buffer.clear();
                    }
                    return false;
                }
                Scan::Skip(len) => {
                    trace!(bytes = len, "Skipping non-element markup");
                    self.consumed += len;
                }
                Scan::Element(len) => {
                    let frame = &rest[..len];
                    let decoded = decode_element(frame);
                    if let Err(e) = &decoded {
                        warn!(
                            error = %e,
                            element = %String::from_utf8_lossy(frame),
                            "Dropping malformed element from communicator"
                        );
                    }
                    self.consumed += len;

                    if let Ok(events) = decoded {
                        self.pending.extend(events);
                        return true;
                    }
                }
            }
        }
    }
}

/// Lazy sequence of decoded elements, see [`WireCodec::read_events`]
pub struct ReadEvents<'a> {
    codec: &'a mut WireCodec,
}

impl Iterator for ReadEvents<'_> {
    type Item = ElementClosed;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.codec.pending.pop_front() {
                return Some(event);
            }
            if !self.codec.decode_next() {
                return None;
            }
        }
    }
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| from + pos)
}

/// Find the `>` closing the tag that starts at `from`, honouring quotes
fn tag_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (offset, byte) in buf.get(from..)?.iter().enumerate() {
        match (quote, *byte) {
            (Some(q), b) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"') | (None, b'\'') => quote = Some(*byte),
            (None, b'>') => return Some(from + offset),
            (None, _) => {}
        }
    }
    None
}

/// End (exclusive) of a `<!...>` or `<?...?>` construct starting at `pos`
fn special_end(buf: &[u8], pos: usize) -> Option<usize> {
    let rest = &buf[pos..];
    if rest.starts_with(b"<?") {
        return find(buf, pos + 2, b"?>").map(|end| end + 2);
    }
    if rest.starts_with(b"<!--") {
        return find(buf, pos + 4, b"-->").map(|end| end + 3);
    }
    if rest.starts_with(b"<![CDATA[") {
        return find(buf, pos + 9, b"]]>").map(|end| end + 3);
    }
    // Too short to tell a comment or CDATA section from other `<!` markup
    if b"<!--".starts_with(rest) || b"<![CDATA[".starts_with(rest) {
        return None;
    }
    tag_end(buf, pos).map(|end| end + 1)
}

/// Scan the buffer (which starts with `<`) for one complete top-level item
fn scan(buf: &[u8]) -> Scan {
    if buf.len() < 2 {
        return Scan::Incomplete;
    }
    if matches!(buf[1], b'?' | b'!') {
        return match special_end(buf, 0) {
            Some(end) => Scan::Skip(end),
            None => Scan::Incomplete,
        };
    }

    let mut depth: usize = 0;
    let mut pos = 0;

    loop {
        // `pos` is at a `<`
        let Some(&next) = buf.get(pos + 1) else {
            return Scan::Incomplete;
        };

        match next {
            b'/' => {
                let Some(end) = tag_end(buf, pos) else {
                    return Scan::Incomplete;
                };
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Scan::Element(end + 1);
                }
                pos = end + 1;
            }
            b'!' | b'?' => {
                let Some(end) = special_end(buf, pos) else {
                    return Scan::Incomplete;
                };
                pos = end;
            }
            _ => {
                let Some(end) = tag_end(buf, pos) else {
                    return Scan::Incomplete;
                };
                let self_closing = end > pos + 1 && buf[end - 1] == b'/';
                if self_closing {
                    if depth == 0 {
                        return Scan::Element(end + 1);
                    }
                } else {
                    depth += 1;
                }
                pos = end + 1;
            }
        }

        // Character data up to the next tag
        match buf.get(pos..).and_then(|rest| rest.iter().position(|b| *b == b'<')) {
            Some(offset) => pos += offset,
            None => return Scan::Incomplete,
        }
    }
}

fn open_element(start: &BytesStart<'_>) -> Result<ElementClosed, CodecError> {
    let tag = std::str::from_utf8(start.name().as_ref())?.to_string();

    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute?;
        let key = std::str::from_utf8(attribute.key.as_ref())?.to_string();
        let value = attribute.unescape_value()?.into_owned();
        attributes.push((key, value));
    }

    Ok(ElementClosed {
        tag,
        attributes,
        text: String::new(),
    })
}

/// Parse one complete top-level element into closing events
fn decode_element(frame: &[u8]) -> Result<Vec<ElementClosed>, CodecError> {
    let text = std::str::from_utf8(frame)?;
    let mut reader = Reader::from_str(text);

    let mut open: Vec<ElementClosed> = Vec::new();
    let mut closed = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) => open.push(open_element(&start)?),
            Event::Empty(start) => closed.push(open_element(&start)?),
            Event::End(_) => {
                let mut element = open.pop().ok_or(CodecError::Truncated)?;
                element.text = element.text.trim().to_string();
                closed.push(element);
            }
            Event::Text(content) => {
                if let Some(element) = open.last_mut() {
                    element.text.push_str(&content.unescape()?);
                }
            }
            Event::CData(content) => {
                if let Some(element) = open.last_mut() {
                    element.text.push_str(std::str::from_utf8(&content)?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !open.is_empty() {
        return Err(CodecError::Truncated);
    }

    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut WireCodec, input: &[u8]) -> Vec<ElementClosed> {
        codec.feed(input);
        codec.read_events().collect()
    }

    fn tags(events: &[ElementClosed]) -> Vec<&str> {
        events.iter().map(|e| e.tag.as_str()).collect()
    }

    const SESSION: &[u8] = b"<status code=\"300\">Register first</status>\n\
        <status code=\"220\">Welcome</status>\n\
        <anlageninfo aid=\"42\" name=\"Hagen Hbf\" region=\"S\xc3\xbcd &amp; West\" online=\"true\" simbuild=\"1\"/>\n\
        <simzeit sender=\"123456\" zeit=\"5400000\"/>\n";

    #[test]
    fn test_encode_register() {
        let bytes = WireCodec::encode(Request::Register).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("<register name=\""));
        assert!(text.contains("protokoll=\"1\""));
        assert!(text.contains("version=\"1.0.0\""));
        assert!(text.ends_with("/>\n"));
    }

    #[test]
    fn test_encode_queries() {
        assert_eq!(
            WireCodec::encode(Request::StatusInfo).unwrap(),
            b"<anlageninfo/>\n".to_vec()
        );
        assert_eq!(
            WireCodec::encode(Request::SimClock).unwrap(),
            b"<simzeit sender=\"123456\"/>\n".to_vec()
        );
    }

    #[test]
    fn test_decode_status_with_text() {
        let mut codec = WireCodec::new();
        let events = decode_all(&mut codec, b"<status code=\"300\"> Bitte registrieren </status>\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag, "status");
        assert_eq!(events[0].attribute("code"), Some("300"));
        assert_eq!(events[0].text, "Bitte registrieren");
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_decode_unescapes_attributes() {
        let mut codec = WireCodec::new();
        let events = decode_all(&mut codec, SESSION);

        assert_eq!(tags(&events), vec!["status", "status", "anlageninfo", "simzeit"]);
        assert_eq!(events[2].attribute("region"), Some("Süd & West"));
        assert_eq!(events[3].attribute("zeit"), Some("5400000"));
    }

    #[test]
    fn test_byte_by_byte_matches_whole_feed() {
        let mut whole = WireCodec::new();
        let expected = decode_all(&mut whole, SESSION);

        let mut chunked = WireCodec::new();
        let mut actual = Vec::new();
        for byte in SESSION {
            chunked.feed(std::slice::from_ref(byte));
            actual.extend(chunked.read_events());
        }

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_arbitrary_chunk_sizes_match_whole_feed() {
        let mut whole = WireCodec::new();
        let expected = decode_all(&mut whole, SESSION);

        for chunk_size in [2, 3, 5, 7, 13, 64] {
            let mut codec = WireCodec::new();
            let mut actual = Vec::new();
            for chunk in SESSION.chunks(chunk_size) {
                codec.feed(chunk);
                actual.extend(codec.read_events());
            }
            assert_eq!(actual, expected, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_partial_element_is_buffered() {
        let mut codec = WireCodec::new();

        assert!(decode_all(&mut codec, b"<simzeit sender=\"123456\" ze").is_empty());
        assert!(codec.buffered() > 0);

        let events = decode_all(&mut codec, b"it=\"60000\"/>");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attribute("zeit"), Some("60000"));
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_quoted_angle_bracket_does_not_end_tag() {
        let mut codec = WireCodec::new();

        assert!(decode_all(&mut codec, b"<anlageninfo name=\"a>b").is_empty());
        let events = decode_all(&mut codec, b"\" region=\"x\" online=\"false\"/>");
        assert_eq!(events[0].attribute("name"), Some("a>b"));
    }

    #[test]
    fn test_nested_elements_close_inner_first() {
        let mut codec = WireCodec::new();
        let events = decode_all(
            &mut codec,
            b"<bahnsteigliste><bahnsteig name=\"1\"/><bahnsteig name=\"2\">x</bahnsteig></bahnsteigliste>",
        );

        assert_eq!(tags(&events), vec!["bahnsteig", "bahnsteig", "bahnsteigliste"]);
        assert_eq!(events[1].text, "x");
    }

    #[test]
    fn test_malformed_element_is_dropped() {
        let mut codec = WireCodec::new();
        let events = decode_all(
            &mut codec,
            b"<status code=\"300\">oops</statuz>\n<simzeit zeit=\"0\"/>\n",
        );

        assert_eq!(tags(&events), vec!["simzeit"]);
    }

    #[test]
    fn test_declaration_comment_and_junk_are_skipped() {
        let mut codec = WireCodec::new();
        let events = decode_all(
            &mut codec,
            b"<?xml version=\"1.0\"?>\n<!-- hello -->garbage<status code=\"220\"/>",
        );

        assert_eq!(tags(&events), vec!["status"]);
    }

    #[test]
    fn test_split_comment_opener_waits_for_more() {
        let mut codec = WireCodec::new();

        assert!(decode_all(&mut codec, b"<!-").is_empty());
        let events = decode_all(&mut codec, b"- a > b --><simzeit zeit=\"1\"/>");
        assert_eq!(tags(&events), vec!["simzeit"]);
    }

    #[test]
    fn test_undelivered_events_survive_dropped_iterator() {
        let mut codec = WireCodec::new();
        codec.feed(b"<a><b/></a><c/>");

        let first = codec.read_events().next().unwrap();
        assert_eq!(first.tag, "b");

        let rest: Vec<ElementClosed> = codec.read_events().collect();
        assert_eq!(tags(&rest), vec!["a", "c"]);
    }

    #[test]
    fn test_large_single_feed_matches_chunked_feed() {
        let element = b"<simzeit zeit=\"60000\"/>\n";
        let copies = MAX_BUFFERED / element.len() + 1;
        let input = element.repeat(copies);
        assert!(input.len() > MAX_BUFFERED);

        let mut whole = WireCodec::new();
        let whole_count = decode_all(&mut whole, &input).len();

        let mut chunked = WireCodec::new();
        let mut chunked_count = 0;
        for chunk in input.chunks(4096) {
            chunked.feed(chunk);
            chunked_count += chunked.read_events().count();
        }

        assert_eq!(whole_count, copies);
        assert_eq!(chunked_count, copies);
        assert_eq!(whole.buffered(), 0);
    }

    #[test]
    fn test_oversized_unterminated_element_is_discarded() {
        let mut codec = WireCodec::new();
        let mut input = b"<simzeit zeit=\"1\"/>\n<status code=\"300\">".to_vec();
        input.resize(input.len() + MAX_BUFFERED, b'x');

        let events = decode_all(&mut codec, &input);
        assert_eq!(tags(&events), vec!["simzeit"]);
        assert_eq!(codec.buffered(), 0);

        // The stream picks up again at the next element
        let events = decode_all(&mut codec, b"<simzeit zeit=\"2\"/>");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attribute("zeit"), Some("2"));
    }

    #[test]
    fn test_reset_discards_partial_input() {
        let mut codec = WireCodec::new();
        codec.feed(b"<status code=\"3");
        codec.reset();

        let events = decode_all(&mut codec, b"<status code=\"220\"/>");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attribute("code"), Some("220"));
    }
}
