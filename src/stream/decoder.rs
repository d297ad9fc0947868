//! Incremental decoder for line-delimited JSON with truncation recovery.
//!
//! The assistant process sometimes splits one message over several physical
//! lines once it grows past an internal size threshold. The decoder keeps a
//! candidate buffer of fragments that ended early and re-parses after every
//! new line. Fragments are joined as raw bytes without a separator because the
//! break can land anywhere, including inside a string literal or a multibyte
//! character.

use serde_json::Value;

use super::event::{EventKind, MalformedEvent, StreamEvent};
use crate::error::StreamError;

/// Default cap on a buffered candidate (1 MiB).
pub const DEFAULT_BUFFER_LIMIT: usize = 1024 * 1024;

/// Outcome of parsing one candidate.
enum Parse {
    Complete(Value),
    /// Valid so far, ended early.
    Incomplete(serde_json::Error),
    /// Can never become valid by appending more text.
    Invalid(serde_json::Error),
}

fn parse(bytes: &[u8]) -> Parse {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => Parse::Complete(value),
        Err(e) if e.is_eof() => Parse::Incomplete(e),
        Err(e) => {
            // Stray invalid UTF-8 in an otherwise complete line is replaced
            // rather than failing the whole message.
            if std::str::from_utf8(bytes).is_err()
                && let Ok(value) = serde_json::from_str::<Value>(&String::from_utf8_lossy(bytes))
            {
                return Parse::Complete(value);
            }
            Parse::Invalid(e)
        }
    }
}

fn is_tagged_message(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str).is_some()
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Turns raw bytes from the assistant's stdout into ordered `StreamEvent`s.
#[derive(Debug)]
pub struct StreamDecoder {
    limit: usize,
    /// Bytes after the last newline seen, never more than `limit + 1`.
    partial_line: Vec<u8>,
    /// Set after an overlong line was reported; bytes are dropped until the
    /// next newline.
    discarding: bool,
    /// Fragments of a message that ended early.
    pending: Vec<u8>,
    next_seq: u64,
    saw_result: bool,
    malformed: usize,
}

impl StreamDecoder {
    /// Create a decoder that gives up on a candidate once it exceeds `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            partial_line: Vec::new(),
            discarding: false,
            pending: Vec::new(),
            next_seq: 0,
            saw_result: false,
            malformed: 0,
        }
    }

    /// Feed an arbitrary chunk of bytes and drain the events it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            let newline = rest.iter().position(|b| *b == b'\n');
            let (segment, next) = match newline {
                Some(idx) => (&rest[..idx], &rest[idx + 1..]),
                None => (rest, &rest[rest.len()..]),
            };
            rest = next;

            if self.discarding {
                if newline.is_some() {
                    self.discarding = false;
                }
                continue;
            }

            let room = (self.limit + 1).saturating_sub(self.partial_line.len());
            self.partial_line
                .extend_from_slice(&segment[..segment.len().min(room)]);

            if newline.is_some() && segment.len() <= room {
                let line = std::mem::take(&mut self.partial_line);
                self.decode_line(&line, &mut out);
            } else if self.partial_line.len() > self.limit {
                self.drop_overlong_line(&mut out);
                self.discarding = newline.is_none();
            }
        }

        out
    }

    /// Flush everything still buffered at end of input.
    ///
    /// A trailing unterminated line is decoded normally; a candidate that is
    /// still incomplete becomes a single malformed event.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.discarding = false;
        if !self.partial_line.is_empty() {
            let line = std::mem::take(&mut self.partial_line);
            self.decode_line(&line, &mut out);
        }
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            self.push_malformed(&raw, "stream ended mid-message".to_string(), &mut out);
        }
        out
    }

    /// `Ok` once a well-formed result event has been decoded.
    pub fn completion(&self) -> Result<(), StreamError> {
        if self.saw_result {
            Ok(())
        } else {
            Err(StreamError::Incomplete {
                events: self.next_seq,
            })
        }
    }

    pub fn saw_result(&self) -> bool {
        self.saw_result
    }

    /// Number of malformed events emitted so far.
    pub fn malformed_count(&self) -> usize {
        self.malformed
    }

    /// Bytes currently held, partial line and candidate together.
    pub fn buffered_len(&self) -> usize {
        self.partial_line.len() + self.pending.len()
    }

    /// Report the line being accumulated, together with any candidate it
    /// would have completed, as one malformed event.
    fn drop_overlong_line(&mut self, out: &mut Vec<StreamEvent>) {
        let mut raw = std::mem::take(&mut self.pending);
        raw.append(&mut self.partial_line);
        tracing::debug!(limit = self.limit, "Dropping overlong line");
        let reason = format!("line exceeded {} bytes", self.limit);
        self.push_malformed(&raw, reason, out);
    }

    fn decode_line(&mut self, line: &[u8], out: &mut Vec<StreamEvent>) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if is_blank(line) {
            return;
        }

        if self.pending.is_empty() {
            match parse(line) {
                Parse::Complete(value) => self.push_value(value, out),
                Parse::Incomplete(e) if line.len() <= self.limit => {
                    tracing::debug!(bytes = line.len(), "Buffering partial message: {}", e);
                    self.pending.extend_from_slice(line);
                }
                Parse::Incomplete(e) | Parse::Invalid(e) => {
                    self.push_malformed(line, e.to_string(), out);
                }
            }
            return;
        }

        let fragment_len = self.pending.len();
        let mut candidate = std::mem::take(&mut self.pending);
        candidate.extend_from_slice(line);

        match parse(&candidate) {
            Parse::Complete(value) => self.push_value(value, out),
            Parse::Invalid(e) => {
                // The buffered fragment can't be completed; retry the new line on its own.
                candidate.truncate(fragment_len);
                self.push_malformed(&candidate, format!("fragment never completed: {e}"), out);
                self.decode_line(line, out);
            }
            Parse::Incomplete(e) => {
                if let Parse::Complete(value) = parse(line)
                    && is_tagged_message(&value)
                {
                    candidate.truncate(fragment_len);
                    self.push_malformed(
                        &candidate,
                        "fragment abandoned before a complete message".to_string(),
                        out,
                    );
                    self.push_value(value, out);
                } else if candidate.len() > self.limit {
                    let reason = format!("exceeded {} buffered bytes: {e}", self.limit);
                    self.push_malformed(&candidate, reason, out);
                } else {
                    self.pending = candidate;
                }
            }
        }
    }

    fn push_value(&mut self, value: Value, out: &mut Vec<StreamEvent>) {
        let kind = EventKind::from_value(value);
        if matches!(kind, EventKind::Result(_)) {
            self.saw_result = true;
        }
        self.push(kind, out);
    }

    fn push_malformed(&mut self, raw: &[u8], reason: String, out: &mut Vec<StreamEvent>) {
        self.malformed += 1;
        let raw = String::from_utf8_lossy(raw).into_owned();
        self.push(EventKind::Malformed(MalformedEvent { raw, reason }), out);
    }

    fn push(&mut self, kind: EventKind, out: &mut Vec<StreamEvent>) {
        out.push(StreamEvent {
            seq: self.next_seq,
            kind,
        });
        self.next_seq += 1;
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYSTEM: &str = r#"{"type":"system","subtype":"init","session_id":"s-1","tools":["Read"]}"#;
    const ASSISTANT: &str = r#"{"type":"assistant","session_id":"s-1","message":{"content":[{"type":"text","text":"Looking at the repo"}]}}"#;
    const RESULT: &str = r#"{"type":"result","subtype":"success","is_error":false,"result":"ok","session_id":"s-1"}"#;

    fn stream_of(lines: &[&str]) -> String {
        lines.iter().map(|l| format!("{l}\n")).collect()
    }

    fn decode_all(decoder: &mut StreamDecoder, input: &[u8]) -> Vec<StreamEvent> {
        let mut events = decoder.feed(input);
        events.extend(decoder.finish());
        events
    }

    fn names(events: &[StreamEvent]) -> Vec<&str> {
        events.iter().map(|e| e.kind.name()).collect()
    }

    #[test]
    fn decodes_well_formed_stream_in_order() {
        let mut decoder = StreamDecoder::default();
        let events = decode_all(&mut decoder, stream_of(&[SYSTEM, ASSISTANT, RESULT]).as_bytes());

        assert_eq!(names(&events), vec!["system", "assistant", "result"]);
        assert_eq!(
            events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(decoder.completion().is_ok());
    }

    #[test]
    fn reserialized_stream_decodes_to_same_events() {
        let input = stream_of(&[SYSTEM, ASSISTANT, r#"{"type":"user","message":{}}"#, RESULT]);
        let first = decode_all(&mut StreamDecoder::default(), input.as_bytes());

        let reserialized: String = first.iter().map(|e| format!("{}\n", e.to_line())).collect();
        let second = decode_all(&mut StreamDecoder::default(), reserialized.as_bytes());

        assert_eq!(first, second);
    }

    #[test]
    fn chunk_boundary_does_not_change_events() {
        let input = stream_of(&[SYSTEM, ASSISTANT, RESULT]);
        let whole = decode_all(&mut StreamDecoder::default(), input.as_bytes());

        for offset in 0..=input.len() {
            let mut decoder = StreamDecoder::default();
            let (a, b) = input.as_bytes().split_at(offset);
            let mut events = decoder.feed(a);
            events.extend(decoder.feed(b));
            events.extend(decoder.finish());
            assert_eq!(events, whole, "split at byte {offset}");
        }
    }

    #[test]
    fn multibyte_text_survives_any_split() {
        let line = r#"{"type":"assistant","message":{"content":"héllo — wörld ✓"}}"#;
        let input = stream_of(&[line, RESULT]);
        let whole = decode_all(&mut StreamDecoder::default(), input.as_bytes());
        assert_eq!(names(&whole), vec!["assistant", "result"]);

        for offset in 0..=input.len() {
            let mut decoder = StreamDecoder::default();
            let (a, b) = input.as_bytes().split_at(offset);
            let mut events = decoder.feed(a);
            events.extend(decoder.feed(b));
            events.extend(decoder.finish());
            assert_eq!(events, whole, "split at byte {offset}");
        }
    }

    #[test]
    fn truncated_message_across_lines_is_recombined() {
        let (head, tail) = ASSISTANT.split_at(40);
        let input = format!("{head}\n{tail}\n{RESULT}\n");

        let mut decoder = StreamDecoder::default();
        let events = decode_all(&mut decoder, input.as_bytes());

        assert_eq!(names(&events), vec!["assistant", "result"]);
        assert_eq!(events[0].to_line(), serde_json::from_str::<Value>(ASSISTANT).unwrap().to_string());
        assert_eq!(decoder.malformed_count(), 0);
    }

    #[test]
    fn split_inside_string_keeps_whitespace() {
        let line = r#"{"type":"assistant","message":{"content":"two words"}}"#;
        let split = line.find("two ").unwrap() + 4;
        let input = format!("{}\n{}\n", &line[..split], &line[split..]);

        let events = decode_all(&mut StreamDecoder::default(), input.as_bytes());
        match &events[0].kind {
            EventKind::Assistant(a) => assert_eq!(a.text().as_deref(), Some("two words")),
            other => panic!("expected assistant, got {other:?}"),
        }
    }

    #[test]
    fn message_split_over_many_lines() {
        let chunks: Vec<&str> = ASSISTANT
            .as_bytes()
            .chunks(17)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect();
        let mut input = chunks.join("\n");
        input.push('\n');
        input.push_str(RESULT);
        input.push('\n');

        let events = decode_all(&mut StreamDecoder::default(), input.as_bytes());
        assert_eq!(names(&events), vec!["assistant", "result"]);
    }

    #[test]
    fn oversized_fragment_yields_one_malformed_then_resumes() {
        let limit = 256;
        let mut input = String::from("{\"type\":\"assistant\",\"message\":\"");
        input.push('\n');
        // 31 header bytes + 6 * 40 crosses the limit on the last fragment.
        for _ in 0..6 {
            input.push_str(&"a".repeat(40));
            input.push('\n');
        }
        input.push_str(RESULT);
        input.push('\n');

        let mut decoder = StreamDecoder::new(limit);
        let events = decode_all(&mut decoder, input.as_bytes());

        let malformed: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::Malformed(_)))
            .collect();
        assert_eq!(malformed.len(), 1, "events: {:?}", names(&events));
        assert!(events.last().unwrap().is_result());
        assert!(decoder.completion().is_ok());
    }

    #[test]
    fn garbage_line_is_malformed_not_fatal() {
        let input = format!("not json at all\n{SYSTEM}\n{RESULT}\n");
        let events = decode_all(&mut StreamDecoder::default(), input.as_bytes());

        assert_eq!(names(&events), vec!["malformed", "system", "result"]);
        match &events[0].kind {
            EventKind::Malformed(m) => assert_eq!(m.raw, "not json at all"),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn abandoned_fragment_does_not_swallow_next_message() {
        let input = format!("{{\"type\":\"assistant\",\"message\":\"cut off\n{RESULT}\n");
        let events = decode_all(&mut StreamDecoder::default(), input.as_bytes());
        assert_eq!(names(&events), vec!["malformed", "result"]);
    }

    #[test]
    fn uncompletable_fragment_releases_following_line() {
        let input = format!("{{\"type\":\"assistant\",\"n\":1\n}}}}\n{RESULT}\n");
        let events = decode_all(&mut StreamDecoder::default(), input.as_bytes());
        // `{"type":"assistant","n":1}}` is a syntax error, so the fragment and the
        // stray braces are reported separately.
        assert_eq!(names(&events), vec!["malformed", "malformed", "result"]);
    }

    #[test]
    fn missing_result_is_incomplete() {
        let mut decoder = StreamDecoder::default();
        let events = decode_all(&mut decoder, stream_of(&[SYSTEM, ASSISTANT]).as_bytes());
        assert_eq!(events.len(), 2);
        assert!(matches!(
            decoder.completion(),
            Err(StreamError::Incomplete { events: 2 })
        ));
    }

    #[test]
    fn unterminated_last_line_is_decoded_on_finish() {
        let input = format!("{SYSTEM}\n{RESULT}");
        let mut decoder = StreamDecoder::default();
        assert_eq!(decoder.feed(input.as_bytes()).len(), 1);
        let tail = decoder.finish();
        assert_eq!(names(&tail), vec!["result"]);
        assert!(decoder.saw_result());
    }

    #[test]
    fn dangling_fragment_at_eof_is_malformed() {
        let mut decoder = StreamDecoder::default();
        let events = decode_all(&mut decoder, b"{\"type\":\"assistant\",\"mess\n");
        assert_eq!(names(&events), vec!["malformed"]);
        assert_eq!(decoder.buffered_len(), 0);
        assert!(decoder.completion().is_err());
    }

    #[test]
    fn blank_and_crlf_lines_are_ignored() {
        let input = format!("\r\n\n{SYSTEM}\r\n   \n{RESULT}\r\n");
        let events = decode_all(&mut StreamDecoder::default(), input.as_bytes());
        assert_eq!(names(&events), vec!["system", "result"]);
    }

    #[test]
    fn split_inside_multibyte_character_is_recombined() {
        let line = r#"{"type":"assistant","message":{"content":"héllo"}}"#.as_bytes();
        // Break between the two bytes of `é`.
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut input = line[..split].to_vec();
        input.push(b'\n');
        input.extend_from_slice(&line[split..]);
        input.push(b'\n');

        let mut decoder = StreamDecoder::default();
        let events = decode_all(&mut decoder, &input);
        match &events[0].kind {
            EventKind::Assistant(a) => assert_eq!(a.text().as_deref(), Some("héllo")),
            other => panic!("expected assistant, got {other:?}"),
        }
        assert_eq!(decoder.malformed_count(), 0);
    }

    #[test]
    fn invalid_utf8_in_complete_line_is_replaced() {
        let mut input = br#"{"type":"assistant","message":{"content":"a"#.to_vec();
        input.push(0xFF);
        input.extend_from_slice(b"b\"}}\n");

        let events = decode_all(&mut StreamDecoder::default(), &input);
        match &events[0].kind {
            EventKind::Assistant(a) => assert_eq!(a.text().as_deref(), Some("a\u{FFFD}b")),
            other => panic!("expected assistant, got {other:?}"),
        }
    }

    #[test]
    fn endless_line_stays_bounded() {
        let limit = 1024;
        let mut decoder = StreamDecoder::new(limit);
        let chunk = vec![b'a'; 8 * 1024];

        let mut events = Vec::new();
        for _ in 0..256 {
            events.extend(decoder.feed(&chunk));
            assert!(decoder.buffered_len() <= limit + 1);
        }
        events.extend(decoder.feed(format!("still the same line\n{RESULT}\n").as_bytes()));
        events.extend(decoder.finish());

        assert_eq!(names(&events), vec!["malformed", "result"]);
        match &events[0].kind {
            EventKind::Malformed(m) => assert!(m.raw.len() <= limit + 1),
            other => panic!("expected malformed, got {other:?}"),
        }
        assert!(decoder.completion().is_ok());
    }

    #[test]
    fn overlong_terminated_line_does_not_eat_the_next() {
        let limit = 128;
        let input = format!("{}\n{RESULT}\n", "x".repeat(400));
        let mut decoder = StreamDecoder::new(limit);
        let events = decode_all(&mut decoder, input.as_bytes());

        assert_eq!(names(&events), vec!["malformed", "result"]);
        assert_eq!(decoder.buffered_len(), 0);
    }
}
