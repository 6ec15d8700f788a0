/// Incremental server-sent-events decoder shared by the vendor stream parsers.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence; only
/// complete events (terminated by a blank line) are returned.
#[derive(Debug, Default)]
pub struct SseDecoder {
    byte_buf: Vec<u8>,
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns the joined `data:` payload of every event
    /// completed by them. Events without data lines are skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.byte_buf.extend_from_slice(bytes);

        let valid_up_to = match std::str::from_utf8(&self.byte_buf) {
            Ok(_) => self.byte_buf.len(),
            Err(e) => match e.error_len() {
                // Incomplete trailing sequence: keep it for the next chunk
                None => e.valid_up_to(),
                // Garbage in the middle: decode lossily past it
                Some(len) => e.valid_up_to() + len,
            },
        };
        if valid_up_to > 0 {
            let decoded = String::from_utf8_lossy(&self.byte_buf[..valid_up_to]).into_owned();
            self.byte_buf.drain(..valid_up_to);
            self.buffer.push_str(&decoded);
            if self.buffer.contains("\r\n") {
                self.buffer = self.buffer.replace("\r\n", "\n");
            }
        }

        let mut payloads = Vec::new();
        while let Some(event_end) = self.buffer.find("\n\n") {
            let event_text: String = self.buffer.drain(..event_end + 2).collect();
            if let Some(data) = Self::data_of(&event_text) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Returns the payload of a final event the server did not terminate.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        Self::data_of(&rest)
    }

    fn data_of(event_text: &str) -> Option<String> {
        let lines: Vec<&str> = event_text
            .lines()
            .filter_map(|line| {
                line.strip_prefix("data: ")
                    .or_else(|| line.strip_prefix("data:"))
            })
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: ping\ndata: {\"a\"").is_empty());
        let out = decoder.push(b":1}\n\ndata: second\n\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_multibyte_char_split_between_chunks() {
        let mut decoder = SseDecoder::new();
        let bytes = "data: héllo\n\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.push(&bytes[..split]).is_empty());
        assert_eq!(decoder.push(&bytes[split..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn test_crlf_and_events_without_data() {
        let mut decoder = SseDecoder::new();
        let out = decoder.push(b": keepalive\r\n\r\ndata:[DONE]\r\n\r\n");
        assert_eq!(out, vec!["[DONE]".to_string()]);
    }

    #[test]
    fn test_finish_returns_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), Some("tail".to_string()));
        assert_eq!(decoder.finish(), None);
    }
}
