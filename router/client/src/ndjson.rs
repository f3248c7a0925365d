use crate::ChatChunk;

/// Incremental decoder for newline-delimited JSON chat chunks
///
/// Network reads do not respect line boundaries, so bytes are buffered until a
/// full line is available. Lines that are not valid chunks are skipped.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return every chunk completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<ChatChunk> {
        self.buffer.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some(position) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=position).collect();
            if let Some(chunk) = parse_line(&line[..line.len() - 1]) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Decode whatever is left once the stream has ended
    pub fn finish(&mut self) -> Option<ChatChunk> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line)
    }
}

fn parse_line(line: &[u8]) -> Option<ChatChunk> {
    let line = trim_ascii(line);
    if line.is_empty() {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(chunk) => Some(chunk),
        Err(err) => {
            tracing::warn!(
                "Skipping invalid chat chunk `{}`: {err}",
                String::from_utf8_lossy(line)
            );
            None
        }
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_lines() {
        let mut decoder = NdjsonDecoder::new();
        let chunks = decoder.push(
            b"{\"message\":{\"content\":\"Hel\"}}\n{\"message\":{\"content\":\"lo\"}}\n",
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content(), "Hel");
        assert_eq!(chunks[1].content(), "lo");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_line_across_reads() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.push(b"{\"message\":{\"con").is_empty());
        let chunks = decoder.push(b"tent\":\"Hi\"},\"done\":false}\n{\"done\":");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content(), "Hi");

        assert!(decoder.push(b"false}").is_empty());
        let last = decoder.finish().unwrap();
        assert!(!last.done);

        let mut decoder = NdjsonDecoder::new();
        decoder.push(b"{\"done\":true}");
        assert!(decoder.finish().unwrap().done);
    }

    #[test]
    fn test_invalid_lines_are_skipped() {
        let mut decoder = NdjsonDecoder::new();
        let chunks = decoder.push(b"not json\n\n  \r\n{\"message\":{\"content\":\"ok\"}}\r\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content(), "ok");
    }
}
