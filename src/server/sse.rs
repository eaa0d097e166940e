/// Incremental server-sent-events reader. Feed it raw body chunks as they
/// arrive; it hands back the `data` payload of every complete event.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    // bytes of an incomplete UTF-8 sequence split across chunks
    pending: Vec<u8>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let rest = self.pending.split_off(valid_up_to);
        let text = String::from_utf8_lossy(&self.pending).replace("\r\n", "\n");
        self.buffer.push_str(&text);
        self.pending = rest;

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            if let Some(data) = event_data(&block) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Payload of a trailing event the upstream closed without terminating.
    pub fn finish(&mut self) -> Option<String> {
        let block = std::mem::take(&mut self.buffer);
        event_data(&block)
    }
}

/// Join the `data:` lines of one event block; comments and other fields are ignored.
fn event_data(block: &str) -> Option<String> {
    let lines: Vec<&str> = block
        .lines()
        .filter_map(|line| {
            line.strip_prefix("data:")
                .map(|d| d.strip_prefix(' ').unwrap_or(d).trim_end())
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    let data = lines.join("\n");
    if data.trim().is_empty() {
        None
    } else {
        Some(data)
    }
}
