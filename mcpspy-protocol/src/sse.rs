//! Server-Sent Events record splitting.
//!
//! Records are delimited by a blank line; each record's `data:` field
//! lines are joined with newlines per the SSE spec. Comment lines
//! (leading ':') and other fields (`event:`, `id:`, `retry:`) are
//! tolerated and skipped.

/// Incremental SSE record splitter for one stream.
#[derive(Debug, Default)]
pub struct SseSplitter {
    buf: Vec<u8>,
}

impl SseSplitter {
    pub fn new() -> Self {
        SseSplitter::default()
    }

    /// Feed more stream bytes; returns the `data` payloads of every
    /// record completed by this feed.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            let (end, sep_len) = match find_record_end(&self.buf) {
                Some(v) => v,
                None => break,
            };

            let record: Vec<u8> = self.buf.drain(..end + sep_len).collect();
            if let Some(data) = extract_data(&record[..end]) {
                out.push(data);
            }
        }

        out
    }
}

/// Find the earliest record separator (`\n\n` or `\r\n\r\n`), returning
/// (record end offset, separator length).
fn find_record_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

/// Join the `data:` lines of one record. None when the record carries no
/// data field (comments, retry, etc).
fn extract_data(record: &[u8]) -> Option<Vec<u8>> {
    let mut data: Vec<u8> = Vec::new();
    let mut found = false;

    for line in record.split(|&b| b == b'\n') {
        let line = match line.strip_suffix(b"\r") {
            Some(l) => l,
            None => line,
        };
        let rest = match line.strip_prefix(b"data:") {
            Some(r) => r,
            None => continue,
        };
        let rest = rest.strip_prefix(b" ").unwrap_or(rest);

        if found {
            data.push(b'\n');
        }
        data.extend_from_slice(rest);
        found = true;
    }

    if found {
        Some(data)
    } else {
        None
    }
}
