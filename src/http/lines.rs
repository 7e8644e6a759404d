//! Split a byte-chunk stream into text lines.

use futures::stream::{self, Stream, StreamExt};

use crate::error::{HarvestError, HarvestResult};

// ---

struct LineState<S> {
    inner: S,
    buffer: Vec<u8>,
    done: bool,
}

/// Lines of a chunked body, without their `\n` / `\r\n` terminators.
///
/// A final line without a terminator is still yielded. Chunk errors end the
/// stream after being yielded once.
pub fn byte_lines<S, B, E>(inner: S) -> impl Stream<Item = HarvestResult<String>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<HarvestError>,
{
    // ---
    let state = LineState {
        inner,
        buffer: Vec::new(),
        done: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(pos) = st.buffer.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = st.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Some((decode(line), st));
            }
            if st.done {
                if st.buffer.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut st.buffer);
                return Some((decode(line), st));
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    st.done = true;
                    st.buffer.clear();
                    return Some((Err(e.into()), st));
                }
                None => st.done = true,
            }
        }
    })
}

fn decode(line: Vec<u8>) -> HarvestResult<String> {
    String::from_utf8(line).map_err(|e| HarvestError::Decode(format!("invalid UTF-8 line: {}", e)))
}
