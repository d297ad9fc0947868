//! Async adapter from a process output pipe to a stream of decoded events.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::decoder::StreamDecoder;
use super::event::StreamEvent;
use crate::error::StreamError;

/// Bytes requested per read from the pipe.
const READ_CHUNK: usize = 8 * 1024;

/// Lazy, finite sequence of decoded events tied to one process lifetime.
///
/// Yields `Err(StreamError::Incomplete)` as its final item when the input ends
/// without a result event, and `Err(StreamError::Io)` if the pipe fails.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, StreamError>> + Send>>;

struct ReaderState<R> {
    reader: R,
    decoder: StreamDecoder,
    buf: Vec<u8>,
    ready: VecDeque<StreamEvent>,
    trailing_error: Option<StreamError>,
    done: bool,
}

/// Decode `reader` lazily, one chunk at a time.
pub fn decode_reader<R>(reader: R, buffer_limit: usize) -> EventStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let state = ReaderState {
        reader,
        decoder: StreamDecoder::new(buffer_limit),
        buf: vec![0u8; READ_CHUNK],
        ready: VecDeque::new(),
        trailing_error: None,
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.ready.pop_front() {
                return Some((Ok(event), st));
            }
            if st.done {
                return st.trailing_error.take().map(|e| (Err(e), st));
            }

            match st.reader.read(&mut st.buf).await {
                Ok(0) => {
                    st.done = true;
                    st.ready.extend(st.decoder.finish());
                    st.trailing_error = st.decoder.completion().err();
                }
                Ok(n) => {
                    let events = st.decoder.feed(&st.buf[..n]);
                    st.ready.extend(events);
                }
                Err(e) => {
                    st.done = true;
                    st.trailing_error = Some(StreamError::Io(e));
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::stream::EventKind;

    #[tokio::test]
    async fn yields_events_then_ends() {
        let input = concat!(
            r#"{"type":"system","subtype":"init"}"#,
            "\n",
            r#"{"type":"result","subtype":"success","result":"ok"}"#,
            "\n"
        );
        let mut stream = decode_reader(std::io::Cursor::new(input.as_bytes().to_vec()), 1024);

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first.kind, EventKind::System(_)));
        let second = stream.next().await.unwrap().unwrap();
        assert!(second.is_result());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn reports_incomplete_after_last_event() {
        let input = "{\"type\":\"assistant\",\"message\":{}}\n";
        let items: Vec<_> = decode_reader(std::io::Cursor::new(input.as_bytes().to_vec()), 1024)
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(
            items[1],
            Err(StreamError::Incomplete { events: 1 })
        ));
    }

    #[tokio::test]
    async fn pipe_chunks_are_reassembled() {
        let (mut tx, rx) = tokio::io::duplex(16);
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"a long enough result to span chunks"}"#;
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for piece in line.as_bytes().chunks(7) {
                tx.write_all(piece).await.unwrap();
            }
            tx.write_all(b"\n").await.unwrap();
        });

        let items: Vec<_> = decode_reader(rx, 1024).collect().await;
        writer.await.unwrap();

        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap().is_result());
    }
}
