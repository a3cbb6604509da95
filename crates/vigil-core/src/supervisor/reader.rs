//! Chunked readers for the child's stdout and stderr.
//!
//! Reads are chunk-based rather than line-based: a prompt such as
//! `Continue? ` never ends with a newline and must still be seen.

use std::pin::Pin;

use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::broadcast::StreamKind;

const READ_BUF_BYTES: usize = 8 * 1024;

/// A stream of decoded text chunks tagged with their origin.
pub type ChunkStream = Pin<Box<dyn Stream<Item = (StreamKind, String)> + Send>>;

/// Read `pipe` until EOF, yielding each read as text.
///
/// A multi-byte character split across two reads is carried over to the
/// next chunk instead of being replaced.
pub fn chunk_stream<R>(mut pipe: R, stream: StreamKind) -> ChunkStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut buf = vec![0u8; READ_BUF_BYTES];
        let mut carry: Vec<u8> = Vec::new();
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    carry.extend_from_slice(&buf[..n]);
                    let text = take_utf8(&mut carry);
                    if !text.is_empty() {
                        yield (stream, text);
                    }
                }
                Err(e) => {
                    debug!(%stream, error = %e, "read failed, closing stream");
                    break;
                }
            }
        }
        if !carry.is_empty() {
            yield (stream, String::from_utf8_lossy(&carry).into_owned());
        }
    })
}

/// Decode as much of `carry` as possible, leaving an incomplete trailing
/// character in place.
fn take_utf8(carry: &mut Vec<u8>) -> String {
    match std::str::from_utf8(carry) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let rest = carry.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(carry).into_owned();
            *carry = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}
