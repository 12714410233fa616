//! Per-direction relay engine for established tunnels.
//!
//! Each direction owns a [`RelayBuffer`]. While the buffer is accumulating,
//! chunks are held back so the interceptor can observe one logically complete
//! message instead of arbitrary TCP fragments. A direction leaves buffered
//! mode permanently on its first flush, whether that flush came from a
//! satisfied content length, an overflow, or the source closing.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const IO_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    ClientToUpstream,
    UpstreamToClient,
}

impl RelayDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientToUpstream => "client_to_upstream",
            Self::UpstreamToClient => "upstream_to_client",
        }
    }
}

/// Transform applied to each flushed buffer, once per flush per direction.
/// Never sees unbuffered fragments.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, direction: RelayDirection, data: Vec<u8>) -> Vec<u8>;
}

#[derive(Debug, Default)]
pub struct IdentityInterceptor;

impl Interceptor for IdentityInterceptor {
    fn intercept(&self, _direction: RelayDirection, data: Vec<u8>) -> Vec<u8> {
        data
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RelayAction {
    /// Chunk absorbed into the buffer; nothing to write yet.
    Pending,
    /// Unbuffered passthrough; never intercepted.
    Forward(Vec<u8>),
    /// Buffer holds a complete message; intercept then write.
    Flush(Vec<u8>),
    /// Appending the chunk would overflow capacity. Any accumulated bytes
    /// are intercepted and written first, then the chunk goes out raw. When
    /// the chunk alone exceeds capacity, `buffered` is empty and the
    /// interceptor is not invoked.
    Overflow { buffered: Vec<u8>, chunk: Vec<u8> },
}

#[derive(Debug)]
pub struct RelayBuffer {
    capacity: usize,
    data: Vec<u8>,
    content_length: Option<u64>,
    body_offset: Option<usize>,
    header_scanned: bool,
    flushed: bool,
}

impl RelayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            data: Vec::new(),
            content_length: None,
            body_offset: None,
            header_scanned: false,
            flushed: false,
        }
    }

    pub fn flushed(&self) -> bool {
        self.flushed
    }

    pub fn on_chunk(&mut self, chunk: &[u8]) -> RelayAction {
        if self.capacity == 0 || self.flushed {
            return RelayAction::Forward(chunk.to_vec());
        }

        if self.data.len() + chunk.len() > self.capacity {
            self.flushed = true;
            return RelayAction::Overflow {
                buffered: std::mem::take(&mut self.data),
                chunk: chunk.to_vec(),
            };
        }

        self.data.extend_from_slice(chunk);
        self.scan_header();

        if let (Some(content_length), Some(body_offset)) = (self.content_length, self.body_offset) {
            if (self.data.len() - body_offset) as u64 >= content_length {
                self.flushed = true;
                return RelayAction::Flush(std::mem::take(&mut self.data));
            }
        }
        RelayAction::Pending
    }

    /// Remaining buffered bytes to flush when the source half-closes.
    pub fn on_source_closed(&mut self) -> Option<Vec<u8>> {
        if self.flushed || self.data.is_empty() {
            return None;
        }
        self.flushed = true;
        Some(std::mem::take(&mut self.data))
    }

    /// Content-length extraction is deferred until the full header block is
    /// visible, so a header split across chunk boundaries is handled rather
    /// than silently treated as length-unknown.
    fn scan_header(&mut self) {
        if self.header_scanned {
            return;
        }
        let Some(terminator) = find_subsequence(&self.data, b"\r\n\r\n") else {
            return;
        };
        self.header_scanned = true;
        let body_offset = terminator + 4;
        self.body_offset = Some(body_offset);
        self.content_length = parse_content_length(&self.data[..body_offset]);
    }
}

fn parse_content_length(head: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(head).ok()?;
    for line in text.split("\r\n").skip(1) {
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value.trim().parse::<u64>().ok();
        }
    }
    None
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayDirectionStats {
    pub bytes_forwarded: u64,
    pub buffer_flushes: u64,
    pub overflowed: bool,
}

pub(crate) async fn relay_direction<R, W>(
    mut source: R,
    mut destination: W,
    mut buffer: RelayBuffer,
    interceptor: Arc<dyn Interceptor>,
    direction: RelayDirection,
    initial: Vec<u8>,
) -> io::Result<RelayDirectionStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stats = RelayDirectionStats::default();

    if !initial.is_empty() {
        let action = buffer.on_chunk(&initial);
        apply_action(&mut destination, &interceptor, direction, action, &mut stats).await?;
    }

    let mut chunk = vec![0_u8; IO_CHUNK_SIZE];
    loop {
        let read = source.read(&mut chunk).await?;
        if read == 0 {
            if let Some(remaining) = buffer.on_source_closed() {
                let payload = interceptor.intercept(direction, remaining);
                destination.write_all(&payload).await?;
                stats.bytes_forwarded += payload.len() as u64;
                stats.buffer_flushes += 1;
            }
            // Half-close: the peer may still be sending on the other
            // direction of the tunnel.
            destination.shutdown().await?;
            return Ok(stats);
        }

        let action = buffer.on_chunk(&chunk[..read]);
        apply_action(&mut destination, &interceptor, direction, action, &mut stats).await?;
    }
}

async fn apply_action<W>(
    destination: &mut W,
    interceptor: &Arc<dyn Interceptor>,
    direction: RelayDirection,
    action: RelayAction,
    stats: &mut RelayDirectionStats,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match action {
        RelayAction::Pending => Ok(()),
        RelayAction::Forward(bytes) => {
            destination.write_all(&bytes).await?;
            stats.bytes_forwarded += bytes.len() as u64;
            Ok(())
        }
        RelayAction::Flush(bytes) => {
            let payload = interceptor.intercept(direction, bytes);
            destination.write_all(&payload).await?;
            stats.bytes_forwarded += payload.len() as u64;
            stats.buffer_flushes += 1;
            Ok(())
        }
        RelayAction::Overflow { buffered, chunk } => {
            // The interceptor only ever sees buffered data; an overflow
            // triggered by the very first chunk has none.
            if !buffered.is_empty() {
                let payload = interceptor.intercept(direction, buffered);
                destination.write_all(&payload).await?;
                stats.bytes_forwarded += payload.len() as u64;
                stats.buffer_flushes += 1;
            }
            destination.write_all(&chunk).await?;
            stats.bytes_forwarded += chunk.len() as u64;
            stats.overflowed = true;
            Ok(())
        }
    }
}

/// Run both directions of a tunnel to completion. `client_leftover` is
/// replayed into the client-to-upstream direction before any fresh socket
/// bytes are read.
pub(crate) async fn splice_tunnel<C, U>(
    client: C,
    upstream: U,
    client_leftover: Vec<u8>,
    buffer_capacity: usize,
    interceptor: Arc<dyn Interceptor>,
) -> (
    io::Result<RelayDirectionStats>,
    io::Result<RelayDirectionStats>,
)
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    tokio::join!(
        relay_direction(
            client_read,
            upstream_write,
            RelayBuffer::new(buffer_capacity),
            Arc::clone(&interceptor),
            RelayDirection::ClientToUpstream,
            client_leftover,
        ),
        relay_direction(
            upstream_read,
            client_write,
            RelayBuffer::new(buffer_capacity),
            interceptor,
            RelayDirection::UpstreamToClient,
            Vec::new(),
        ),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingInterceptor {
        flushes: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingInterceptor {
        fn flushes(&self) -> Vec<Vec<u8>> {
            self.flushes.lock().expect("lock poisoned").clone()
        }
    }

    impl Interceptor for RecordingInterceptor {
        fn intercept(&self, _direction: RelayDirection, data: Vec<u8>) -> Vec<u8> {
            self.flushes.lock().expect("lock poisoned").push(data.clone());
            data
        }
    }

    #[test]
    fn zero_capacity_always_forwards() {
        let mut buffer = RelayBuffer::new(0);
        assert_eq!(
            buffer.on_chunk(b"abc"),
            RelayAction::Forward(b"abc".to_vec())
        );
        assert!(!buffer.flushed());
    }

    #[test]
    fn content_length_satisfied_across_chunks_flushes_once() {
        let mut buffer = RelayBuffer::new(4096);
        let head = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n";
        assert_eq!(buffer.on_chunk(head), RelayAction::Pending);
        assert_eq!(buffer.on_chunk(b"01234"), RelayAction::Pending);

        let mut expected = head.to_vec();
        expected.extend_from_slice(b"0123456789");
        assert_eq!(buffer.on_chunk(b"56789"), RelayAction::Flush(expected));
        assert!(buffer.flushed());

        // After the flush, the direction is permanently unbuffered.
        assert_eq!(
            buffer.on_chunk(b"next"),
            RelayAction::Forward(b"next".to_vec())
        );
    }

    #[test]
    fn header_split_across_chunks_still_finds_content_length() {
        let mut buffer = RelayBuffer::new(4096);
        assert_eq!(
            buffer.on_chunk(b"POST / HTTP/1.1\r\nContent-Le"),
            RelayAction::Pending
        );
        assert_eq!(
            buffer.on_chunk(b"ngth: 3\r\n\r\nab"),
            RelayAction::Pending
        );
        assert!(matches!(buffer.on_chunk(b"c"), RelayAction::Flush(_)));
    }

    #[test]
    fn overflow_hands_back_buffered_bytes_then_chunk() {
        let mut buffer = RelayBuffer::new(8);
        assert_eq!(buffer.on_chunk(b"12345"), RelayAction::Pending);
        match buffer.on_chunk(b"67890") {
            RelayAction::Overflow { buffered, chunk } => {
                assert_eq!(buffered, b"12345");
                assert_eq!(chunk, b"67890");
            }
            other => panic!("expected overflow, got {other:?}"),
        }
        assert!(buffer.flushed());
    }

    #[test]
    fn first_chunk_larger_than_capacity_overflows_with_nothing_buffered() {
        let mut buffer = RelayBuffer::new(4);
        match buffer.on_chunk(b"123456") {
            RelayAction::Overflow { buffered, chunk } => {
                assert!(buffered.is_empty());
                assert_eq!(chunk, b"123456");
            }
            other => panic!("expected overflow, got {other:?}"),
        }
        assert!(buffer.flushed());
    }

    #[test]
    fn source_close_flushes_remainder_exactly_once() {
        let mut buffer = RelayBuffer::new(64);
        assert_eq!(buffer.on_chunk(b"partial"), RelayAction::Pending);
        assert_eq!(buffer.on_source_closed(), Some(b"partial".to_vec()));
        assert_eq!(buffer.on_source_closed(), None);
    }

    #[tokio::test]
    async fn relay_direction_preserves_chunk_order_unbuffered() {
        let (client, mut client_far) = tokio::io::duplex(1024);
        let (upstream, mut upstream_far) = tokio::io::duplex(1024);
        let interceptor: Arc<dyn Interceptor> = Arc::new(IdentityInterceptor);

        let task = tokio::spawn(async move {
            let (source, _unused_write) = tokio::io::split(client);
            let (_unused_read, destination) = tokio::io::split(upstream);
            relay_direction(
                source,
                destination,
                RelayBuffer::new(0),
                interceptor,
                RelayDirection::ClientToUpstream,
                Vec::new(),
            )
            .await
        });

        use tokio::io::AsyncWriteExt;
        for part in [&b"alpha "[..], b"beta ", b"gamma"] {
            client_far.write_all(part).await.expect("feed chunk");
        }
        client_far.shutdown().await.expect("close source");

        let stats = task.await.expect("join").expect("relay ok");
        assert_eq!(stats.bytes_forwarded, 16);
        assert_eq!(stats.buffer_flushes, 0);

        let mut received = Vec::new();
        use tokio::io::AsyncReadExt;
        upstream_far
            .read_to_end(&mut received)
            .await
            .expect("drain destination");
        assert_eq!(received, b"alpha beta gamma");
    }

    #[tokio::test]
    async fn buffered_message_is_intercepted_once_with_full_body() {
        let (client, mut client_far) = tokio::io::duplex(4096);
        let (upstream, mut upstream_far) = tokio::io::duplex(4096);
        let interceptor = Arc::new(RecordingInterceptor::default());
        let interceptor_handle = Arc::clone(&interceptor);

        let task = tokio::spawn(async move {
            let (source, _w) = tokio::io::split(client);
            let (_r, destination) = tokio::io::split(upstream);
            relay_direction(
                source,
                destination,
                RelayBuffer::new(4096),
                interceptor_handle as Arc<dyn Interceptor>,
                RelayDirection::ClientToUpstream,
                Vec::new(),
            )
            .await
        });

        use tokio::io::AsyncWriteExt;
        let message = b"POST /data HTTP/1.1\r\nContent-Length: 6\r\n\r\nabc";
        client_far.write_all(message).await.expect("head + partial");
        client_far.write_all(b"def").await.expect("rest of body");
        client_far.shutdown().await.expect("close source");

        let stats = task.await.expect("join").expect("relay ok");
        assert_eq!(stats.buffer_flushes, 1);

        let flushes = interceptor.flushes();
        assert_eq!(flushes.len(), 1, "exactly one interceptor invocation");
        assert!(flushes[0].ends_with(b"abcdef"));

        let mut received = Vec::new();
        use tokio::io::AsyncReadExt;
        upstream_far.read_to_end(&mut received).await.expect("drain");
        assert_eq!(received.len(), message.len() + 3);
    }

    #[tokio::test]
    async fn overflow_downgrade_delivers_all_bytes_in_order() {
        let (client, mut client_far) = tokio::io::duplex(4096);
        let (upstream, mut upstream_far) = tokio::io::duplex(4096);
        let interceptor = Arc::new(RecordingInterceptor::default());
        let interceptor_handle = Arc::clone(&interceptor);

        let task = tokio::spawn(async move {
            let (source, _w) = tokio::io::split(client);
            let (_r, destination) = tokio::io::split(upstream);
            relay_direction(
                source,
                destination,
                RelayBuffer::new(8),
                interceptor_handle as Arc<dyn Interceptor>,
                RelayDirection::ClientToUpstream,
                Vec::new(),
            )
            .await
        });

        use tokio::io::AsyncWriteExt;
        client_far.write_all(b"12345").await.expect("first");
        client_far.write_all(b"67890").await.expect("overflowing");
        client_far.write_all(b"tail").await.expect("post-overflow");
        client_far.shutdown().await.expect("close source");

        let stats = task.await.expect("join").expect("relay ok");
        assert!(stats.overflowed);
        assert_eq!(stats.bytes_forwarded, 14);

        // The duplex transport may coalesce the writes, so the buffered
        // prefix the interceptor sees is boundary-dependent. What must hold:
        // never an empty invocation, at most one flush, all bytes in order.
        let flushes = interceptor.flushes();
        assert!(flushes.len() <= 1);
        assert!(flushes.iter().all(|flush| !flush.is_empty()));
        assert!(flushes
            .iter()
            .all(|flush| b"1234567890tail".starts_with(flush.as_slice())));

        let mut received = Vec::new();
        use tokio::io::AsyncReadExt;
        upstream_far.read_to_end(&mut received).await.expect("drain");
        assert_eq!(received, b"1234567890tail");
    }

    #[tokio::test]
    async fn oversized_first_chunk_bypasses_the_interceptor() {
        let (client, mut client_far) = tokio::io::duplex(4096);
        let (upstream, mut upstream_far) = tokio::io::duplex(4096);
        let interceptor = Arc::new(RecordingInterceptor::default());
        let interceptor_handle = Arc::clone(&interceptor);

        let task = tokio::spawn(async move {
            let (source, _w) = tokio::io::split(client);
            let (_r, destination) = tokio::io::split(upstream);
            relay_direction(
                source,
                destination,
                RelayBuffer::new(8),
                interceptor_handle as Arc<dyn Interceptor>,
                RelayDirection::ClientToUpstream,
                Vec::new(),
            )
            .await
        });

        use tokio::io::AsyncWriteExt;
        client_far
            .write_all(b"0123456789abcdef")
            .await
            .expect("oversized chunk");
        client_far.shutdown().await.expect("close source");

        let stats = task.await.expect("join").expect("relay ok");
        assert!(stats.overflowed);
        assert_eq!(stats.buffer_flushes, 0);
        assert_eq!(stats.bytes_forwarded, 16);
        assert!(interceptor.flushes().is_empty());

        let mut received = Vec::new();
        use tokio::io::AsyncReadExt;
        upstream_far.read_to_end(&mut received).await.expect("drain");
        assert_eq!(received, b"0123456789abcdef");
    }
}
