use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{Connector, EventSink, Message, Transport};

/// URL scheme accepted by [`UdsConnector`].
pub const URL_SCHEME: &str = "unix://";

/// Length prefix preceding every message on the stream.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default per-message ceiling: 2 MiB, leaving headroom above the frame limit.
pub const DEFAULT_MAX_MESSAGE: usize = 2 * 1024 * 1024;

/// Unix domain socket connector.
///
/// Connects to `unix://<path>` and carries whole messages over the stream,
/// each preceded by a 4-byte big-endian length. A reader thread per
/// connection reports `Open`, every inbound message, and finally `Close` (or
/// `Error` followed by `Close` when the stream fails).
#[derive(Debug, Clone)]
pub struct UdsConnector {
    max_message_size: usize,
}

impl Default for UdsConnector {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE,
        }
    }
}

impl UdsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the per-message ceiling. It applies to messages sent as
    /// well as received.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }
}

/// Extract the socket path from a `unix://` URL.
pub fn socket_path(url: &str) -> Result<&Path> {
    match url.strip_prefix(URL_SCHEME) {
        Some(path) if !path.is_empty() => Ok(Path::new(path)),
        _ => Err(TransportError::InvalidUrl(url.to_string())),
    }
}

impl Connector for UdsConnector {
    fn connect(&self, url: &str, events: EventSink) -> Result<Box<dyn Transport>> {
        let path = socket_path(url)?;
        let stream = UnixStream::connect(path).map_err(|source| TransportError::Connect {
            url: url.to_string(),
            source,
        })?;
        let reader = stream.try_clone()?;
        debug!(?path, "connected to unix domain socket");

        let closed = Arc::new(AtomicBool::new(false));
        let max = self.max_message_size;
        let reader_closed = Arc::clone(&closed);
        std::thread::Builder::new()
            .name("sockmux-uds-reader".to_string())
            .spawn(move || read_loop(reader, events, max, reader_closed))?;

        Ok(Box::new(UdsTransport {
            stream,
            closed,
            max_message_size: max,
        }))
    }
}

fn read_loop(mut stream: UnixStream, events: EventSink, max: usize, closed: Arc<AtomicBool>) {
    if !events.open() {
        return;
    }
    loop {
        match read_message(&mut stream, max) {
            Ok(Some(data)) => {
                if !events.message(Message::Binary(data)) {
                    return;
                }
            }
            Ok(None) => {
                info!("unix domain socket closed by peer");
                events.close();
                return;
            }
            Err(err) => {
                if !closed.load(Ordering::SeqCst) {
                    warn!(error = %err, "unix domain socket read failed");
                    events.error(err.to_string());
                }
                events.close();
                return;
            }
        }
    }
}

struct UdsTransport {
    stream: UnixStream,
    closed: Arc<AtomicBool>,
    max_message_size: usize,
}

impl Transport for UdsTransport {
    fn send(&mut self, data: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if data.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }
        write_message(&mut self.stream, &data)
    }

    fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

/// Write one length-prefixed message.
pub fn write_message<W: Write>(writer: &mut W, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| TransportError::MessageTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + data.len());
    buf.put_u32(len);
    buf.put_slice(data);
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed message.
///
/// Returns `Ok(None)` on a clean EOF between messages. EOF inside a message
/// is an `UnexpectedEof` I/O error. A declared length above `max` is
/// [`TransportError::MessageTooLarge`] and is rejected before the message
/// buffer is allocated.
pub fn read_message<R: Read>(reader: &mut R, max: usize) -> Result<Option<Bytes>> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0usize;
    while filled < LENGTH_PREFIX_SIZE {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max {
        return Err(TransportError::MessageTooLarge { size: len, max });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok(Some(Bytes::from(data)))
}
