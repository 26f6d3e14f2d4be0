//! Duplex, message-oriented channel between a supervisor and a worker.
//!
//! An [`Endpoint`] wraps one readable and one writable byte stream (the
//! child's stdout/stdin on the supervisor side, the process's own
//! stdin/stdout on the worker side). Messages are line-delimited JSON
//! (see [`message`]). Receiving happens on a dedicated thread that hands
//! every decoded message to a callback; the callback runs on that thread,
//! so it must return promptly or the receive loop backs up.

pub mod message;

use std::io::{BufRead, BufReader, Read, Write};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use message::{ControlMessage, WorkerMessage};

use crate::error::HubError;
use crate::util::sync::lock;

type ClosedCallback = Box<dyn FnOnce() + Send>;

/// One side of a duplex channel receiving `In` and sending `Out`.
pub struct Endpoint<In, Out> {
    label: String,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    on_closed: Mutex<Option<ClosedCallback>>,
    closed: AtomicBool,
    _messages: PhantomData<fn(In) -> Out>,
}

impl<In, Out> Endpoint<In, Out>
where
    In: DeserializeOwned + 'static,
    Out: Serialize + 'static,
{
    /// Wrap a pair of byte streams. Nothing is read until [`Self::start`].
    pub fn new(
        label: impl Into<String>,
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            reader: Mutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Some(Box::new(writer))),
            on_closed: Mutex::new(None),
            closed: AtomicBool::new(false),
            _messages: PhantomData,
        })
    }

    /// Spawn the receive loop and return immediately.
    ///
    /// `on_message` is called for every decoded message in arrival order.
    /// `on_closed` is called exactly once when the peer goes away, a write
    /// fails, or [`Self::shutdown`] is called, whichever happens first.
    pub fn start<M, C>(
        self: &Arc<Self>,
        mut on_message: M,
        on_closed: C,
    ) -> Result<(), HubError>
    where
        M: FnMut(In) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let Some(reader) = lock(&self.reader).take() else {
            return Err(HubError::Codec(format!(
                "{} endpoint already started",
                self.label
            )));
        };
        *lock(&self.on_closed) = Some(Box::new(on_closed));
        if self.is_closed() {
            self.notify_closed();
            return Ok(());
        }

        let endpoint = Arc::clone(self);
        let _handle = std::thread::Builder::new()
            .name(format!("{}-recv", self.label))
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                let mut line = Vec::new();
                loop {
                    line.clear();
                    match reader.read_until(b'\n', &mut line) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) => {
                            log::debug!("{} read failed: {e}", endpoint.label);
                            break;
                        }
                    }
                    if endpoint.is_closed() {
                        break;
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match message::decode_line::<In>(&line) {
                        Ok(msg) => on_message(msg),
                        Err(e) => log::warn!(
                            "{} dropped undecodable message: {e}",
                            endpoint.label
                        ),
                    }
                }
                endpoint.mark_closed();
            })
            .map_err(HubError::ThreadSpawn)?;
        Ok(())
    }

    /// Write one message.
    ///
    /// Safe to call from several threads; writes are serialized
    /// internally. A failed write closes the endpoint.
    pub fn send(&self, message: &Out) -> Result<(), HubError> {
        let line = message::encode_line(message)?;
        let mut writer = lock(&self.writer);
        let Some(stream) = writer.as_mut() else {
            return Err(HubError::ChannelClosed);
        };
        if let Err(e) = stream.write_all(&line).and_then(|()| stream.flush()) {
            log::debug!("{} write failed: {e}", self.label);
            *writer = None;
            drop(writer);
            self.mark_closed();
            return Err(HubError::ChannelClosed);
        }
        Ok(())
    }

    /// Close the endpoint. Idempotent.
    ///
    /// The write side is released immediately, which the peer observes as
    /// end-of-stream. The receive thread stops delivering messages and
    /// exits once its pending read returns.
    pub fn shutdown(&self) {
        self.mark_closed();
    }

    /// Whether the endpoint has been closed for any reason.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        drop(lock(&self.writer).take());
        self.notify_closed();
    }

    fn notify_closed(&self) {
        let callback = lock(&self.on_closed).take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::archive::FrameIndex;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Reader that never yields data, like a silent peer.
    struct Silent;

    impl Read for Silent {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            loop {
                std::thread::park();
            }
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    fn wire(messages: &[WorkerMessage]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for m in messages {
            bytes.extend(message::encode_line(m).unwrap());
        }
        bytes
    }

    #[test]
    fn delivers_in_order_then_reports_close_once() {
        let sent = vec![
            WorkerMessage::NewShape {
                new_data: FrameIndex::empty("Colony"),
            },
            WorkerMessage::ErrorMessage("boom".into()),
            WorkerMessage::Close { abrupt: true },
        ];
        let mut bytes = wire(&sent[..1]);
        bytes.extend_from_slice(b"\n{\"bogus\": 1}\n");
        bytes.extend(wire(&sent[1..]));
        let endpoint: Arc<Endpoint<WorkerMessage, ControlMessage>> =
            Endpoint::new("test", Cursor::new(bytes), std::io::sink());
        let (msg_tx, msg_rx) = mpsc::channel();
        let (closed_tx, closed_rx) = mpsc::channel();

        endpoint
            .start(
                move |m| msg_tx.send(m).unwrap(),
                move || closed_tx.send(()).unwrap(),
            )
            .unwrap();

        closed_rx.recv_timeout(WAIT).unwrap();
        let received: Vec<_> = msg_rx.try_iter().collect();
        assert_eq!(received, sent);
        endpoint.shutdown();
        assert!(closed_rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn send_writes_one_line_per_message() {
        let out = SharedBuf::default();
        let endpoint: Arc<Endpoint<WorkerMessage, ControlMessage>> =
            Endpoint::new("test", std::io::empty(), out.clone());

        endpoint.send(&ControlMessage::Reload {}).unwrap();
        endpoint.send(&ControlMessage::Stop {}).unwrap();

        let written = String::from_utf8(lock(&out.0).clone()).unwrap();
        assert_eq!(written, "{\"reload\":{}}\n{\"stop\":{}}\n");
    }

    #[test]
    fn shutdown_is_idempotent_and_blocks_sends() {
        let calls = Arc::new(AtomicUsize::new(0));
        let endpoint: Arc<Endpoint<WorkerMessage, ControlMessage>> =
            Endpoint::new("test", Silent, std::io::sink());
        let counter = Arc::clone(&calls);
        endpoint
            .start(|_| {}, move || {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        endpoint.shutdown();
        endpoint.shutdown();

        assert!(endpoint.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            endpoint.send(&ControlMessage::Stop {}),
            Err(HubError::ChannelClosed)
        ));
    }

    #[test]
    fn failed_write_closes_the_endpoint() {
        let endpoint: Arc<Endpoint<ControlMessage, WorkerMessage>> =
            Endpoint::new("test", Silent, BrokenPipe);
        let (closed_tx, closed_rx) = mpsc::channel();
        endpoint
            .start(|_| {}, move || closed_tx.send(()).unwrap())
            .unwrap();

        let err = endpoint
            .send(&WorkerMessage::Close { abrupt: false })
            .unwrap_err();

        assert!(matches!(err, HubError::ChannelClosed));
        closed_rx.recv_timeout(WAIT).unwrap();
        assert!(endpoint.is_closed());
    }

    #[test]
    fn starting_twice_is_rejected() {
        let endpoint: Arc<Endpoint<WorkerMessage, ControlMessage>> =
            Endpoint::new("test", std::io::empty(), std::io::sink());
        endpoint.start(|_| {}, || {}).unwrap();
        assert!(endpoint.start(|_| {}, || {}).is_err());
    }
}
