//! Channel output as an `AsyncWrite`

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::AsyncWrite;

/// SSH extended data type for stderr
pub const SSH_EXTENDED_DATA_STDERR: u32 = 1;

type SendFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// Writes to a session channel through the connection [`Handle`]
///
/// At most one send is in flight; the next write or flush waits for it.
/// A closed channel surfaces as `BrokenPipe`.
pub struct ChannelWriter {
    handle: Handle,
    channel: ChannelId,
    extended: Option<u32>,
    in_flight: Option<SendFuture>,
}

impl ChannelWriter {
    pub fn stdout(handle: Handle, channel: ChannelId) -> Self {
        Self {
            handle,
            channel,
            extended: None,
            in_flight: None,
        }
    }

    pub fn stderr(handle: Handle, channel: ChannelId) -> Self {
        Self {
            extended: Some(SSH_EXTENDED_DATA_STDERR),
            ..Self::stdout(handle, channel)
        }
    }

    fn send(&self, data: &[u8]) -> SendFuture {
        let handle = self.handle.clone();
        let channel = self.channel;
        let extended = self.extended;
        let payload = CryptoVec::from_slice(data);

        Box::pin(async move {
            let sent = match extended {
                Some(code) => handle.extended_data(channel, code, payload).await,
                None => handle.data(channel, payload).await,
            };
            sent.map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))
        })
    }

    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(send) = self.in_flight.as_mut() {
            let result = ready!(send.as_mut().poll(cx));
            self.in_flight = None;
            return Poll::Ready(result);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_in_flight(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut send = this.send(buf);
        match send.as_mut().poll(cx) {
            Poll::Ready(result) => result?,
            Poll::Pending => this.in_flight = Some(send),
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_in_flight(cx)
    }

    // EOF and close are sent by the session watcher
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_in_flight(cx)
    }
}
