use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskCx, Poll};

use futures::channel::mpsc::{unbounded, UnboundedReceiver};

use super::{Context, ContextId, CtxFlags, CtxState, Message, MSG_SIZE};
use crate::error::{Error, Result};
use crate::task::Task;

/// Controlling handle of a context.
///
/// Only the manager can release it: pass it to
/// [`Perfmon::close`][crate::Perfmon::close]. A dropped handle keeps its
/// context allocated.
#[must_use = "a context lives until its handle is closed"]
#[derive(Debug)]
pub struct ContextHandle {
    ctx: Arc<Context>,
}

impl ContextHandle {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub(crate) fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub(crate) fn into_ctx(self) -> Arc<Context> {
        self.ctx
    }

    pub fn id(&self) -> ContextId {
        self.ctx.id()
    }

    pub fn flags(&self) -> CtxFlags {
        self.ctx.flags()
    }

    pub fn state(&self) -> CtxState {
        self.ctx.state()
    }

    /// Poll/select readiness: a message is waiting.
    pub fn readable(&self) -> bool {
        !self.ctx.lock().msgq.is_empty()
    }

    pub fn pending_msgs(&self) -> usize {
        self.ctx.lock().msgq.len()
    }

    /// Subscribes to asynchronous notification, the context id is sent
    /// every time a message is queued.
    pub fn fasync(&self) -> UnboundedReceiver<ContextId> {
        let (tx, rx) = unbounded();
        self.ctx.async_queue.lock().push(tx);
        rx
    }

    /// Polls for the next message on behalf of `reader`.
    ///
    /// Resolves with [`Error::Interrupted`] once a signal is pending for
    /// the reader.
    pub fn poll_msg(&self, cx: &mut TaskCx<'_>, reader: &Task) -> Poll<Result<Message>> {
        let mut inner = self.ctx.lock();
        if let Some(msg) = inner.msgq.pop() {
            return Poll::Ready(Ok(msg));
        }
        if reader.signal_pending() {
            return Poll::Ready(Err(Error::Interrupted));
        }
        // Registered under the context lock, a producer cannot slip in.
        self.ctx.msg_wq.register(cx.waker());
        reader.signal_wq.register(cx.waker());
        Poll::Pending
    }

    /// Waits for the next message.
    pub async fn next_msg(&self, reader: &Task) -> Result<Message> {
        struct Fut<'a>(&'a ContextHandle, &'a Task);

        impl Future for Fut<'_> {
            type Output = Result<Message>;

            fn poll(self: Pin<&mut Self>, cx: &mut TaskCx<'_>) -> Poll<Self::Output> {
                let Fut(handle, reader) = self.get_mut();
                handle.poll_msg(cx, reader)
            }
        }

        Fut(self, reader).await
    }

    /// Reads one message.
    pub fn read_msg(&self, reader: &Task, nonblock: bool) -> Result<Message> {
        if nonblock {
            return self.ctx.lock().msgq.pop().ok_or(Error::WouldBlock);
        }
        futures::executor::block_on(self.next_msg(reader))
    }

    /// Reads one encoded message into `buf`, returning its size.
    pub fn read(&self, reader: &Task, buf: &mut [u8], nonblock: bool) -> Result<usize> {
        let Some(dst) = buf.get_mut(..MSG_SIZE) else {
            return Err(Error::InvalidArgument("buffer smaller than a message"));
        };
        let msg = self.read_msg(reader, nonblock)?;
        dst.copy_from_slice(&msg.to_bytes());
        Ok(MSG_SIZE)
    }
}
