//! The resumable operation engine.
//!
//! Remote operations are linear pipelines whose stages may block on the
//! network. Each in-flight operation is a [`Frame`] on the remote's
//! bounded continuation [`Stack`]; advancing the top frame either
//! completes it, suspends with a [`Readiness`] request, or spawns a
//! child frame (connect runs as a child of fetch and push). The stack
//! bound is deliberate and observable: overflowing it is
//! [`Error::StackLimit`], a terminal failure of the in-flight operation.
//!
//! The public face of the engine is [`crate::Remote::perform`]; the
//! dispatch loop itself lives with the `Remote`, which owns the stack.

use std::os::unix::io::RawFd;
use std::time::Duration;

use bitflags::bitflags;

use crate::fetch::FetchOp;
use crate::push::PushOp;
use crate::remote::{ConnectOp, Remote};
use crate::{Context, Error};

bitflags! {
    /// I/O readiness observed by (or requested from) the caller.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Events: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// The wait elapsed without any descriptor readiness. Stages
        /// treat this as a transport failure.
        const TIMEOUT = 1 << 2;
        const ERROR = 1 << 3;
    }
}

/// What a suspended operation is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub interest: Events,
    /// `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

/// Outcome of driving a resumable operation.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Poll<T> {
    /// The operation ran to completion.
    Ready(T),
    /// The operation would block; re-enter with
    /// [`crate::Remote::perform`] once the descriptor is ready.
    Pending(Readiness),
}

impl<T> Poll<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Unwrap a completed operation. Panics on [`Poll::Pending`]; only
    /// meaningful for synchronously driven operations, which never
    /// suspend.
    #[track_caller]
    pub fn expect_ready(self, msg: &str) -> T {
        match self {
            Self::Ready(out) => out,
            Self::Pending(_) => panic!("{msg}"),
        }
    }
}

/// Result of advancing one frame.
pub(crate) enum Advance {
    /// The frame completed; control returns to the frame below it.
    Over,
    /// The frame is waiting for I/O and stays installed.
    Pending(Readiness),
    /// Suspend this frame and run `child` first.
    Spawn(Frame),
}

/// One pending resumption on the continuation stack.
pub(crate) enum Frame {
    Connect(ConnectOp),
    Fetch(FetchOp),
    Push(PushOp),
}

impl Frame {
    pub(crate) fn advance<C: Context>(
        &mut self,
        remote: &mut Remote,
        cx: &mut C,
        events: Events,
    ) -> Result<Advance, Error> {
        match self {
            Self::Connect(op) => op.advance(remote, events),
            Self::Fetch(op) => op.advance(remote, cx, events),
            Self::Push(op) => op.advance(remote, cx, events),
        }
    }
}

/// Maximum number of pending resumptions per remote.
pub(crate) const MAX_DEPTH: usize = 4;

/// The per-remote continuation stack. A remote is *busy* iff the stack
/// is non-empty.
#[derive(Default)]
pub(crate) struct Stack {
    frames: Vec<Frame>,
}

impl Stack {
    pub fn push(&mut self, frame: Frame) -> Result<(), Error> {
        if self.frames.len() >= MAX_DEPTH {
            return Err(Error::StackLimit);
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
