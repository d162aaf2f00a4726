//! Test doubles: in-memory repository services, a scriptable transport
//! and callback recorders.

pub mod arbitrary;

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use git_ref_format::RefStr;

use crate::callbacks::{Callbacks, ReadinessSink};
use crate::engine::Events;
use crate::transport::Transport;
use crate::Oid;

/// Records `update_tips` and `push_update_reference` invocations.
#[derive(Clone, Default)]
pub struct Recorder {
    tips: Rc<RefCell<Vec<(String, Oid, Oid)>>>,
    pushes: Rc<RefCell<Vec<(String, Option<String>)>>>,
}

impl Recorder {
    /// A callback handle sharing this recorder's log.
    pub fn callbacks(&self) -> Recorder {
        self.clone()
    }

    pub fn tips(&self) -> Vec<(String, Oid, Oid)> {
        self.tips.borrow().clone()
    }

    pub fn pushes(&self) -> Vec<(String, Option<String>)> {
        self.pushes.borrow().clone()
    }
}

impl Callbacks for Recorder {
    fn update_tips(&mut self, name: &RefStr, old: Oid, new: Oid) {
        self.tips
            .borrow_mut()
            .push((name.as_str().to_owned(), old, new));
    }

    fn push_update_reference(&mut self, name: &str, status: Option<&str>) {
        self.pushes
            .borrow_mut()
            .push((name.to_owned(), status.map(ToOwned::to_owned)));
    }
}

/// Records the readiness request of a cooperatively suspended
/// operation.
#[derive(Clone, Default)]
pub struct ReadinessRecorder(Rc<RefCell<Option<(RawFd, Events, Option<Duration>)>>>);

impl ReadinessRecorder {
    pub fn take(&self) -> Option<(RawFd, Events, Option<Duration>)> {
        self.0.borrow_mut().take()
    }
}

impl ReadinessSink for ReadinessRecorder {
    fn set_fd_events(&mut self, fd: RawFd, interest: Events, timeout: Option<Duration>) {
        *self.0.borrow_mut() = Some((fd, interest, timeout));
    }
}

/// Callbacks for driving whole operations: provides a transport, records
/// reference updates, and optionally opts into cooperative mode.
#[derive(Default)]
pub struct OpCallbacks {
    transport: Option<Box<dyn Transport>>,
    pub recorder: Recorder,
    sink: Option<ReadinessRecorder>,
}

impl OpCallbacks {
    pub fn with_transport(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Some(Box::new(transport)),
            recorder: Recorder::default(),
            sink: None,
        }
    }

    pub fn recorded(mut self, recorder: &Recorder) -> Self {
        self.recorder = recorder.clone();
        self
    }

    pub fn cooperative(mut self, sink: &ReadinessRecorder) -> Self {
        self.sink = Some(sink.clone());
        self
    }

    pub fn boxed(self) -> Box<dyn Callbacks> {
        Box::new(self)
    }
}

impl Callbacks for OpCallbacks {
    fn transport(&mut self, _url: &str) -> Option<Box<dyn Transport>> {
        self.transport.take()
    }

    fn update_tips(&mut self, name: &RefStr, old: Oid, new: Oid) {
        self.recorder.update_tips(name, old, new);
    }

    fn push_update_reference(&mut self, name: &str, status: Option<&str>) {
        self.recorder.push_update_reference(name, status);
    }

    fn readiness(&mut self) -> Option<&mut dyn ReadinessSink> {
        self.sink
            .as_mut()
            .map(|sink| sink as &mut dyn ReadinessSink)
    }
}
