use crate::error::ExecError;
use crate::frame::Frame;
use crate::internal;

/// Per-thread LIFO of activation records, owned exclusively by one thread.
/// Created empty, grows on invoke, shrinks on return.
#[derive(Debug, Default)]
pub struct FrameStack {
    frames: Vec<Frame>,
}

impl FrameStack {
    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Result<Frame, ExecError> {
        self.frames
            .pop()
            .ok_or_else(|| internal!("frame stack is empty"))
    }

    pub fn top(&self) -> Result<&Frame, ExecError> {
        self.frames.last().ok_or_else(|| internal!("no frame found"))
    }

    pub fn top_mut(&mut self) -> Result<&mut Frame, ExecError> {
        self.frames
            .last_mut()
            .ok_or_else(|| internal!("no frame found"))
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Renders the current call chain, innermost frame first.
    pub fn stack_trace(&self) -> String {
        self.frames
            .iter()
            .rev()
            .map(|f| format!("{}.{}::{}", f.class_name, f.method_name, f.pc))
            .collect::<Vec<String>>()
            .join("\n")
    }
}
