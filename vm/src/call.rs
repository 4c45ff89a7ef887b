use std::sync::Arc;

use common::{ThreadId, is_synchronized};

use crate::descriptor::{BaseType, FieldType, MethodDescriptor};
use crate::error::ExecError;
use crate::frame::Frame;
use crate::internal;
use crate::method::MethodEntry;
use crate::monitor::Monitors;
use crate::value::Value;

/// Calling convention of an invoke site. Virtual, special and interface
/// calls all carry an implicit receiver and collapse to `Instance` here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Static,
    Instance,
}

/// Builds the callee frame for a resolved method, consuming the arguments
/// (and the receiver, for instance calls) from the caller's operand stack.
///
/// Arguments were pushed left to right, so the last parameter pops first;
/// 64-bit parameters consume two operand slots and two locals. For a
/// synchronized instance method the receiver's monitor is acquired before
/// the frame is returned and released on every exit path of the callee.
pub fn build_frame(
    method: &Arc<MethodEntry>,
    kind: CallKind,
    caller: &mut Frame,
    monitors: &Monitors,
    thread: &ThreadId,
) -> Result<Frame, ExecError> {
    let descriptor = MethodDescriptor::new(&method.descriptor)?;

    let mut args = Vec::with_capacity(descriptor.parameters.len());
    for parameter in descriptor.parameters.iter().rev() {
        let value = match parameter {
            FieldType::BaseType(BaseType::Long | BaseType::Double) => caller.pop_pair()?,
            // arrays of any dimensionality and object types are one
            // reference slot
            _ => caller.pop()?,
        };
        args.push(value);
    }

    let receiver = match kind {
        CallKind::Static => None,
        CallKind::Instance => {
            let receiver = caller.pop()?;
            if !receiver.is_reference() {
                return Err(internal!(
                    "receiver of {} is not a reference, is {receiver:?}",
                    method.qualified_name()
                ));
            }
            if receiver.is_null() {
                return Err(ExecError::ApplicationException {
                    class: "java/lang/NullPointerException".to_string(),
                    message: format!("invoke of {} on a null receiver", method.qualified_name()),
                });
            }
            Some(receiver)
        }
    };

    let held_monitor = match &receiver {
        Some(receiver) if is_synchronized(method.access_flags) => {
            let id = receiver
                .reference()?
                .ok_or_else(|| internal!("null receiver after null check"))?;
            monitors
                .enter(&id, thread)
                .map_err(|_| ExecError::MonitorAcquisitionFailure {
                    method: method.qualified_name(),
                    pc: caller.pc,
                })?;
            Some(id)
        }
        _ => None,
    };

    let marshalled = descriptor.parameter_slots() + usize::from(receiver.is_some());
    let mut locals = vec![Value::Int(0); method.max_locals.max(marshalled).max(1)];

    let mut dest = 0;
    if let Some(receiver) = receiver {
        locals[0] = receiver;
        dest = 1;
    }
    for value in args.into_iter().rev() {
        if value.is_wide() {
            locals[dest] = value.clone();
            locals[dest + 1] = value;
            dest += 2;
        } else {
            locals[dest] = value;
            dest += 1;
        }
    }

    let mut frame = Frame::new(method, locals, thread.clone());
    frame.held_monitor = held_monitor;
    Ok(frame)
}

/// Builds the first frame of a thread: no caller stack to consume, local 0
/// seeded from the entry kind.
pub fn entry_frame(method: &Arc<MethodEntry>, local0: Option<Value>, thread: &ThreadId) -> Frame {
    let size = method.max_locals.max(usize::from(local0.is_some())).max(1);
    let mut locals = vec![Value::Int(0); size];
    if let Some(value) = local0 {
        locals[0] = value;
    }
    Frame::new(method, locals, thread.clone())
}
