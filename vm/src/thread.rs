use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;

use common::{ObjectId, ThreadId, is_static};
use tracing::{debug, error, info, trace};

use crate::call::{self, CallKind};
use crate::constant_pool::CpEntry;
use crate::error::{ExceptionHandler, ExecError, HandlerOutcome, RaisedException};
use crate::internal;
use crate::method::MethodResolver;
use crate::monitor::Monitors;
use crate::object::{FieldKind, FieldTag, ObjectStore, ScalarKind};
use crate::opcode::{self, *};
use crate::stack::FrameStack;
use crate::statics::StaticTable;
use crate::value::Value;

pub const MAIN_DESCRIPTOR: &str = "([Ljava/lang/String;)V";

/// Lifecycle states visible to the execution core. Blocked and waiting
/// threads are parked inside monitor acquisition and stay `Runnable` here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    New,
    Runnable,
    Terminated,
}

#[derive(Default)]
struct RegistryInner {
    next_id: i64,
    threads: HashMap<ThreadId, ThreadState>,
}

/// Global registry of threads and their lifecycle states.
#[derive(Default)]
pub struct ThreadRegistry {
    inner: RwLock<RegistryInner>,
}

impl ThreadRegistry {
    pub fn register(&self) -> Result<ThreadId, ExecError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| internal!("lock poisoned: {e}"))?;
        inner.next_id += 1;
        let id: ThreadId = inner.next_id.into();
        inner.threads.insert(id.clone(), ThreadState::New);
        Ok(id)
    }

    pub fn transition(&self, id: &ThreadId, state: ThreadState) -> Result<(), ExecError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| internal!("lock poisoned: {e}"))?;
        inner.threads.insert(id.clone(), state);
        info!("thread {id} is now {state:?}");
        Ok(())
    }

    pub fn state(&self, id: &ThreadId) -> Result<Option<ThreadState>, ExecError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| internal!("lock poisoned: {e}"))?;
        Ok(inner.threads.get(id).copied())
    }
}

/// Result of draining one thread to completion.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    /// A Java-level exception reached the top of the frame stack with no
    /// handler taking it.
    ApplicationException { diagnostic: String },
    /// A typed execution-core error or an interpreter defect.
    Fatal { diagnostic: String },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::ApplicationException { .. } => 1,
            Self::Fatal { .. } => 2,
        }
    }
}

/// One thread of execution: a frame stack plus the shared collaborators it
/// interprets against. The frame stack is owned exclusively by this thread;
/// everything else is shared behind its own locking discipline.
pub struct ExecThread {
    id: ThreadId,
    name: String,
    stack: FrameStack,
    methods: Arc<dyn MethodResolver>,
    objects: Arc<RwLock<ObjectStore>>,
    statics: Arc<StaticTable>,
    monitors: Arc<Monitors>,
    registry: Arc<ThreadRegistry>,
    exceptions: Arc<dyn ExceptionHandler>,
    thread_object: Option<ObjectId>,
    captured_trace: Option<String>,
}

impl ExecThread {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        methods: Arc<dyn MethodResolver>,
        objects: Arc<RwLock<ObjectStore>>,
        statics: Arc<StaticTable>,
        monitors: Arc<Monitors>,
        registry: Arc<ThreadRegistry>,
        exceptions: Arc<dyn ExceptionHandler>,
    ) -> Result<Self, ExecError> {
        let id = registry.register()?;
        let thread_object = objects
            .write()
            .map_err(|e| internal!("lock poisoned: {e}"))?
            .new_thread_object(name)?;

        Ok(Self {
            id,
            name: name.to_string(),
            stack: FrameStack::default(),
            methods,
            objects,
            statics,
            monitors,
            registry,
            exceptions,
            thread_object: Some(thread_object),
            captured_trace: None,
        })
    }

    pub fn id(&self) -> &ThreadId {
        &self.id
    }

    /// Builds the initial frame for the designated program entry point:
    /// local 0 receives a `String[]` holding the application arguments.
    pub fn prepare_main(&mut self, class: &str, args: &[String]) -> Result<(), ExecError> {
        let method = self.methods.lookup(class, "main", MAIN_DESCRIPTOR)?;
        let array = self.objects_mut()?.string_array(args)?;
        let frame = call::entry_frame(&method, Some(Value::Array(array)), &self.id);
        self.stack.push(frame);
        Ok(())
    }

    /// Builds the initial frame for any other thread: local 0 receives the
    /// explicit runnable target, or this thread's own object.
    pub fn prepare_entry(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
        target: Option<ObjectId>,
    ) -> Result<(), ExecError> {
        let method = self.methods.lookup(class, name, descriptor)?;
        let receiver = target
            .or_else(|| self.thread_object.clone())
            .ok_or_else(|| internal!("thread '{}' has no receiver object", self.name))?;
        let frame = call::entry_frame(&method, Some(Value::Object(receiver)), &self.id);
        self.stack.push(frame);
        Ok(())
    }

    pub fn start(mut self) -> JoinHandle<RunOutcome> {
        std::thread::spawn(move || self.run_to_completion())
    }

    /// Drains the frame stack, with an outer recovery layer for defects in
    /// the interpreter itself. Every condition enumerated in the error
    /// taxonomy travels the `run` path below; this layer exists only for
    /// panics and must not mask the first diagnostic.
    pub fn run_to_completion(&mut self) -> RunOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let detail = panic_detail(payload.as_ref());
                let diagnostic = self
                    .captured_trace
                    .take()
                    .unwrap_or_else(|| self.stack.stack_trace());
                error!("thread '{}' panicked: {detail} at\n{diagnostic}", self.name);
                self.teardown();
                self.finish();
                RunOutcome::Fatal {
                    diagnostic: format!("{detail}\n{diagnostic}"),
                }
            }
        }
    }

    fn run(&mut self) -> RunOutcome {
        if let Err(err) = self.registry.transition(&self.id, ThreadState::Runnable) {
            return RunOutcome::Fatal {
                diagnostic: format!("{err}"),
            };
        }
        info!("thread '{}' is running", self.name);

        while !self.stack.is_empty() {
            if let Err(err) = self.interpret() {
                let diagnostic = self.stack.stack_trace();
                self.captured_trace = Some(diagnostic.clone());
                error!(
                    "thread '{}' has crashed: {err} at\n{}",
                    self.name, diagnostic
                );
                self.teardown();
                self.finish();
                return if err.is_application() {
                    RunOutcome::ApplicationException {
                        diagnostic: format!("{err}\n{diagnostic}"),
                    }
                } else {
                    RunOutcome::Fatal {
                        diagnostic: format!("{err}\n{diagnostic}"),
                    }
                };
            }
            // other runnable threads get a scheduling opportunity even when
            // the interpreted program never blocks
            std::thread::yield_now();
        }

        info!("thread '{}' has exited normally", self.name);
        self.finish();
        RunOutcome::Completed
    }

    /// Marks the thread terminated and, while holding its own monitor,
    /// notifies every thread waiting on it (join semantics).
    fn finish(&mut self) {
        let _ = self.registry.transition(&self.id, ThreadState::Terminated);
        if let Some(object) = self.thread_object.clone()
            && self.monitors.enter(&object, &self.id).is_ok()
        {
            let _ = self.monitors.notify_all(&object);
            let _ = self.monitors.exit(&object, &self.id);
        }
    }

    /// Unwinds every remaining frame, releasing held monitors.
    fn teardown(&mut self) {
        while !self.stack.is_empty() {
            let _ = self.pop_frame();
        }
    }

    fn pop_frame(&mut self) -> Result<(), ExecError> {
        let frame = self.stack.pop()?;
        if let Some(id) = &frame.held_monitor {
            self.monitors.exit(id, &self.id)?;
        }
        Ok(())
    }

    fn objects(&self) -> Result<RwLockReadGuard<'_, ObjectStore>, ExecError> {
        self.objects
            .read()
            .map_err(|e| internal!("lock poisoned: {e}"))
    }

    fn objects_mut(&self) -> Result<RwLockWriteGuard<'_, ObjectStore>, ExecError> {
        self.objects
            .write()
            .map_err(|e| internal!("lock poisoned: {e}"))
    }

    /// Offers a Java-level exception to the host exception mechanism; if
    /// nothing catches it, it surfaces as an error to the runner.
    fn throw(&mut self, class: &str, message: String) -> Result<(), ExecError> {
        let exception = RaisedException {
            class: class.to_string(),
            message,
        };
        let stack_trace = self.stack.stack_trace();
        match self.exceptions.raise(&exception, &stack_trace) {
            HandlerOutcome::Caught => Ok(()),
            HandlerOutcome::Uncaught => Err(ExecError::ApplicationException {
                class: exception.class,
                message: exception.message,
            }),
        }
    }

    /// Runs the top frame until it pushes or pops a frame, or an error
    /// surfaces. The runner calls this in a drain loop.
    pub fn interpret(&mut self) -> Result<(), ExecError> {
        loop {
            let frame = self.stack.top()?;
            if frame.pc >= frame.code.len() {
                // ran off the end of the method: same as a void return
                self.pop_frame()?;
                return Ok(());
            }

            let depth = self.stack.depth();
            self.step()?;
            if self.stack.depth() != depth {
                return Ok(());
            }
        }
    }

    /// Decodes and executes exactly one instruction of the top frame.
    fn step(&mut self) -> Result<(), ExecError> {
        let frame = self.stack.top()?;
        let opcode = frame.byte_at(frame.pc)?;
        trace!(
            "class: {}, meth: {}, pc: {}, inst: {}, tos: {}",
            frame.class_name,
            frame.method_name,
            frame.pc,
            opcode::name(opcode),
            frame.tos()
        );

        match opcode {
            NOP => self.advance(1)?,
            ACONST_NULL => self.push1(Value::Null)?,
            ICONST_M1 => self.push1(Value::Int(-1))?,
            ICONST_0 => self.push1(Value::Int(0))?,
            ICONST_1 => self.push1(Value::Int(1))?,
            ICONST_2 => self.push1(Value::Int(2))?,
            ICONST_3 => self.push1(Value::Int(3))?,
            ICONST_4 => self.push1(Value::Int(4))?,
            ICONST_5 => self.push1(Value::Int(5))?,
            LCONST_0 => self.push2(Value::Long(0))?,
            LCONST_1 => self.push2(Value::Long(1))?,
            FCONST_0 => self.push1(Value::Float(0.0))?,
            FCONST_1 => self.push1(Value::Float(1.0))?,
            FCONST_2 => self.push1(Value::Float(2.0))?,
            DCONST_0 => self.push2(Value::Double(0.0))?,
            DCONST_1 => self.push2(Value::Double(1.0))?,
            BIPUSH => {
                let f = self.stack.top_mut()?;
                let value = f.operand_u8(1)? as i8 as i32;
                f.push(Value::Int(value))?;
                f.pc += 2;
            }
            SIPUSH => {
                let f = self.stack.top_mut()?;
                let value = f.operand_i16(1)? as i32;
                f.push(Value::Int(value))?;
                f.pc += 3;
            }
            LDC => self.ldc(false)?,
            LDC_W => self.ldc(true)?,
            LDC2_W => self.ldc2()?,
            ILOAD | FLOAD | ALOAD => self.load_indexed(false)?,
            LLOAD | DLOAD => self.load_indexed(true)?,
            ILOAD_0 | FLOAD_0 | ALOAD_0 => self.load(0)?,
            ILOAD_1 | FLOAD_1 | ALOAD_1 => self.load(1)?,
            ILOAD_2 | FLOAD_2 | ALOAD_2 => self.load(2)?,
            ILOAD_3 | FLOAD_3 | ALOAD_3 => self.load(3)?,
            LLOAD_0 | DLOAD_0 => self.load_pair(0)?,
            LLOAD_1 | DLOAD_1 => self.load_pair(1)?,
            LLOAD_2 | DLOAD_2 => self.load_pair(2)?,
            LLOAD_3 | DLOAD_3 => self.load_pair(3)?,
            IALOAD | FALOAD | AALOAD | BALOAD | CALOAD | SALOAD => self.array_load(false)?,
            LALOAD | DALOAD => self.array_load(true)?,
            ISTORE | FSTORE | ASTORE => self.store_indexed(false)?,
            LSTORE | DSTORE => self.store_indexed(true)?,
            ISTORE_0 | FSTORE_0 | ASTORE_0 => self.store(0)?,
            ISTORE_1 | FSTORE_1 | ASTORE_1 => self.store(1)?,
            ISTORE_2 | FSTORE_2 | ASTORE_2 => self.store(2)?,
            ISTORE_3 | FSTORE_3 | ASTORE_3 => self.store(3)?,
            LSTORE_0 | DSTORE_0 => self.store_pair(0)?,
            LSTORE_1 | DSTORE_1 => self.store_pair(1)?,
            LSTORE_2 | DSTORE_2 => self.store_pair(2)?,
            LSTORE_3 | DSTORE_3 => self.store_pair(3)?,
            IASTORE | FASTORE | AASTORE | BASTORE | CASTORE | SASTORE => {
                self.array_store(false)?
            }
            LASTORE | DASTORE => self.array_store(true)?,
            POP => self.pop1()?,
            POP2 => self.pop2()?,
            DUP => self.dup()?,
            DUP_X1 => self.dup_x1()?,
            DUP_X2 => self.dup_x2()?,
            DUP2 => self.dup2()?,
            DUP2_X1 => self.dup2_x1()?,
            DUP2_X2 => self.dup2_x2()?,
            SWAP => self.swap()?,
            IADD => self.int_binop(i32::wrapping_add)?,
            LADD => self.long_binop(i64::wrapping_add)?,
            FADD => self.float_binop(|a, b| a + b)?,
            DADD => self.double_binop(|a, b| a + b)?,
            ISUB => self.int_binop(i32::wrapping_sub)?,
            LSUB => self.long_binop(i64::wrapping_sub)?,
            FSUB => self.float_binop(|a, b| a - b)?,
            DSUB => self.double_binop(|a, b| a - b)?,
            IMUL => self.int_binop(i32::wrapping_mul)?,
            LMUL => self.long_binop(i64::wrapping_mul)?,
            FMUL => self.float_binop(|a, b| a * b)?,
            DMUL => self.double_binop(|a, b| a * b)?,
            IDIV => self.int_div(false)?,
            LDIV => self.long_div(false)?,
            FDIV => self.float_binop(|a, b| a / b)?,
            DDIV => self.double_binop(|a, b| a / b)?,
            IREM => self.int_div(true)?,
            LREM => self.long_div(true)?,
            FREM => self.float_binop(|a, b| a % b)?,
            DREM => self.double_binop(|a, b| a % b)?,
            INEG => self.int_unop(i32::wrapping_neg)?,
            LNEG => self.long_unop(i64::wrapping_neg)?,
            FNEG => self.float_unop(|v| -v)?,
            DNEG => self.double_unop(|v| -v)?,
            ISHL => self.int_shift(|v, s| v.wrapping_shl(s))?,
            LSHL => self.long_shift(|v, s| v.wrapping_shl(s))?,
            ISHR => self.int_shift(|v, s| v.wrapping_shr(s))?,
            LSHR => self.long_shift(|v, s| v.wrapping_shr(s))?,
            IUSHR => self.int_shift(|v, s| ((v as u32) >> s) as i32)?,
            LUSHR => self.long_shift(|v, s| ((v as u64) >> s) as i64)?,
            IAND => self.int_binop(|a, b| a & b)?,
            LAND => self.long_binop(|a, b| a & b)?,
            IOR => self.int_binop(|a, b| a | b)?,
            LOR => self.long_binop(|a, b| a | b)?,
            IXOR => self.int_binop(|a, b| a ^ b)?,
            LXOR => self.long_binop(|a, b| a ^ b)?,
            IINC => self.iinc()?,
            I2L => {
                let f = self.stack.top_mut()?;
                let value = f.pop()?.int()?;
                f.push_long(value as i64)?;
                f.pc += 1;
            }
            I2F => {
                let f = self.stack.top_mut()?;
                let value = f.pop()?.int()?;
                f.push(Value::Float(value as f32))?;
                f.pc += 1;
            }
            I2D => {
                let f = self.stack.top_mut()?;
                let value = f.pop()?.int()?;
                f.push_double(value as f64)?;
                f.pc += 1;
            }
            L2I => {
                let f = self.stack.top_mut()?;
                let value = f.pop_long()?;
                f.push(Value::Int(value as i32))?;
                f.pc += 1;
            }
            L2F => {
                let f = self.stack.top_mut()?;
                let value = f.pop_long()?;
                f.push(Value::Float(value as f32))?;
                f.pc += 1;
            }
            L2D => {
                let f = self.stack.top_mut()?;
                let value = f.pop_long()?;
                f.push_double(value as f64)?;
                f.pc += 1;
            }
            F2I => {
                let f = self.stack.top_mut()?;
                let value = f.pop()?.float()?;
                f.push(Value::Int(value as i32))?;
                f.pc += 1;
            }
            F2L => {
                let f = self.stack.top_mut()?;
                let value = f.pop()?.float()?;
                f.push_long(value as i64)?;
                f.pc += 1;
            }
            F2D => {
                let f = self.stack.top_mut()?;
                let value = f.pop()?.float()?;
                f.push_double(value as f64)?;
                f.pc += 1;
            }
            D2I => {
                let f = self.stack.top_mut()?;
                let value = f.pop_double()?;
                f.push(Value::Int(value as i32))?;
                f.pc += 1;
            }
            D2L => {
                let f = self.stack.top_mut()?;
                let value = f.pop_double()?;
                f.push_long(value as i64)?;
                f.pc += 1;
            }
            D2F => {
                let f = self.stack.top_mut()?;
                let value = f.pop_double()?;
                f.push(Value::Float(value as f32))?;
                f.pc += 1;
            }
            I2B => self.int_unop(|v| v as i8 as i32)?,
            I2C => self.int_unop(|v| v as u16 as i32)?,
            I2S => self.int_unop(|v| v as i16 as i32)?,
            LCMP => self.lcmp()?,
            FCMPL => self.fcmp(-1)?,
            FCMPG => self.fcmp(1)?,
            DCMPL => self.dcmp(-1)?,
            DCMPG => self.dcmp(1)?,
            IFEQ => self.if_int(|v| v == 0)?,
            IFNE => self.if_int(|v| v != 0)?,
            IFLT => self.if_int(|v| v < 0)?,
            IFGE => self.if_int(|v| v >= 0)?,
            IFGT => self.if_int(|v| v > 0)?,
            IFLE => self.if_int(|v| v <= 0)?,
            IF_ICMPEQ => self.if_icmp(|a, b| a == b)?,
            IF_ICMPNE => self.if_icmp(|a, b| a != b)?,
            IF_ICMPLT => self.if_icmp(|a, b| a < b)?,
            IF_ICMPGE => self.if_icmp(|a, b| a >= b)?,
            IF_ICMPGT => self.if_icmp(|a, b| a > b)?,
            IF_ICMPLE => self.if_icmp(|a, b| a <= b)?,
            IF_ACMPEQ => self.if_acmp(true)?,
            IF_ACMPNE => self.if_acmp(false)?,
            GOTO => {
                let f = self.stack.top_mut()?;
                let offset = f.operand_i16(1)?;
                f.pc = (f.pc as i64 + offset as i64) as usize;
            }
            GOTO_W => {
                let f = self.stack.top_mut()?;
                let offset = f.operand_i32(1)?;
                f.pc = (f.pc as i64 + offset as i64) as usize;
            }
            TABLESWITCH => self.table_switch()?,
            LOOKUPSWITCH => self.lookup_switch()?,
            IRETURN | FRETURN | ARETURN => self.return_value(false)?,
            LRETURN | DRETURN => self.return_value(true)?,
            RETURN => self.pop_frame()?,
            GETSTATIC => self.get_static()?,
            PUTSTATIC => self.put_static()?,
            GETFIELD => self.get_field()?,
            PUTFIELD => self.put_field()?,
            INVOKEVIRTUAL | INVOKESPECIAL => self.invoke(CallKind::Instance, 3)?,
            INVOKESTATIC => self.invoke(CallKind::Static, 3)?,
            INVOKEINTERFACE => self.invoke(CallKind::Instance, 5)?,
            NEW => self.new_object()?,
            NEWARRAY => self.new_array()?,
            ANEWARRAY => self.a_new_array()?,
            ARRAYLENGTH => self.array_length()?,
            ATHROW => self.athrow()?,
            MONITORENTER => self.monitor_enter()?,
            MONITOREXIT => self.monitor_exit()?,
            WIDE => {
                let f = self.stack.top_mut()?;
                f.wide = true;
                f.pc += 1;
            }
            IFNULL => self.if_null_branch(true)?,
            IFNONNULL => self.if_null_branch(false)?,
            opcode => {
                let f = self.stack.top()?;
                return Err(ExecError::InvalidBytecode {
                    class: f.class_name.clone(),
                    method: f.method_name.clone(),
                    pc: f.pc,
                    opcode,
                });
            }
        }

        Ok(())
    }

    // === per-opcode helpers, roughly in opcode order ===

    fn advance(&mut self, by: usize) -> Result<(), ExecError> {
        self.stack.top_mut()?.pc += by;
        Ok(())
    }

    fn push1(&mut self, value: Value) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        f.push(value)?;
        f.pc += 1;
        Ok(())
    }

    fn push2(&mut self, value: Value) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        f.push_pair(value)?;
        f.pc += 1;
        Ok(())
    }

    fn ldc(&mut self, wide_index: bool) -> Result<(), ExecError> {
        let (index, advance, cp) = {
            let f = self.stack.top()?;
            if wide_index {
                (f.operand_u16(1)?, 3, f.constant_pool.clone())
            } else {
                (f.operand_u8(1)? as u16, 2, f.constant_pool.clone())
            }
        };

        let value = match cp.entry(index)? {
            CpEntry::Integer(v) => Value::Int(*v),
            CpEntry::Float(v) => Value::Float(*v),
            CpEntry::StringConst(s) => {
                let id = self.objects_mut()?.allocate_string(s.clone());
                Value::Object(id)
            }
            entry => {
                return Err(ExecError::ConstantPoolTypeMismatch {
                    index,
                    expected: "loadable one-slot constant",
                    actual: entry.kind(),
                });
            }
        };

        let f = self.stack.top_mut()?;
        f.push(value)?;
        f.pc += advance;
        Ok(())
    }

    fn ldc2(&mut self) -> Result<(), ExecError> {
        let (index, cp) = {
            let f = self.stack.top()?;
            (f.operand_u16(1)?, f.constant_pool.clone())
        };

        let value = match cp.entry(index)? {
            CpEntry::Long(v) => Value::Long(*v),
            CpEntry::Double(v) => Value::Double(*v),
            entry => {
                return Err(ExecError::ConstantPoolTypeMismatch {
                    index,
                    expected: "long or double constant",
                    actual: entry.kind(),
                });
            }
        };

        let f = self.stack.top_mut()?;
        f.push_pair(value)?;
        f.pc += 3;
        Ok(())
    }

    fn load(&mut self, index: usize) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let value = f.local(index)?;
        f.push(value)?;
        f.pc += 1;
        Ok(())
    }

    fn load_pair(&mut self, index: usize) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let value = f.local(index)?;
        f.push_pair(value)?;
        f.pc += 1;
        Ok(())
    }

    fn load_indexed(&mut self, two_slot: bool) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let (index, width) = f.index_operand()?;
        let value = f.local(index)?;
        if two_slot {
            f.push_pair(value)?;
        } else {
            f.push(value)?;
        }
        f.pc += width + 1;
        Ok(())
    }

    fn store(&mut self, index: usize) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let value = f.pop()?;
        f.set_local(index, value)?;
        f.pc += 1;
        Ok(())
    }

    fn store_pair(&mut self, index: usize) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let value = f.pop_pair()?;
        f.set_local_pair(index, value)?;
        f.pc += 1;
        Ok(())
    }

    fn store_indexed(&mut self, two_slot: bool) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let (index, width) = f.index_operand()?;
        if two_slot {
            let value = f.pop_pair()?;
            f.set_local_pair(index, value)?;
        } else {
            let value = f.pop()?;
            f.set_local(index, value)?;
        }
        f.pc += width + 1;
        Ok(())
    }

    fn array_load(&mut self, two_slot: bool) -> Result<(), ExecError> {
        let (index, arrayref) = {
            let f = self.stack.top_mut()?;
            (f.pop()?.int()?, f.pop()?)
        };
        let Some(id) = arrayref.reference()? else {
            return self.throw(
                "java/lang/NullPointerException",
                "array load from a null reference".to_string(),
            );
        };

        let length = self.objects()?.array_length(&id)?;
        if index < 0 || index as usize >= length {
            return self.throw(
                "java/lang/ArrayIndexOutOfBoundsException",
                format!("index {index} out of bounds for length {length}"),
            );
        }

        let value = self.objects()?.array_get(&id, index as usize)?;
        if two_slot != value.is_wide() {
            return Err(internal!(
                "array element width does not match the bytecode: {value:?}"
            ));
        }

        let f = self.stack.top_mut()?;
        if two_slot {
            f.push_pair(value)?;
        } else {
            f.push(value)?;
        }
        f.pc += 1;
        Ok(())
    }

    fn array_store(&mut self, two_slot: bool) -> Result<(), ExecError> {
        let (value, index, arrayref) = {
            let f = self.stack.top_mut()?;
            let value = if two_slot { f.pop_pair()? } else { f.pop()? };
            (value, f.pop()?.int()?, f.pop()?)
        };
        let Some(id) = arrayref.reference()? else {
            return self.throw(
                "java/lang/NullPointerException",
                "array store to a null reference".to_string(),
            );
        };

        let length = self.objects()?.array_length(&id)?;
        if index < 0 || index as usize >= length {
            return self.throw(
                "java/lang/ArrayIndexOutOfBoundsException",
                format!("index {index} out of bounds for length {length}"),
            );
        }

        self.objects_mut()?.array_set(&id, index as usize, value)?;
        self.advance(1)
    }

    fn pop1(&mut self) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let value = f.pop()?;
        if value.is_wide() {
            return Err(internal!(
                "pop value has to be of computational type category 1, is {value:?}"
            ));
        }
        f.pc += 1;
        Ok(())
    }

    fn pop2(&mut self) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        f.pop()?;
        f.pop()?;
        f.pc += 1;
        Ok(())
    }

    fn dup(&mut self) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let value = f.peek()?.clone();
        f.push(value)?;
        f.pc += 1;
        Ok(())
    }

    fn dup_x1(&mut self) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let top = f.pop()?;
        let next = f.pop()?;
        f.push(top.clone())?;
        f.push(next)?;
        f.push(top)?;
        f.pc += 1;
        Ok(())
    }

    fn dup_x2(&mut self) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let v1 = f.pop()?;
        let v2 = f.pop()?;
        let v3 = f.pop()?;
        f.push(v1.clone())?;
        f.push(v3)?;
        f.push(v2)?;
        f.push(v1)?;
        f.pc += 1;
        Ok(())
    }

    fn dup2(&mut self) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let v1 = f.pop()?;
        let v2 = f.pop()?;
        f.push(v2.clone())?;
        f.push(v1.clone())?;
        f.push(v2)?;
        f.push(v1)?;
        f.pc += 1;
        Ok(())
    }

    fn dup2_x1(&mut self) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let v1 = f.pop()?;
        let v2 = f.pop()?;
        let v3 = f.pop()?;
        f.push(v2.clone())?;
        f.push(v1.clone())?;
        f.push(v3)?;
        f.push(v2)?;
        f.push(v1)?;
        f.pc += 1;
        Ok(())
    }

    fn dup2_x2(&mut self) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let v1 = f.pop()?;
        let v2 = f.pop()?;
        let v3 = f.pop()?;
        let v4 = f.pop()?;
        f.push(v2.clone())?;
        f.push(v1.clone())?;
        f.push(v4)?;
        f.push(v3)?;
        f.push(v2)?;
        f.push(v1)?;
        f.pc += 1;
        Ok(())
    }

    fn swap(&mut self) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let v1 = f.pop()?;
        let v2 = f.pop()?;
        f.push(v1)?;
        f.push(v2)?;
        f.pc += 1;
        Ok(())
    }

    fn int_binop(&mut self, op: fn(i32, i32) -> i32) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let v2 = f.pop()?.int()?;
        let v1 = f.pop()?.int()?;
        f.push(Value::Int(op(v1, v2)))?;
        f.pc += 1;
        Ok(())
    }

    fn long_binop(&mut self, op: fn(i64, i64) -> i64) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let v2 = f.pop_long()?;
        let v1 = f.pop_long()?;
        f.push_long(op(v1, v2))?;
        f.pc += 1;
        Ok(())
    }

    fn float_binop(&mut self, op: fn(f32, f32) -> f32) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let v2 = f.pop()?.float()?;
        let v1 = f.pop()?.float()?;
        f.push(Value::Float(op(v1, v2)))?;
        f.pc += 1;
        Ok(())
    }

    fn double_binop(&mut self, op: fn(f64, f64) -> f64) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let v2 = f.pop_double()?;
        let v1 = f.pop_double()?;
        f.push_double(op(v1, v2))?;
        f.pc += 1;
        Ok(())
    }

    fn division_by_zero(&self) -> ExecError {
        match self.stack.top() {
            Ok(f) => ExecError::DivisionByZero {
                class: f.class_name.clone(),
                method: f.method_name.clone(),
                pc: f.pc,
            },
            Err(err) => err,
        }
    }

    fn int_div(&mut self, remainder: bool) -> Result<(), ExecError> {
        let (v1, v2) = {
            let f = self.stack.top_mut()?;
            let v2 = f.pop()?.int()?;
            let v1 = f.pop()?.int()?;
            (v1, v2)
        };
        if v2 == 0 {
            return Err(self.division_by_zero());
        }
        let result = if remainder {
            v1.wrapping_rem(v2)
        } else {
            v1.wrapping_div(v2)
        };
        let f = self.stack.top_mut()?;
        f.push(Value::Int(result))?;
        f.pc += 1;
        Ok(())
    }

    fn long_div(&mut self, remainder: bool) -> Result<(), ExecError> {
        let (v1, v2) = {
            let f = self.stack.top_mut()?;
            let v2 = f.pop_long()?;
            let v1 = f.pop_long()?;
            (v1, v2)
        };
        if v2 == 0 {
            return Err(self.division_by_zero());
        }
        let result = if remainder {
            v1.wrapping_rem(v2)
        } else {
            v1.wrapping_div(v2)
        };
        let f = self.stack.top_mut()?;
        f.push_long(result)?;
        f.pc += 1;
        Ok(())
    }

    fn int_unop(&mut self, op: fn(i32) -> i32) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let value = f.pop()?.int()?;
        f.push(Value::Int(op(value)))?;
        f.pc += 1;
        Ok(())
    }

    fn long_unop(&mut self, op: fn(i64) -> i64) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let value = f.pop_long()?;
        f.push_long(op(value))?;
        f.pc += 1;
        Ok(())
    }

    fn float_unop(&mut self, op: fn(f32) -> f32) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let value = f.pop()?.float()?;
        f.push(Value::Float(op(value)))?;
        f.pc += 1;
        Ok(())
    }

    fn double_unop(&mut self, op: fn(f64) -> f64) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let value = f.pop_double()?;
        f.push_double(op(value))?;
        f.pc += 1;
        Ok(())
    }

    /// Shift amounts are ints and use only their low five bits.
    fn int_shift(&mut self, op: fn(i32, u32) -> i32) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let shift = f.pop()?.int()?;
        let value = f.pop()?.int()?;
        f.push(Value::Int(op(value, (shift & 0x1f) as u32)))?;
        f.pc += 1;
        Ok(())
    }

    /// The shift amount of a long shift is a one-slot int; only its low
    /// six bits are used.
    fn long_shift(&mut self, op: fn(i64, u32) -> i64) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let shift = f.pop()?.int()?;
        let value = f.pop_long()?;
        f.push_long(op(value, (shift & 0x3f) as u32))?;
        f.pc += 1;
        Ok(())
    }

    fn iinc(&mut self) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let (index, increment, advance) = if f.wide {
            f.wide = false;
            (
                f.operand_u16(1)? as usize,
                f.operand_i16(3)? as i32,
                5,
            )
        } else {
            (
                f.operand_u8(1)? as usize,
                f.operand_u8(2)? as i8 as i32,
                3,
            )
        };
        let original = f.local(index)?.int()?;
        f.set_local(index, Value::Int(original.wrapping_add(increment)))?;
        f.pc += advance;
        Ok(())
    }

    fn lcmp(&mut self) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let v2 = f.pop_long()?;
        let v1 = f.pop_long()?;
        let result = match v1.cmp(&v2) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        };
        f.push(Value::Int(result))?;
        f.pc += 1;
        Ok(())
    }

    /// `nan_result` is 1 for the G variant and -1 for the L variant.
    fn fcmp(&mut self, nan_result: i32) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let v2 = f.pop()?.float()?;
        let v1 = f.pop()?.float()?;
        let result = if v1.is_nan() || v2.is_nan() {
            nan_result
        } else if v1 < v2 {
            -1
        } else if v1 > v2 {
            1
        } else {
            0
        };
        f.push(Value::Int(result))?;
        f.pc += 1;
        Ok(())
    }

    fn dcmp(&mut self, nan_result: i32) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let v2 = f.pop_double()?;
        let v1 = f.pop_double()?;
        let result = if v1.is_nan() || v2.is_nan() {
            nan_result
        } else if v1 < v2 {
            -1
        } else if v1 > v2 {
            1
        } else {
            0
        };
        f.push(Value::Int(result))?;
        f.pc += 1;
        Ok(())
    }

    fn branch(&mut self, taken: bool) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        if taken {
            let offset = f.operand_i16(1)?;
            f.pc = (f.pc as i64 + offset as i64) as usize;
        } else {
            f.pc += 3;
        }
        Ok(())
    }

    fn if_int(&mut self, predicate: fn(i32) -> bool) -> Result<(), ExecError> {
        let value = self.stack.top_mut()?.pop()?.int()?;
        self.branch(predicate(value))
    }

    fn if_icmp(&mut self, predicate: fn(i32, i32) -> bool) -> Result<(), ExecError> {
        let (v1, v2) = {
            let f = self.stack.top_mut()?;
            let v2 = f.pop()?.int()?;
            let v1 = f.pop()?.int()?;
            (v1, v2)
        };
        self.branch(predicate(v1, v2))
    }

    fn if_acmp(&mut self, want_equal: bool) -> Result<(), ExecError> {
        let (v1, v2) = {
            let f = self.stack.top_mut()?;
            let v2 = f.pop()?;
            let v1 = f.pop()?;
            (v1, v2)
        };
        if !v1.is_reference() || !v2.is_reference() {
            return Err(internal!(
                "reference comparison of non-references: {v1:?}, {v2:?}"
            ));
        }
        self.branch((v1 == v2) == want_equal)
    }

    fn if_null_branch(&mut self, want_null: bool) -> Result<(), ExecError> {
        let value = self.stack.top_mut()?.pop()?;
        if !value.is_reference() {
            return Err(internal!("null check of a non-reference: {value:?}"));
        }
        self.branch(value.is_null() == want_null)
    }

    fn table_switch(&mut self) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let base = f.pc;
        // operands start at the next 4-byte boundary after the opcode
        let mut cursor = base + 1;
        cursor += (4 - (cursor % 4)) % 4;

        let default = f.i32_at(cursor)?;
        let low = f.i32_at(cursor + 4)?;
        let high = f.i32_at(cursor + 8)?;

        let index = f.pop()?.int()?;
        let offset = if index < low || index > high {
            default
        } else {
            f.i32_at(cursor + 12 + ((index - low) as usize) * 4)?
        };
        f.pc = (base as i64 + offset as i64) as usize;
        Ok(())
    }

    fn lookup_switch(&mut self) -> Result<(), ExecError> {
        let f = self.stack.top_mut()?;
        let base = f.pc;
        let mut cursor = base + 1;
        cursor += (4 - (cursor % 4)) % 4;

        let default = f.i32_at(cursor)?;
        let npairs = f.i32_at(cursor + 4)?;

        let key = f.pop()?.int()?;
        let mut offset = default;
        for pair in 0..npairs as usize {
            let at = cursor + 8 + pair * 8;
            if f.i32_at(at)? == key {
                offset = f.i32_at(at + 4)?;
                break;
            }
        }
        f.pc = (base as i64 + offset as i64) as usize;
        Ok(())
    }

    fn return_value(&mut self, two_slot: bool) -> Result<(), ExecError> {
        let value = {
            let f = self.stack.top_mut()?;
            if two_slot { f.pop_pair()? } else { f.pop()? }
        };
        self.pop_frame()?;

        // with no caller left the thread's entry method returned a value,
        // which has nowhere to go
        if !self.stack.is_empty() {
            let caller = self.stack.top_mut()?;
            if two_slot {
                caller.push_pair(value)?;
            } else {
                caller.push(value)?;
            }
        }
        Ok(())
    }

    fn get_static(&mut self) -> Result<(), ExecError> {
        let (index, cp) = {
            let f = self.stack.top()?;
            (f.operand_u16(1)?, f.constant_pool.clone())
        };
        let field = cp.field_ref(index)?;
        if !field.is_static {
            return Err(ExecError::FieldAccessMismatch {
                field: field.qualified_name(),
                accessed: "static",
                actual: "instance",
            });
        }

        let tag = FieldTag::of(field.descriptor, true)?;
        let value = self.statics.get(field.class, field.name, tag)?;

        let f = self.stack.top_mut()?;
        if value.is_wide() {
            f.push_pair(value)?;
        } else {
            f.push(value)?;
        }
        f.pc += 3;
        Ok(())
    }

    fn put_static(&mut self) -> Result<(), ExecError> {
        let (index, cp) = {
            let f = self.stack.top()?;
            (f.operand_u16(1)?, f.constant_pool.clone())
        };
        let field = cp.field_ref(index)?;
        if !field.is_static {
            return Err(ExecError::FieldAccessMismatch {
                field: field.qualified_name(),
                accessed: "static",
                actual: "instance",
            });
        }

        let tag = FieldTag::of(field.descriptor, true)?;
        let value = {
            let f = self.stack.top_mut()?;
            if matches!(tag.kind, FieldKind::Long | FieldKind::Double) {
                f.pop_pair()?
            } else {
                f.pop()?
            }
        };
        self.statics.set(field.class, field.name, tag, value)?;
        self.advance(3)
    }

    fn get_field(&mut self) -> Result<(), ExecError> {
        let (index, cp) = {
            let f = self.stack.top()?;
            (f.operand_u16(1)?, f.constant_pool.clone())
        };
        let field = cp.field_ref(index)?;
        if field.is_static {
            return Err(ExecError::FieldAccessMismatch {
                field: field.qualified_name(),
                accessed: "instance",
                actual: "static",
            });
        }

        let tag = FieldTag::of(field.descriptor, false)?;
        let objectref = self.stack.top_mut()?.pop()?;
        let Some(id) = objectref.reference()? else {
            return self.throw(
                "java/lang/NullPointerException",
                format!("getfield {} on a null reference", field.qualified_name()),
            );
        };

        let value = self.objects()?.get_field(&id, field.name, tag)?;
        let f = self.stack.top_mut()?;
        if value.is_wide() {
            f.push_pair(value)?;
        } else {
            f.push(value)?;
        }
        f.pc += 3;
        Ok(())
    }

    fn put_field(&mut self) -> Result<(), ExecError> {
        let (index, cp) = {
            let f = self.stack.top()?;
            (f.operand_u16(1)?, f.constant_pool.clone())
        };
        // the entry kind is checked before any operand is consumed, so a
        // mismatch leaves the target object untouched
        let field = cp.field_ref(index)?;
        if field.is_static {
            return Err(ExecError::FieldAccessMismatch {
                field: field.qualified_name(),
                accessed: "instance",
                actual: "static",
            });
        }

        let tag = FieldTag::of(field.descriptor, false)?;
        let (value, objectref) = {
            let f = self.stack.top_mut()?;
            let value = if matches!(tag.kind, FieldKind::Long | FieldKind::Double) {
                f.pop_pair()?
            } else {
                f.pop()?
            };
            (value, f.pop()?)
        };
        let Some(id) = objectref.reference()? else {
            return self.throw(
                "java/lang/NullPointerException",
                format!("putfield {} on a null reference", field.qualified_name()),
            );
        };

        self.objects_mut()?.set_field(&id, field.name, tag, value)?;
        self.advance(3)
    }

    fn invoke(&mut self, kind: CallKind, advance: usize) -> Result<(), ExecError> {
        let (index, cp) = {
            let f = self.stack.top()?;
            (f.operand_u16(1)?, f.constant_pool.clone())
        };
        let method_ref = cp.method_ref(index)?;
        let method = self
            .methods
            .lookup(method_ref.class, method_ref.name, method_ref.descriptor)?;
        if (kind == CallKind::Static) != is_static(method.access_flags) {
            return Err(internal!(
                "{} static flag does not match its call site",
                method.qualified_name()
            ));
        }
        debug!("invoking {}", method.qualified_name());

        // the caller resumes past the operand bytes once the callee returns
        self.stack.top_mut()?.pc += advance;

        let built = call::build_frame(
            &method,
            kind,
            self.stack.top_mut()?,
            &self.monitors,
            &self.id,
        );
        match built {
            Ok(frame) => {
                self.stack.push(frame);
                Ok(())
            }
            Err(ExecError::ApplicationException { class, message }) => self.throw(&class, message),
            Err(err) => Err(err),
        }
    }

    fn new_object(&mut self) -> Result<(), ExecError> {
        let (index, cp) = {
            let f = self.stack.top()?;
            (f.operand_u16(1)?, f.constant_pool.clone())
        };
        let class_name = cp.class_ref(index)?;
        let id = self.objects_mut()?.allocate_instance(class_name);
        let f = self.stack.top_mut()?;
        f.push(Value::Object(id))?;
        f.pc += 3;
        Ok(())
    }

    fn new_array(&mut self) -> Result<(), ExecError> {
        let (atype, count) = {
            let f = self.stack.top_mut()?;
            (f.operand_u8(1)?, f.pop()?.int()?)
        };
        if count < 0 {
            return self.throw(
                "java/lang/NegativeArraySizeException",
                count.to_string(),
            );
        }
        let kind = ScalarKind::from_atype(atype)?;
        let id = self.objects_mut()?.allocate_scalar_array(kind, count as usize);
        let f = self.stack.top_mut()?;
        f.push(Value::Array(id))?;
        f.pc += 2;
        Ok(())
    }

    fn a_new_array(&mut self) -> Result<(), ExecError> {
        let (index, count, cp) = {
            let f = self.stack.top_mut()?;
            (f.operand_u16(1)?, f.pop()?.int()?, f.constant_pool.clone())
        };
        if count < 0 {
            return self.throw(
                "java/lang/NegativeArraySizeException",
                count.to_string(),
            );
        }
        let class_name = cp.class_ref(index)?;
        let id = self
            .objects_mut()?
            .allocate_reference_array(class_name, count as usize);
        let f = self.stack.top_mut()?;
        f.push(Value::Array(id))?;
        f.pc += 3;
        Ok(())
    }

    fn array_length(&mut self) -> Result<(), ExecError> {
        let arrayref = self.stack.top_mut()?.pop()?;
        let Some(id) = arrayref.reference()? else {
            return self.throw(
                "java/lang/NullPointerException",
                "arraylength of a null reference".to_string(),
            );
        };
        let length = self.objects()?.array_length(&id)?;
        let f = self.stack.top_mut()?;
        f.push(Value::Int(length as i32))?;
        f.pc += 1;
        Ok(())
    }

    fn athrow(&mut self) -> Result<(), ExecError> {
        let objectref = self.stack.top_mut()?.pop()?;
        let Some(id) = objectref.reference()? else {
            return self.throw(
                "java/lang/NullPointerException",
                "athrow of a null reference".to_string(),
            );
        };
        let (class, message) = {
            let objects = self.objects()?;
            (
                objects.class_name(&id)?,
                objects.throwable_message(&id).unwrap_or_default(),
            )
        };
        self.throw(&class, message)
    }

    fn monitor_enter(&mut self) -> Result<(), ExecError> {
        let objectref = self.stack.top_mut()?.pop()?;
        let Some(id) = objectref.reference()? else {
            return self.throw(
                "java/lang/NullPointerException",
                "monitorenter on a null reference".to_string(),
            );
        };
        self.monitors.enter(&id, &self.id)?;
        self.advance(1)
    }

    fn monitor_exit(&mut self) -> Result<(), ExecError> {
        let objectref = self.stack.top_mut()?.pop()?;
        let Some(id) = objectref.reference()? else {
            return self.throw(
                "java/lang/NullPointerException",
                "monitorexit on a null reference".to_string(),
            );
        };
        if self.monitors.exit(&id, &self.id).is_err() {
            return self.throw(
                "java/lang/IllegalMonitorStateException",
                format!("monitorexit on {id:?} by a thread that does not own it"),
            );
        }
        self.advance(1)
    }
}

fn panic_detail(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unidentified panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant_pool::ConstantPool;
    use crate::error::AbortOnThrow;
    use crate::method::{MethodEntry, MethodTable};
    use crate::opcode as op;
    use common::ACC_STATIC;

    struct Harness {
        thread: ExecThread,
        objects: Arc<RwLock<ObjectStore>>,
        monitors: Arc<Monitors>,
    }

    fn harness(code: Vec<u8>, max_stack: usize, max_locals: usize, cp: ConstantPool) -> Harness {
        let methods = Arc::new(MethodTable::default());
        let objects = Arc::new(RwLock::new(ObjectStore::default()));
        let statics = Arc::new(StaticTable::default());
        let monitors = Arc::new(Monitors::default());
        let registry = Arc::new(ThreadRegistry::default());

        let mut thread = ExecThread::new(
            "test",
            methods,
            objects.clone(),
            statics,
            monitors.clone(),
            registry,
            Arc::new(AbortOnThrow),
        )
        .unwrap();

        let method = Arc::new(MethodEntry {
            class_name: "Test".to_string(),
            name: "run".to_string(),
            descriptor: "()V".to_string(),
            access_flags: ACC_STATIC,
            max_stack,
            max_locals,
            code: Arc::new(code),
            constant_pool: Arc::new(cp),
        });
        let mut locals = Vec::new();
        locals.resize(max_locals, Value::Int(0));
        let frame = crate::frame::Frame::new(&method, locals, thread.id.clone());
        thread.stack.push(frame);

        Harness {
            thread,
            objects,
            monitors,
        }
    }

    #[test]
    fn test_ladd() {
        let mut h = harness(vec![op::LADD], 6, 0, ConstantPool::default());
        {
            let f = h.thread.stack.top_mut().unwrap();
            f.push_long(21).unwrap();
            f.push_long(22).unwrap();
        }
        h.thread.step().unwrap();

        let f = h.thread.stack.top_mut().unwrap();
        assert_eq!(f.pop_long().unwrap(), 43);
        assert_eq!(f.operand_count(), 0);
    }

    #[test]
    fn test_lshl() {
        let mut h = harness(vec![op::LSHL], 6, 0, ConstantPool::default());
        {
            let f = h.thread.stack.top_mut().unwrap();
            f.push_long(22).unwrap();
            f.push(Value::Int(3)).unwrap();
        }
        h.thread.step().unwrap();

        let f = h.thread.stack.top_mut().unwrap();
        assert_eq!(f.pop_long().unwrap(), 176);
        assert_eq!(f.operand_count(), 0);
    }

    #[test]
    fn test_long_arithmetic_wraps() {
        let mut h = harness(vec![op::LADD], 6, 0, ConstantPool::default());
        {
            let f = h.thread.stack.top_mut().unwrap();
            f.push_long(i64::MAX).unwrap();
            f.push_long(1).unwrap();
        }
        h.thread.step().unwrap();
        let f = h.thread.stack.top_mut().unwrap();
        assert_eq!(f.pop_long().unwrap(), i64::MIN);
    }

    #[test]
    fn test_wide_load_matches_narrow() {
        let narrow = vec![op::ILOAD, 5];
        let wide = vec![op::WIDE, op::ILOAD, 0, 5];

        let mut run = |code: Vec<u8>, steps: usize| {
            let mut h = harness(code, 2, 6, ConstantPool::default());
            h.thread
                .stack
                .top_mut()
                .unwrap()
                .set_local(5, Value::Int(77))
                .unwrap();
            for _ in 0..steps {
                h.thread.step().unwrap();
            }
            let f = h.thread.stack.top_mut().unwrap();
            let top = f.pop().unwrap();
            (top, f.operand_count(), f.locals().to_vec())
        };

        assert_eq!(run(narrow, 1), run(wide, 2));
    }

    #[test]
    fn test_wide_store_matches_narrow() {
        let narrow = vec![op::ISTORE, 4];
        let wide = vec![op::WIDE, op::ISTORE, 0, 4];

        let mut run = |code: Vec<u8>, steps: usize| {
            let mut h = harness(code, 2, 6, ConstantPool::default());
            h.thread
                .stack
                .top_mut()
                .unwrap()
                .push(Value::Int(31))
                .unwrap();
            for _ in 0..steps {
                h.thread.step().unwrap();
            }
            let f = h.thread.stack.top().unwrap();
            (f.operand_count(), f.locals().to_vec())
        };

        assert_eq!(run(narrow, 1), run(wide, 2));
    }

    #[test]
    fn test_wide_iinc_matches_narrow() {
        let narrow = vec![op::IINC, 2, 5];
        let wide = vec![op::WIDE, op::IINC, 0, 2, 0, 5];

        let mut run = |code: Vec<u8>, steps: usize| {
            let mut h = harness(code, 2, 3, ConstantPool::default());
            h.thread
                .stack
                .top_mut()
                .unwrap()
                .set_local(2, Value::Int(10))
                .unwrap();
            for _ in 0..steps {
                h.thread.step().unwrap();
            }
            h.thread.stack.top().unwrap().locals().to_vec()
        };

        assert_eq!(run(narrow, 1), run(wide, 2));
    }

    #[test]
    fn test_integer_division_by_zero() {
        for code in [vec![op::IDIV], vec![op::IREM]] {
            let mut h = harness(code, 4, 0, ConstantPool::default());
            {
                let f = h.thread.stack.top_mut().unwrap();
                f.push(Value::Int(1)).unwrap();
                f.push(Value::Int(0)).unwrap();
            }
            let err = h.thread.step().unwrap_err();
            assert!(matches!(err, ExecError::DivisionByZero { .. }));
        }

        for code in [vec![op::LDIV], vec![op::LREM]] {
            let mut h = harness(code, 6, 0, ConstantPool::default());
            {
                let f = h.thread.stack.top_mut().unwrap();
                f.push_long(1).unwrap();
                f.push_long(0).unwrap();
            }
            let err = h.thread.step().unwrap_err();
            assert!(matches!(err, ExecError::DivisionByZero { .. }));
        }
    }

    #[test]
    fn test_float_division_by_zero_follows_ieee() {
        let mut h = harness(vec![op::FDIV], 4, 0, ConstantPool::default());
        {
            let f = h.thread.stack.top_mut().unwrap();
            f.push(Value::Float(1.0)).unwrap();
            f.push(Value::Float(0.0)).unwrap();
        }
        h.thread.step().unwrap();
        let f = h.thread.stack.top_mut().unwrap();
        let result = f.pop().unwrap().float().unwrap();
        assert!(result.is_infinite() && result.is_sign_positive());

        let mut h = harness(vec![op::DDIV], 6, 0, ConstantPool::default());
        {
            let f = h.thread.stack.top_mut().unwrap();
            f.push_double(-1.0).unwrap();
            f.push_double(0.0).unwrap();
        }
        h.thread.step().unwrap();
        let f = h.thread.stack.top_mut().unwrap();
        let result = f.pop_double().unwrap();
        assert!(result.is_infinite() && result.is_sign_negative());
    }

    #[test]
    fn test_pop_on_empty_stack_underflows() {
        let mut h = harness(vec![op::POP], 4, 0, ConstantPool::default());
        let err = h.thread.step().unwrap_err();
        assert!(matches!(err, ExecError::StackUnderflow { .. }));
        assert!(format!("{err}").contains("stack underflow"));
    }

    #[test]
    fn test_push_past_limit_overflows() {
        let mut h = harness(vec![op::ICONST_0; 8], 1, 0, ConstantPool::default());
        let limit = h.thread.stack.top().unwrap().stack_limit();
        for _ in 0..limit {
            h.thread.step().unwrap();
        }
        let err = h.thread.step().unwrap_err();
        assert!(matches!(err, ExecError::StackOverflow { .. }));
        assert!(format!("{err}").contains(&limit.to_string()));
    }

    #[test]
    fn test_unrecognized_opcode() {
        let mut h = harness(vec![0xcb], 2, 0, ConstantPool::default());
        let err = h.thread.step().unwrap_err();
        assert!(matches!(
            err,
            ExecError::InvalidBytecode {
                opcode: 0xcb,
                pc: 0,
                ..
            }
        ));
        // the program counter must not advance past an invalid opcode
        assert_eq!(h.thread.stack.top().unwrap().pc, 0);
    }

    #[test]
    fn test_out_of_scope_opcode_is_invalid() {
        // INVOKEDYNAMIC is outside this core's dispatch surface
        let mut h = harness(vec![0xba, 0, 1, 0, 0], 2, 0, ConstantPool::default());
        let err = h.thread.step().unwrap_err();
        assert!(matches!(err, ExecError::InvalidBytecode { opcode: 0xba, .. }));
    }

    #[test]
    fn test_conversion_truncation() {
        let mut h = harness(vec![op::L2I], 6, 0, ConstantPool::default());
        h.thread
            .stack
            .top_mut()
            .unwrap()
            .push_long(0x1_0000_0001)
            .unwrap();
        h.thread.step().unwrap();
        assert_eq!(
            h.thread.stack.top_mut().unwrap().pop().unwrap(),
            Value::Int(1)
        );

        let mut h = harness(vec![op::I2B], 2, 0, ConstantPool::default());
        h.thread
            .stack
            .top_mut()
            .unwrap()
            .push(Value::Int(0x181))
            .unwrap();
        h.thread.step().unwrap();
        assert_eq!(
            h.thread.stack.top_mut().unwrap().pop().unwrap(),
            Value::Int(-127)
        );

        let mut h = harness(vec![op::F2I], 2, 0, ConstantPool::default());
        h.thread
            .stack
            .top_mut()
            .unwrap()
            .push(Value::Float(f32::NAN))
            .unwrap();
        h.thread.step().unwrap();
        assert_eq!(
            h.thread.stack.top_mut().unwrap().pop().unwrap(),
            Value::Int(0)
        );
    }

    #[test]
    fn test_fcmpg_and_fcmpl_disagree_only_on_nan() {
        for (code, expected) in [(vec![op::FCMPG], 1), (vec![op::FCMPL], -1)] {
            let mut h = harness(code, 4, 0, ConstantPool::default());
            {
                let f = h.thread.stack.top_mut().unwrap();
                f.push(Value::Float(f32::NAN)).unwrap();
                f.push(Value::Float(1.0)).unwrap();
            }
            h.thread.step().unwrap();
            assert_eq!(
                h.thread.stack.top_mut().unwrap().pop().unwrap(),
                Value::Int(expected)
            );
        }
    }

    #[test]
    fn test_lcmp() {
        let mut h = harness(vec![op::LCMP], 6, 0, ConstantPool::default());
        {
            let f = h.thread.stack.top_mut().unwrap();
            f.push_long(5).unwrap();
            f.push_long(9).unwrap();
        }
        h.thread.step().unwrap();
        assert_eq!(
            h.thread.stack.top_mut().unwrap().pop().unwrap(),
            Value::Int(-1)
        );
    }

    #[test]
    fn test_branch_taken_and_fallthrough() {
        // IF_ICMPLT with a taken branch jumps by the encoded offset
        let mut h = harness(vec![op::IF_ICMPLT, 0, 5], 4, 0, ConstantPool::default());
        {
            let f = h.thread.stack.top_mut().unwrap();
            f.push(Value::Int(1)).unwrap();
            f.push(Value::Int(2)).unwrap();
        }
        h.thread.step().unwrap();
        assert_eq!(h.thread.stack.top().unwrap().pc, 5);

        let mut h = harness(vec![op::IF_ICMPLT, 0, 5], 4, 0, ConstantPool::default());
        {
            let f = h.thread.stack.top_mut().unwrap();
            f.push(Value::Int(2)).unwrap();
            f.push(Value::Int(1)).unwrap();
        }
        h.thread.step().unwrap();
        assert_eq!(h.thread.stack.top().unwrap().pc, 3);
    }

    #[test]
    fn test_goto_backwards() {
        let mut h = harness(
            vec![op::NOP, op::NOP, op::GOTO, 0xff, 0xfe],
            2,
            0,
            ConstantPool::default(),
        );
        h.thread.step().unwrap();
        h.thread.step().unwrap();
        h.thread.step().unwrap();
        assert_eq!(h.thread.stack.top().unwrap().pc, 0);
    }

    #[test]
    fn test_tableswitch() {
        // tableswitch over [1, 2] starting at pc 0: padding to 4, then
        // default, low, high, offsets
        let mut code = vec![op::TABLESWITCH, 0, 0, 0];
        code.extend_from_slice(&30i32.to_be_bytes());
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&2i32.to_be_bytes());
        code.extend_from_slice(&40i32.to_be_bytes());
        code.extend_from_slice(&50i32.to_be_bytes());

        for (input, target) in [(1, 40), (2, 50), (9, 30)] {
            let mut h = harness(code.clone(), 2, 0, ConstantPool::default());
            h.thread
                .stack
                .top_mut()
                .unwrap()
                .push(Value::Int(input))
                .unwrap();
            h.thread.step().unwrap();
            assert_eq!(h.thread.stack.top().unwrap().pc, target);
        }
    }

    #[test]
    fn test_lookupswitch() {
        let mut code = vec![op::LOOKUPSWITCH, 0, 0, 0];
        code.extend_from_slice(&30i32.to_be_bytes());
        code.extend_from_slice(&2i32.to_be_bytes());
        code.extend_from_slice(&(-4i32).to_be_bytes());
        code.extend_from_slice(&40i32.to_be_bytes());
        code.extend_from_slice(&77i32.to_be_bytes());
        code.extend_from_slice(&50i32.to_be_bytes());

        for (input, target) in [(-4, 40), (77, 50), (0, 30)] {
            let mut h = harness(code.clone(), 2, 0, ConstantPool::default());
            h.thread
                .stack
                .top_mut()
                .unwrap()
                .push(Value::Int(input))
                .unwrap();
            h.thread.step().unwrap();
            assert_eq!(h.thread.stack.top().unwrap().pc, target);
        }
    }

    #[test]
    fn test_dup2_duplicates_a_long_pair() {
        let mut h = harness(vec![op::DUP2], 6, 0, ConstantPool::default());
        h.thread.stack.top_mut().unwrap().push_long(7).unwrap();
        h.thread.step().unwrap();

        let f = h.thread.stack.top_mut().unwrap();
        assert_eq!(f.pop_long().unwrap(), 7);
        assert_eq!(f.pop_long().unwrap(), 7);
        assert_eq!(f.operand_count(), 0);
    }

    #[test]
    fn test_newarray_and_array_access() {
        let code = vec![
            op::BIPUSH, 3, // length
            op::NEWARRAY, 10, // int[]
            op::DUP,
            op::ICONST_1, // index
            op::BIPUSH, 42, // value
            op::IASTORE,
            op::ICONST_1,
            op::IALOAD,
        ];
        let mut h = harness(code, 6, 0, ConstantPool::default());
        for _ in 0..8 {
            h.thread.step().unwrap();
        }
        let f = h.thread.stack.top_mut().unwrap();
        assert_eq!(f.pop().unwrap(), Value::Int(42));
    }

    #[test]
    fn test_array_index_out_of_bounds_raises() {
        let code = vec![op::ICONST_1, op::NEWARRAY, 10, op::ICONST_5, op::IALOAD];
        let mut h = harness(code, 6, 0, ConstantPool::default());
        h.thread.step().unwrap();
        h.thread.step().unwrap();
        h.thread.step().unwrap();
        let err = h.thread.step().unwrap_err();
        assert!(format!("{err}").contains("ArrayIndexOutOfBoundsException"));
    }

    #[test]
    fn test_putfield_with_non_field_entry_leaves_object_untouched() {
        let cp = ConstantPool::new(vec![CpEntry::MethodRef {
            class: "Point".to_string(),
            name: "move".to_string(),
            descriptor: "()V".to_string(),
        }]);
        let mut h = harness(vec![op::PUTFIELD, 0, 1], 4, 0, cp);

        let target = h.objects.write().unwrap().allocate_instance("Point");
        let tag = FieldTag {
            kind: FieldKind::Int,
            is_static: false,
        };
        h.objects
            .write()
            .unwrap()
            .set_field(&target, "x", tag, Value::Int(5))
            .unwrap();

        {
            let f = h.thread.stack.top_mut().unwrap();
            f.push(Value::Object(target.clone())).unwrap();
            f.push(Value::Int(9)).unwrap();
        }
        let err = h.thread.step().unwrap_err();
        assert!(matches!(
            err,
            ExecError::ConstantPoolTypeMismatch {
                actual: "method reference",
                ..
            }
        ));
        assert_eq!(
            h.objects.read().unwrap().get_field(&target, "x", tag).unwrap(),
            Value::Int(5)
        );
    }

    #[test]
    fn test_static_field_opcode_on_instance_field_is_rejected() {
        let cp = ConstantPool::new(vec![CpEntry::FieldRef {
            class: "Point".to_string(),
            name: "x".to_string(),
            descriptor: "I".to_string(),
            is_static: false,
        }]);
        let mut h = harness(vec![op::GETSTATIC, 0, 1], 4, 0, cp);
        let err = h.thread.step().unwrap_err();
        assert!(matches!(err, ExecError::FieldAccessMismatch { .. }));
    }

    #[test]
    fn test_monitorenter_and_exit() {
        let mut h = harness(
            vec![op::MONITORENTER, op::MONITOREXIT],
            4,
            0,
            ConstantPool::default(),
        );
        let object = h.objects.write().unwrap().allocate_instance("Lock");

        {
            let f = h.thread.stack.top_mut().unwrap();
            f.push(Value::Object(object.clone())).unwrap();
        }
        h.thread.step().unwrap();
        assert!(h.monitors.owned_by(&object, h.thread.id()).unwrap());

        {
            let f = h.thread.stack.top_mut().unwrap();
            f.push(Value::Object(object.clone())).unwrap();
        }
        h.thread.step().unwrap();
        assert!(!h.monitors.owned_by(&object, h.thread.id()).unwrap());
    }

    #[test]
    fn test_return_releases_held_monitor() {
        let mut h = harness(vec![op::RETURN], 2, 0, ConstantPool::default());
        let object = h.objects.write().unwrap().allocate_instance("Lock");
        let thread_id = h.thread.id().clone();

        h.monitors.enter(&object, &thread_id).unwrap();
        h.thread.stack.top_mut().unwrap().held_monitor = Some(object.clone());

        h.thread.interpret().unwrap();
        assert!(h.thread.stack.is_empty());
        assert!(!h.monitors.owned_by(&object, &thread_id).unwrap());
    }

    #[test]
    fn test_athrow_surfaces_as_application_exception() {
        let cp = ConstantPool::new(vec![CpEntry::ClassRef {
            name: "java/lang/IllegalStateException".to_string(),
        }]);
        let mut h = harness(vec![op::NEW, 0, 1, op::ATHROW], 4, 0, cp);
        h.thread.step().unwrap();
        let err = h.thread.step().unwrap_err();
        assert!(err.is_application());
        assert!(format!("{err}").contains("IllegalStateException"));
    }
}
