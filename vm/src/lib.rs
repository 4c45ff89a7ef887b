use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use common::ObjectId;

use crate::error::{ExceptionHandler, ExecError};
use crate::method::MethodResolver;
use crate::monitor::Monitors;
use crate::object::ObjectStore;
use crate::statics::StaticTable;
use crate::thread::{ExecThread, RunOutcome, ThreadRegistry};

pub mod call;
pub mod constant_pool;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod method;
pub mod monitor;
pub mod object;
pub mod opcode;
pub mod stack;
pub mod statics;
pub mod thread;
pub mod value;

/// The execution core: shared runtime state plus the capability interfaces
/// it interprets against. Method resolution and exception handling are
/// injected at construction time; threads spawned from here share
/// everything except their frame stacks.
pub struct Vm {
    methods: Arc<dyn MethodResolver>,
    objects: Arc<RwLock<ObjectStore>>,
    statics: Arc<StaticTable>,
    monitors: Arc<Monitors>,
    registry: Arc<ThreadRegistry>,
    exceptions: Arc<dyn ExceptionHandler>,
}

impl Vm {
    pub fn new(methods: Arc<dyn MethodResolver>, exceptions: Arc<dyn ExceptionHandler>) -> Self {
        Self {
            methods,
            objects: Arc::new(RwLock::new(ObjectStore::default())),
            statics: Arc::new(StaticTable::default()),
            monitors: Arc::new(Monitors::default()),
            registry: Arc::new(ThreadRegistry::default()),
            exceptions,
        }
    }

    pub fn objects(&self) -> Arc<RwLock<ObjectStore>> {
        self.objects.clone()
    }

    pub fn statics(&self) -> Arc<StaticTable> {
        self.statics.clone()
    }

    pub fn monitors(&self) -> Arc<Monitors> {
        self.monitors.clone()
    }

    pub fn registry(&self) -> Arc<ThreadRegistry> {
        self.registry.clone()
    }

    fn thread(&self, name: &str) -> Result<ExecThread, ExecError> {
        ExecThread::new(
            name,
            self.methods.clone(),
            self.objects.clone(),
            self.statics.clone(),
            self.monitors.clone(),
            self.registry.clone(),
            self.exceptions.clone(),
        )
    }

    /// Runs `class.main(String[])` on a dedicated thread with the supplied
    /// application arguments and waits for it to terminate.
    pub fn run_main(&self, class: &str, args: &[String]) -> Result<RunOutcome, ExecError> {
        let mut thread = self.thread("main")?;
        thread.prepare_main(class, args)?;
        thread
            .start()
            .join()
            .map_err(|_| internal!("main thread handle was lost"))
    }

    /// Starts an additional thread on the given entry method. Local 0 of
    /// its first frame receives `target` when present, otherwise the new
    /// thread's own thread object.
    pub fn spawn_thread(
        &self,
        name: &str,
        class: &str,
        method: &str,
        descriptor: &str,
        target: Option<ObjectId>,
    ) -> Result<JoinHandle<RunOutcome>, ExecError> {
        let mut thread = self.thread(name)?;
        thread.prepare_entry(class, method, descriptor, target)?;
        Ok(thread.start())
    }
}
