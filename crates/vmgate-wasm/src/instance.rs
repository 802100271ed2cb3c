use anyhow::{Context, Result, bail};
use vmgate_wasm_abi::{HOST_MODULE, HttpRequest, HttpResponse};
use wasmtime::{Caller, Engine, Extern, Instance, Linker, Memory, Module, Store, TypedFunc};

use crate::{ALLOC_EXPORT, ENTRY_EXPORT, MEMORY_EXPORT, TERMINATE_EXPORT};

type RegisterCallback = Box<dyn FnOnce(String) + Send>;

/// Result codes returned to the module from `register_handler`.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered = 0,
    AlreadyRegistered = -1,
    InvalidName = -2,
    MissingExport = -3,
}

impl RegisterOutcome {
    pub fn code(self) -> i32 {
        self as i32
    }
}

struct VmState {
    argv: Vec<String>,
    handler: Option<String>,
    on_register: Option<RegisterCallback>,
}

/// A running VM module together with its store.
///
/// The instance is not `Sync`; the host keeps it on a single thread and
/// serializes every call.
pub struct VmInstance {
    store: Store<VmState>,
    instance: Instance,
    memory: Memory,
    entry: TypedFunc<(), ()>,
}

impl VmInstance {
    pub(crate) fn new(engine: &Engine, module: &Module, argv: Vec<String>) -> Result<Self> {
        let mut store = Store::new(
            engine,
            VmState {
                argv,
                handler: None,
                on_register: None,
            },
        );
        let mut linker = Linker::new(engine);
        linker.func_wrap(
            HOST_MODULE,
            "register_handler",
            |caller: Caller<'_, VmState>, ptr: i32, len: i32| register_handler(caller, ptr, len),
        )?;
        linker.func_wrap(
            HOST_MODULE,
            "args_get",
            |caller: Caller<'_, VmState>, ptr: i32, cap: i32| args_get(caller, ptr, cap),
        )?;

        let instance = linker.instantiate(&mut store, module)?;
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .context("wasm export 'memory' not found")?;
        let entry = instance
            .get_typed_func::<(), ()>(&mut store, ENTRY_EXPORT)
            .context("wasm export '_start' not found")?;
        Ok(Self {
            store,
            instance,
            memory,
            entry,
        })
    }

    /// Install the callback fired when the module publishes its handler.
    pub fn on_register(&mut self, callback: impl FnOnce(String) + Send + 'static) {
        self.store.data_mut().on_register = Some(Box::new(callback));
    }

    /// Run the module's entry point to completion.
    pub fn run_entry(&mut self) -> Result<()> {
        self.entry.call(&mut self.store, ())
    }

    pub fn registered_handler(&self) -> Option<&str> {
        self.store.data().handler.as_deref()
    }

    /// Invoke the registered handler export with a request envelope.
    pub fn handle(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        let handler = self
            .store
            .data()
            .handler
            .clone()
            .context("module has not registered a handler")?;
        let alloc = self
            .instance
            .get_typed_func::<i32, i32>(&mut self.store, ALLOC_EXPORT)
            .context("wasm export 'alloc' not found")?;
        let func = self
            .instance
            .get_typed_func::<(i32, i32), (i32, i32)>(&mut self.store, &handler)
            .with_context(|| format!("handler export '{handler}' has an unexpected signature"))?;

        let input = request.encode()?;
        let input_len = i32::try_from(input.len()).context("request too large for wasm32")?;
        let input_ptr = alloc.call(&mut self.store, input_len)?;
        let input_offset = usize::try_from(input_ptr).context("negative input pointer")?;
        self.memory.write(&mut self.store, input_offset, &input)?;

        let (out_ptr, out_len) = func.call(&mut self.store, (input_ptr, input_len))?;
        let out_offset = usize::try_from(out_ptr).context("negative output pointer")?;
        let out_len = usize::try_from(out_len).context("negative output length")?;
        let mut output = vec![0u8; out_len];
        self.memory.read(&self.store, out_offset, &mut output)?;
        Ok(HttpResponse::decode(&output)?)
    }

    /// Call the module's own teardown hook, if it exports one.
    ///
    /// Returns whether a hook was found.
    pub fn terminate(&mut self) -> Result<bool> {
        match self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, TERMINATE_EXPORT)
        {
            Ok(hook) => {
                hook.call(&mut self.store, ())?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

fn register_handler(mut caller: Caller<'_, VmState>, ptr: i32, len: i32) -> Result<i32> {
    let name = match read_string(&mut caller, ptr, len) {
        Ok(name) => name,
        Err(err) => {
            log::warn!("register_handler called with an invalid name: {err:#}");
            return Ok(RegisterOutcome::InvalidName.code());
        }
    };
    if caller.data().handler.is_some() {
        log::warn!("module tried to register handler '{name}' after one was already set; ignoring");
        return Ok(RegisterOutcome::AlreadyRegistered.code());
    }
    if !matches!(caller.get_export(&name), Some(Extern::Func(_))) {
        log::warn!("module registered handler '{name}' but exports no such function");
        return Ok(RegisterOutcome::MissingExport.code());
    }

    log::debug!("module registered handler '{name}'");
    let state = caller.data_mut();
    state.handler = Some(name.clone());
    if let Some(callback) = state.on_register.take() {
        callback(name);
    }
    Ok(RegisterOutcome::Registered.code())
}

fn args_get(mut caller: Caller<'_, VmState>, ptr: i32, cap: i32) -> Result<i32> {
    let mut encoded = Vec::new();
    for arg in &caller.data().argv {
        encoded.extend_from_slice(arg.as_bytes());
        encoded.push(0);
    }
    let required = i32::try_from(encoded.len()).context("argv too large for wasm32")?;
    if required > 0 && cap >= required {
        let memory = caller_memory(&mut caller)?;
        let offset = usize::try_from(ptr).context("negative argv pointer")?;
        memory.write(&mut caller, offset, &encoded)?;
    }
    Ok(required)
}

fn read_string(caller: &mut Caller<'_, VmState>, ptr: i32, len: i32) -> Result<String> {
    let offset = usize::try_from(ptr).context("negative pointer")?;
    let len = usize::try_from(len).context("negative length")?;
    if len == 0 {
        bail!("empty name");
    }
    let memory = caller_memory(caller)?;
    let mut buf = vec![0u8; len];
    memory.read(&*caller, offset, &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn caller_memory(caller: &mut Caller<'_, VmState>) -> Result<Memory> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .context("wasm export 'memory' not found")
}
