//! The wasm isolation backend.
//!
//! [`WasmBackend`] runs guest interpreters under wasmtime with epoch
//! interruption and a per-instance memory limiter.  The runtime image is
//! compiled once per context and instantiated per sandbox.
//!
//! Guest ABI.  The image must export:
//!
//! - `memory` -- the linear memory,
//! - `sb_alloc(len: i32) -> i32` -- allocate a host-writable buffer,
//! - `sb_compile(src_ptr: i32, src_len: i32) -> i32` -- compile a script,
//! - `sb_call_entry(name_ptr: i32, name_len: i32, args_ptr: i32, args_len: i32) -> i32`
//!   -- run an entry point with a JSON-encoded argument list,
//! - `sb_last_error() -> i64` -- packed ptr/len of the last diagnostic.
//!
//! Return codes from `sb_call_entry`: `0` success, `2` unknown entry point,
//! `3` argument binding failure, anything else a guest fault.  The host side
//! is imported under the `scriptbox_host` module: `emit(kind, ptr, len)`
//! delivers one event and suspends the guest until the host consumed it;
//! `http_request(ptr, len)` suspends the guest for a full capability
//! exchange and returns the packed location of a JSON envelope, either
//! `{"ok":true,"status":...,"headers":...,"chunks":[[bytes]...]}` or
//! `{"ok":false,"error":"..."}` so the interpreter can raise a catchable
//! request error inside the script.  Argument payloads and response body
//! chunks cross the boundary byte for byte.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use wasmtime::{
    Caller, Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, TypedFunc,
};

use crate::args::Argument;
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::event::Event;
use crate::http::{HttpRequest, HttpResponse};
use crate::image::RuntimeImage;
use crate::isolation::{GuestInstance, HostChannel, IsolationBackend};

mod epoch;

/// Host-side state carried by every guest store.
struct HostState {
    /// Channel of the invocation currently running, if any.
    host: Option<HostChannel>,
    /// Typed error stashed by a host function before trapping the guest.
    failure: Option<SandboxError>,
    limits: StoreLimits,
}

/// Default isolation backend: wasmtime with epoch preemption.
pub struct WasmBackend {
    engine: Engine,
    module: Mutex<Option<Module>>,
    _epoch: epoch::EpochRegistration,
}

impl WasmBackend {
    /// Create the backend and hook its engine into the global epoch ticker.
    pub fn new() -> Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        config.epoch_interruption(true);
        config.wasm_memory64(false);

        let engine = Engine::new(&config)
            .map_err(|e| SandboxError::StartFailure(format!("wasm engine: {e}")))?;
        let registration = epoch::global_ticker()?.register(engine.clone());

        tracing::info!("wasm backend initialized");
        Ok(Self {
            engine,
            module: Mutex::new(None),
            _epoch: registration,
        })
    }
}

#[async_trait]
impl IsolationBackend for WasmBackend {
    async fn load_image(&self, image: &RuntimeImage) -> Result<()> {
        let module = Module::new(&self.engine, image.bytes())
            .map_err(|e| SandboxError::InvalidImage(format!("wasm decode: {e}")))?;
        tracing::debug!(size_bytes = image.len(), "runtime image compiled");
        *self.module.lock().expect("module lock") = Some(module);
        Ok(())
    }

    async fn instantiate(
        &self,
        _image: &RuntimeImage,
        config: &SandboxConfig,
    ) -> Result<Box<dyn GuestInstance>> {
        let module = self
            .module
            .lock()
            .expect("module lock")
            .clone()
            .ok_or(SandboxError::ContextNotInitialized)?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory)
            .build();
        let mut store = Store::new(
            &self.engine,
            HostState {
                host: None,
                failure: None,
                limits,
            },
        );
        store.limiter(|state| &mut state.limits);
        // Yield to the scheduler every epoch tick so deadlines can fire even
        // inside compute-bound guest code.
        store.epoch_deadline_async_yield_and_update(1);

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        define_host_functions(&mut linker)?;

        let instance = linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(|e| SandboxError::StartFailure(e.to_string()))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| SandboxError::StartFailure("guest exports no memory".into()))?;
        let funcs = GuestFuncs {
            alloc: typed_export(&instance, &mut store, "sb_alloc")?,
            compile: typed_export(&instance, &mut store, "sb_compile")?,
            call_entry: typed_export(&instance, &mut store, "sb_call_entry")?,
            last_error: typed_export(&instance, &mut store, "sb_last_error")?,
        };

        Ok(Box::new(WasmInstance {
            store,
            memory,
            funcs,
        }))
    }
}

fn typed_export<Params, Results>(
    instance: &wasmtime::Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<TypedFunc<Params, Results>>
where
    Params: wasmtime::WasmParams,
    Results: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<Params, Results>(&mut *store, name)
        .map_err(|e| SandboxError::StartFailure(format!("guest interface incomplete: {e}")))
}

struct GuestFuncs {
    alloc: TypedFunc<i32, i32>,
    compile: TypedFunc<(i32, i32), i32>,
    call_entry: TypedFunc<(i32, i32, i32, i32), i32>,
    last_error: TypedFunc<(), i64>,
}

/// One instantiated guest interpreter.
struct WasmInstance {
    store: Store<HostState>,
    memory: wasmtime::Memory,
    funcs: GuestFuncs,
}

impl WasmInstance {
    /// Copy `bytes` into guest memory through the guest allocator.
    async fn write_guest(&mut self, bytes: &[u8]) -> Result<(i32, i32)> {
        let len = i32::try_from(bytes.len())
            .map_err(|_| SandboxError::Argument("payload exceeds guest address space".into()))?;
        let ptr = match self.funcs.alloc.call_async(&mut self.store, len).await {
            Ok(ptr) => ptr,
            Err(trap) => return Err(self.take_failure(trap)),
        };
        if ptr < 0 {
            return Err(SandboxError::GuestFault {
                message: "allocator returned a negative pointer".into(),
            });
        }
        let start = ptr as usize;
        let data = self.memory.data_mut(&mut self.store);
        let end = start.saturating_add(bytes.len());
        if end > data.len() {
            return Err(SandboxError::GuestFault {
                message: "allocator returned an out-of-range pointer".into(),
            });
        }
        data[start..end].copy_from_slice(bytes);
        Ok((ptr, len))
    }

    /// Resolve a packed ptr/len pair into guest memory bytes.
    fn read_packed(&self, packed: i64) -> Result<Vec<u8>> {
        let start = (packed >> 32) as u32 as usize;
        let len = packed as u32 as usize;
        let data = self.memory.data(&self.store);
        let end = start.saturating_add(len);
        if end > data.len() {
            return Err(SandboxError::GuestFault {
                message: "guest diagnostic out of bounds".into(),
            });
        }
        Ok(data[start..end].to_vec())
    }

    async fn last_error_text(&mut self) -> String {
        let packed = match self.funcs.last_error.call_async(&mut self.store, ()).await {
            Ok(packed) => packed,
            Err(_) => return "guest diagnostic unavailable".into(),
        };
        match self.read_packed(packed) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => "guest diagnostic unavailable".into(),
        }
    }

    /// Translate a trap into the typed error a host function stashed, or a
    /// plain guest fault.
    fn take_failure(&mut self, trap: wasmtime::Error) -> SandboxError {
        match self.store.data_mut().failure.take() {
            Some(err) => err,
            None => SandboxError::GuestFault {
                message: trap.to_string(),
            },
        }
    }

    async fn dispatch(&mut self, entry: &str, args_json: &[u8]) -> Result<()> {
        let (name_ptr, name_len) = self.write_guest(entry.as_bytes()).await?;
        let (args_ptr, args_len) = self.write_guest(args_json).await?;
        let code = match self
            .funcs
            .call_entry
            .call_async(&mut self.store, (name_ptr, name_len, args_ptr, args_len))
            .await
        {
            Ok(code) => code,
            Err(trap) => return Err(self.take_failure(trap)),
        };
        match code {
            0 => Ok(()),
            2 => Err(SandboxError::EntryNotFound {
                entry: entry.to_string(),
            }),
            3 => Err(SandboxError::Argument(self.last_error_text().await)),
            _ => Err(SandboxError::GuestFault {
                message: self.last_error_text().await,
            }),
        }
    }
}

#[async_trait]
impl GuestInstance for WasmInstance {
    async fn compile(&mut self, source: &str) -> Result<()> {
        self.store.data_mut().failure = None;
        let (ptr, len) = self.write_guest(source.as_bytes()).await?;
        let code = match self.funcs.compile.call_async(&mut self.store, (ptr, len)).await {
            Ok(code) => code,
            Err(trap) => return Err(self.take_failure(trap)),
        };
        if code == 0 {
            Ok(())
        } else {
            let diagnostic = self.last_error_text().await;
            Err(SandboxError::Compile { diagnostic })
        }
    }

    async fn call_entry(
        &mut self,
        entry: &str,
        args: &[Argument],
        host: HostChannel,
    ) -> Result<()> {
        let args_json = encode_args(args)?;
        self.store.data_mut().failure = None;
        self.store.data_mut().host = Some(host);
        let result = self.dispatch(entry, &args_json).await;
        self.store.data_mut().host = None;
        result
    }
}

#[derive(Serialize)]
struct WireArgument<'a> {
    name: Option<&'a str>,
    value: &'a RawValue,
}

/// Marshal the argument list into the JSON array the guest interface takes.
///
/// Payloads are validated as JSON but carried onto the wire byte for byte:
/// key order, number spellings and whitespace all reach the guest unchanged.
fn encode_args(args: &[Argument]) -> Result<Vec<u8>> {
    let mut wire = Vec::with_capacity(args.len());
    for arg in args {
        let value: &RawValue = serde_json::from_str(arg.json_str()?)
            .map_err(|e| SandboxError::Argument(format!("argument is not valid JSON: {e}")))?;
        wire.push(WireArgument {
            name: arg.name.as_deref(),
            value,
        });
    }
    serde_json::to_vec(&wire).map_err(|e| SandboxError::Argument(e.to_string()))
}

#[derive(Deserialize)]
struct WireRequest {
    method: String,
    url: String,
    #[serde(default)]
    headers: Vec<(String, String)>,
}

#[derive(Serialize)]
struct WireResponse {
    ok: bool,
    status: u16,
    headers: Vec<(String, String)>,
    /// Body chunks as raw byte arrays, exactly as the host pushed them.
    chunks: Vec<Vec<u8>>,
}

#[derive(Serialize)]
struct WireError<'a> {
    ok: bool,
    error: &'a str,
}

fn define_host_functions(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap_async(
            "scriptbox_host",
            "emit",
            |mut caller: Caller<'_, HostState>, (kind, ptr, len): (i32, i32, i32)| {
                Box::new(async move {
                    let payload = read_guest_slice(&mut caller, ptr, len)?;
                    let event = match kind {
                        0 => Event::ResultJson(payload),
                        1 => Event::EndJson(Some(payload)),
                        2 => Event::EndJson(None),
                        3 => Event::Stdout(payload),
                        4 => Event::Log(payload),
                        other => {
                            return Err(wasmtime::Error::msg(format!(
                                "unknown event kind {other}"
                            )));
                        }
                    };
                    let Some(host) = caller.data().host.clone() else {
                        return Err(wasmtime::Error::msg("no active invocation"));
                    };
                    match host.emit(event).await {
                        Ok(()) => Ok(0i32),
                        Err(err) => {
                            caller.data_mut().failure = Some(err);
                            Err(wasmtime::Error::msg("host rejected event"))
                        }
                    }
                })
            },
        )
        .map_err(|e| SandboxError::StartFailure(e.to_string()))?;

    linker
        .func_wrap_async(
            "scriptbox_host",
            "http_request",
            |mut caller: Caller<'_, HostState>, (ptr, len): (i32, i32)| {
                Box::new(async move {
                    let raw = read_guest_slice(&mut caller, ptr, len)?;
                    let wire: WireRequest = serde_json::from_slice(&raw).map_err(|e| {
                        wasmtime::Error::msg(format!("malformed request descriptor: {e}"))
                    })?;
                    let Some(host) = caller.data().host.clone() else {
                        return Err(wasmtime::Error::msg("no active invocation"));
                    };
                    // Exchange failures travel back as a catchable envelope so
                    // scripts can handle them; traps are reserved for a broken
                    // guest interface.
                    let encoded = match build_request(wire) {
                        Ok(request) => match host.http_request(request).await {
                            Ok(response) => encode_response(&response)?,
                            Err(err) => encode_error(&err)?,
                        },
                        Err(err) => encode_error(&err)?,
                    };
                    let (out_ptr, out_len) = write_via_guest_alloc(&mut caller, &encoded).await?;
                    Ok((i64::from(out_ptr as u32) << 32) | i64::from(out_len as u32))
                })
            },
        )
        .map_err(|e| SandboxError::StartFailure(e.to_string()))?;

    Ok(())
}

fn build_request(wire: WireRequest) -> Result<HttpRequest> {
    let mut request = HttpRequest::new(wire.method, wire.url)?;
    for (name, value) in wire.headers {
        request = request.with_header(name, value);
    }
    Ok(request)
}

fn encode_response(response: &HttpResponse) -> wasmtime::Result<Vec<u8>> {
    let wire = WireResponse {
        ok: true,
        status: response.status,
        headers: response
            .headers
            .iter()
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect(),
        chunks: response.chunks.clone(),
    };
    serde_json::to_vec(&wire).map_err(wasmtime::Error::new)
}

fn encode_error(err: &SandboxError) -> wasmtime::Result<Vec<u8>> {
    let message = err.to_string();
    serde_json::to_vec(&WireError {
        ok: false,
        error: &message,
    })
    .map_err(wasmtime::Error::new)
}

fn read_guest_slice(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<Vec<u8>> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| wasmtime::Error::msg("guest exports no memory"))?;
    if ptr < 0 || len < 0 {
        return Err(wasmtime::Error::msg("pointer out of bounds"));
    }
    let data = memory.data(&*caller);
    let start = ptr as usize;
    let end = start.saturating_add(len as usize);
    if end > data.len() {
        return Err(wasmtime::Error::msg("pointer out of bounds"));
    }
    Ok(data[start..end].to_vec())
}

async fn write_via_guest_alloc(
    caller: &mut Caller<'_, HostState>,
    bytes: &[u8],
) -> wasmtime::Result<(i32, i32)> {
    let alloc = caller
        .get_export("sb_alloc")
        .and_then(|e| e.into_func())
        .ok_or_else(|| wasmtime::Error::msg("guest exports no allocator"))?
        .typed::<i32, i32>(&*caller)?;
    let len = i32::try_from(bytes.len())
        .map_err(|_| wasmtime::Error::msg("response exceeds guest address space"))?;
    let ptr = alloc.call_async(&mut *caller, len).await?;
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| wasmtime::Error::msg("guest exports no memory"))?;
    if ptr < 0 {
        return Err(wasmtime::Error::msg("allocator returned a negative pointer"));
    }
    let start = ptr as usize;
    let data = memory.data_mut(&mut *caller);
    let end = start.saturating_add(bytes.len());
    if end > data.len() {
        return Err(wasmtime::Error::msg(
            "allocator returned an out-of-range pointer",
        ));
    }
    data[start..end].copy_from_slice(bytes);
    Ok((ptr, len))
}
