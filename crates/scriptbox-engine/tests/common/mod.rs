//! Shared test fixtures.
//!
//! [`ScriptedBackend`] is an in-process stand-in for a real guest
//! interpreter.  Scripts are line oriented: `def NAME` opens a function and
//! the following lines are its operations (`yield`, `yield-range`, `print`,
//! `log`, `return`, `echo`, `echo-named`, `sleep`, `raise`, `fetch`).  A
//! leading `# compile-cost N` line makes compilation take N milliseconds.
//!
//! The fixture exercises the full engine surface (lifecycle, events,
//! deadlines, capability exchanges) without needing a compiled interpreter
//! image.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scriptbox_engine::{
    Argument, Context, ContextOptions, Event, EventHandler, EventKind, GuestInstance,
    HandlerTable, HostChannel, HttpRequest, IsolationBackend, Result, RuntimeImage, Sandbox,
    SandboxConfig, SandboxError,
};

/// Backend that accepts images whose bytes begin with `scripted`.
pub struct ScriptedBackend;

#[async_trait]
impl IsolationBackend for ScriptedBackend {
    async fn load_image(&self, image: &RuntimeImage) -> Result<()> {
        if image.bytes().starts_with(b"scripted") {
            Ok(())
        } else {
            Err(SandboxError::InvalidImage(
                "not a scripted guest image".into(),
            ))
        }
    }

    async fn instantiate(
        &self,
        _image: &RuntimeImage,
        _config: &SandboxConfig,
    ) -> Result<Box<dyn GuestInstance>> {
        Ok(Box::new(ScriptedInstance {
            functions: HashMap::new(),
        }))
    }
}

#[derive(Clone)]
enum Op {
    Yield(String),
    YieldRange(u32),
    Print(String),
    Log(String),
    Return(String),
    Echo,
    EchoNamed(String),
    Sleep(u64),
    Raise(String),
    Fetch { method: String, url: String },
}

struct ScriptedInstance {
    functions: HashMap<String, Vec<Op>>,
}

#[async_trait]
impl GuestInstance for ScriptedInstance {
    async fn compile(&mut self, source: &str) -> Result<()> {
        if let Some(cost) = source
            .lines()
            .next()
            .and_then(|line| line.trim().strip_prefix("# compile-cost "))
        {
            let ms: u64 = cost.trim().parse().map_err(|_| SandboxError::Compile {
                diagnostic: "line 1: malformed compile-cost".into(),
            })?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.functions = parse(source)?;
        Ok(())
    }

    async fn call_entry(
        &mut self,
        entry: &str,
        args: &[Argument],
        host: HostChannel,
    ) -> Result<()> {
        let ops = self
            .functions
            .get(entry)
            .cloned()
            .ok_or_else(|| SandboxError::EntryNotFound {
                entry: entry.to_string(),
            })?;
        for op in ops {
            match op {
                Op::Yield(json) => host.emit(Event::ResultJson(json.into_bytes())).await?,
                Op::YieldRange(n) => {
                    for i in 0..n {
                        host.emit(Event::ResultJson(i.to_string().into_bytes()))
                            .await?;
                    }
                }
                Op::Print(text) => host.emit(Event::Stdout(text.into_bytes())).await?,
                Op::Log(text) => host.emit(Event::Log(text.into_bytes())).await?,
                Op::Return(json) => {
                    host.emit(Event::EndJson(Some(json.into_bytes()))).await?;
                    return Ok(());
                }
                Op::Echo => {
                    let arg = args.iter().find(|a| a.name.is_none()).ok_or_else(|| {
                        SandboxError::Argument("missing positional argument".into())
                    })?;
                    let payload = arg.json_str()?.as_bytes().to_vec();
                    host.emit(Event::EndJson(Some(payload))).await?;
                    return Ok(());
                }
                Op::EchoNamed(name) => {
                    let arg = args
                        .iter()
                        .find(|a| a.name.as_deref() == Some(name.as_str()))
                        .ok_or_else(|| {
                            SandboxError::Argument(format!("missing argument '{name}'"))
                        })?;
                    let payload = arg.json_str()?.as_bytes().to_vec();
                    host.emit(Event::EndJson(Some(payload))).await?;
                    return Ok(());
                }
                Op::Sleep(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                Op::Raise(message) => return Err(SandboxError::GuestFault { message }),
                Op::Fetch { method, url } => {
                    let response = host.http_request(HttpRequest::new(method, url)?).await?;
                    let headers: Vec<(&str, &str)> = response
                        .headers
                        .iter()
                        .map(|h| (h.name.as_str(), h.value.as_str()))
                        .collect();
                    let payload = serde_json::json!({
                        "status": response.status,
                        "headers": headers,
                        "body": response.body_text(),
                    });
                    host.emit(Event::EndJson(Some(payload.to_string().into_bytes())))
                        .await?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn parse(source: &str) -> Result<HashMap<String, Vec<Op>>> {
    let mut functions: HashMap<String, Vec<Op>> = HashMap::new();
    let mut current: Option<String> = None;
    for (idx, raw) in source.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix("def ") {
            let name = name.trim().trim_end_matches(':').to_string();
            functions.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        let name = current.clone().ok_or_else(|| SandboxError::Compile {
            diagnostic: format!("line {}: statement outside a function", idx + 1),
        })?;
        let op = parse_op(line).ok_or_else(|| SandboxError::Compile {
            diagnostic: format!("line {}: unknown operation '{line}'", idx + 1),
        })?;
        functions
            .get_mut(&name)
            .expect("current function exists")
            .push(op);
    }
    Ok(functions)
}

fn parse_op(line: &str) -> Option<Op> {
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    match word {
        "yield" if !rest.is_empty() => Some(Op::Yield(rest.to_string())),
        "yield-range" => rest.parse().ok().map(Op::YieldRange),
        "print" => Some(Op::Print(rest.to_string())),
        "log" => Some(Op::Log(rest.to_string())),
        "return" if !rest.is_empty() => Some(Op::Return(rest.to_string())),
        "echo" if rest.is_empty() => Some(Op::Echo),
        "echo-named" if !rest.is_empty() => Some(Op::EchoNamed(rest.to_string())),
        "sleep" => rest.parse().ok().map(Op::Sleep),
        "raise" => Some(Op::Raise(rest.to_string())),
        "fetch" => rest
            .split_once(' ')
            .map(|(method, url)| Op::Fetch {
                method: method.to_string(),
                url: url.to_string(),
            }),
        _ => None,
    }
}

/// Thread-safe event recorder usable as an event handler.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> impl EventHandler {
        let sink = Arc::clone(&self.events);
        move |event: Event| sink.lock().unwrap().push(event)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(Event::kind).collect()
    }

    fn payloads_of(&self, kind: EventKind) -> Vec<String> {
        self.events()
            .iter()
            .filter(|e| e.kind() == kind)
            .map(|e| String::from_utf8_lossy(e.payload().unwrap_or_default()).into_owned())
            .collect()
    }

    pub fn results(&self) -> Vec<String> {
        self.payloads_of(EventKind::ResultJson)
    }

    pub fn stdout(&self) -> Vec<String> {
        self.payloads_of(EventKind::Stdout)
    }

    pub fn logs(&self) -> Vec<String> {
        self.payloads_of(EventKind::Log)
    }

    /// Payloads of terminal events, `None` for a bare end.
    pub fn ends(&self) -> Vec<Option<String>> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Event::EndJson(payload) => Some(
                    payload
                        .as_ref()
                        .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
                ),
                _ => None,
            })
            .collect()
    }
}

pub fn scripted_context() -> Context {
    let ctx = Context::create(ContextOptions::new().with_backend(Arc::new(ScriptedBackend)))
        .expect("context creation must succeed");
    ctx.initialize_bytes(b"scripted-guest".to_vec())
        .expect("scripted image must load");
    ctx
}

/// A started sandbox recording into a fresh [`EventLog`].
pub fn started_sandbox(ctx: &Context) -> (EventLog, Sandbox) {
    let log = EventLog::new();
    let sandbox = started_sandbox_with(ctx, HandlerTable::new(log.handler()));
    (log, sandbox)
}

/// A started sandbox with a caller-supplied handler table.
pub fn started_sandbox_with(ctx: &Context, table: HandlerTable) -> Sandbox {
    let mut sandbox = Sandbox::create(ctx).expect("sandbox creation must succeed");
    sandbox.set_handler(table);
    sandbox.start().expect("sandbox start must succeed");
    sandbox
}
