//! Tool registry — names, schemas, typed arguments, and the intercepted
//! dispatch path.
//!
//! Arguments are validated into one typed variant per tool at the
//! registry boundary (`deny_unknown_fields`), so nothing downstream ever
//! holds untyped args. Every dispatch runs the same pipeline:
//! approval gate → action-log begin (+ before-state capture) → execute →
//! action-log finish (+ undo registration).

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use ud_channels::{ChannelId, ChannelManager};
use ud_domain::error::{Error, Result};
use ud_domain::tool::{ToolCall, ToolDefinition};
use ud_tools::exec::{spawn, SpawnOutcome, SpawnRequest};
use ud_tools::{file_ops, ExecRegistry};

use super::actions::{ActionCategory, ActionLog, ApprovalState, StateSnapshot};
use super::approval::ApprovalGate;
use super::events::RunEventKind;
use super::memory::MemoryStore;
use super::undo::UndoService;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed arguments
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadFileArgs {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppendFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteFileArgs {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListDirArgs {
    #[serde(default = "default_dot")]
    pub path: String,
}

fn default_dot() -> String {
    ".".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecArgs {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub yield_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessAction {
    List,
    Poll,
    Log,
    Write,
    Kill,
    Clear,
    Remove,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessArgs {
    pub action: ProcessAction,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub eof: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebFetchArgs {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelSendArgs {
    pub channel: String,
    pub to: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryGetArgs {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemorySetArgs {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryDeleteArgs {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleJobArgs {
    pub name: String,
    /// Tagged schedule object, e.g. `{"kind":"every","every_ms":1000}`.
    pub schedule: Value,
    pub instruction: String,
    #[serde(default)]
    pub delete_after_run: bool,
}

/// One validated variant per tool.
#[derive(Debug, Clone)]
pub enum ToolArgs {
    ReadFile(ReadFileArgs),
    WriteFile(WriteFileArgs),
    AppendFile(AppendFileArgs),
    DeleteFile(DeleteFileArgs),
    ListDir(ListDirArgs),
    Exec(ExecArgs),
    Process(ProcessArgs),
    WebFetch(WebFetchArgs),
    ChannelSend(ChannelSendArgs),
    MemoryGet(MemoryGetArgs),
    MemorySet(MemorySetArgs),
    MemoryDelete(MemoryDeleteArgs),
    ScheduleJob(ScheduleJobArgs),
}

impl ToolArgs {
    /// Parse raw LLM arguments into the typed variant for `name`.
    /// Unknown tools and unknown fields are both validation errors.
    pub fn parse(name: &str, raw: &Value) -> Result<Self> {
        fn de<T: serde::de::DeserializeOwned>(raw: &Value) -> Result<T> {
            serde_json::from_value(raw.clone())
                .map_err(|e| Error::Validation(format!("invalid arguments: {e}")))
        }
        match name {
            "read_file" => Ok(Self::ReadFile(de(raw)?)),
            "write_file" => Ok(Self::WriteFile(de(raw)?)),
            "append_file" => Ok(Self::AppendFile(de(raw)?)),
            "delete_file" => Ok(Self::DeleteFile(de(raw)?)),
            "list_dir" => Ok(Self::ListDir(de(raw)?)),
            "exec" => Ok(Self::Exec(de(raw)?)),
            "process" => Ok(Self::Process(de(raw)?)),
            "web_fetch" => Ok(Self::WebFetch(de(raw)?)),
            "channel_send" => Ok(Self::ChannelSend(de(raw)?)),
            "memory_get" => Ok(Self::MemoryGet(de(raw)?)),
            "memory_set" => Ok(Self::MemorySet(de(raw)?)),
            "memory_delete" => Ok(Self::MemoryDelete(de(raw)?)),
            "schedule_job" => Ok(Self::ScheduleJob(de(raw)?)),
            other => Err(Error::Validation(format!("unknown tool '{other}'"))),
        }
    }

    pub fn category(&self) -> ActionCategory {
        match self {
            Self::ReadFile(_) | Self::ListDir(_) | Self::MemoryGet(_) => ActionCategory::Read,
            Self::WriteFile(_)
            | Self::AppendFile(_)
            | Self::DeleteFile(_)
            | Self::ChannelSend(_)
            | Self::MemorySet(_)
            | Self::MemoryDelete(_) => ActionCategory::Mutate,
            Self::Exec(_) => ActionCategory::Exec,
            Self::WebFetch(_) => ActionCategory::Network,
            Self::Process(_) | Self::ScheduleJob(_) => ActionCategory::System,
        }
    }

    /// Whether this tool's effect can be reversed from recorded state.
    /// Channel sends are mutations but cannot be unsent; exec can only
    /// ever be replayed, never reversed.
    pub fn undoable(&self) -> bool {
        matches!(
            self,
            Self::WriteFile(_)
                | Self::AppendFile(_)
                | Self::DeleteFile(_)
                | Self::MemorySet(_)
                | Self::MemoryDelete(_)
        )
    }

    /// Human-readable description used in approval requests.
    pub fn describe(&self) -> String {
        match self {
            Self::ReadFile(a) => format!("read file {}", a.path),
            Self::WriteFile(a) => format!("write {} bytes to {}", a.content.len(), a.path),
            Self::AppendFile(a) => format!("append {} bytes to {}", a.content.len(), a.path),
            Self::DeleteFile(a) => format!("delete file {}", a.path),
            Self::ListDir(a) => format!("list directory {}", a.path),
            Self::Exec(a) => format!("run command: {}", a.command),
            Self::Process(a) => format!("process {:?}", a.action),
            Self::WebFetch(a) => format!("fetch {}", a.url),
            Self::ChannelSend(a) => format!("send message to {} via {}", a.to, a.channel),
            Self::MemoryGet(a) => format!("read memory key {}", a.key),
            Self::MemorySet(a) => format!("set memory key {}", a.key),
            Self::MemoryDelete(a) => format!("delete memory key {}", a.key),
            Self::ScheduleJob(a) => format!("create scheduled job '{}'", a.name),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Creates scheduler jobs on behalf of the `schedule_job` tool. The
/// scheduler implements this and is injected after construction, which
/// breaks the scheduler → executor → registry → scheduler cycle.
#[async_trait::async_trait]
pub trait JobCreator: Send + Sync {
    async fn create_job(&self, args: &ScheduleJobArgs) -> Result<Value>;
}

/// Result of one dispatch.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub result: Value,
    pub error: bool,
}

impl ToolOutcome {
    fn ok(result: Value) -> Self {
        Self { result, error: false }
    }

    fn err(err: &Error) -> Self {
        Self {
            result: json!({ "error": true, "code": err.code(), "message": err.to_string() }),
            error: true,
        }
    }

    fn denied(reason: &str) -> Self {
        Self {
            result: json!({ "denied": true, "code": "PolicyDenied", "reason": reason }),
            error: true,
        }
    }
}

/// Emits run events during a dispatch (approval requests).
pub type EventEmit<'a> = &'a (dyn Fn(RunEventKind) + Sync);

/// Internal result of a tool body: value plus optional undo snapshots.
struct Executed {
    value: Value,
    before: Option<StateSnapshot>,
    after: Option<StateSnapshot>,
}

impl Executed {
    fn plain(value: Value) -> Self {
        Self {
            value,
            before: None,
            after: None,
        }
    }
}

pub struct ToolRegistry {
    workspace_root: PathBuf,
    exec: Arc<ExecRegistry>,
    memory: Arc<MemoryStore>,
    actions: Arc<ActionLog>,
    approvals: Arc<ApprovalGate>,
    undo: Arc<UndoService>,
    http: reqwest::Client,
    channels: RwLock<Option<Arc<ChannelManager>>>,
    job_creator: RwLock<Option<Arc<dyn JobCreator>>>,
}

impl ToolRegistry {
    pub fn new(
        workspace_root: PathBuf,
        exec: Arc<ExecRegistry>,
        memory: Arc<MemoryStore>,
        actions: Arc<ActionLog>,
        approvals: Arc<ApprovalGate>,
        undo: Arc<UndoService>,
    ) -> Self {
        Self {
            workspace_root,
            exec,
            memory,
            actions,
            approvals,
            undo,
            http: reqwest::Client::new(),
            channels: RwLock::new(None),
            job_creator: RwLock::new(None),
        }
    }

    /// Post-construction wiring (cycle breakers).
    pub fn set_channels(&self, channels: Arc<ChannelManager>) {
        *self.channels.write() = Some(channels);
    }

    pub fn set_job_creator(&self, creator: Arc<dyn JobCreator>) {
        *self.job_creator.write() = Some(creator);
    }

    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    pub fn undo(&self) -> &Arc<UndoService> {
        &self.undo
    }

    pub fn actions(&self) -> &Arc<ActionLog> {
        &self.actions
    }

    // ── Definitions for the LLM ───────────────────────────────────────

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        fn def(name: &str, description: &str, parameters: Value) -> ToolDefinition {
            ToolDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            }
        }

        vec![
            def(
                "read_file",
                "Read a file from the workspace.",
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string", "description": "Workspace-relative path" } },
                    "required": ["path"],
                    "additionalProperties": false
                }),
            ),
            def(
                "write_file",
                "Write a file in the workspace (creates or overwrites). Reversible.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "content": { "type": "string" }
                    },
                    "required": ["path", "content"],
                    "additionalProperties": false
                }),
            ),
            def(
                "append_file",
                "Append to a file in the workspace. Reversible.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "content": { "type": "string" }
                    },
                    "required": ["path", "content"],
                    "additionalProperties": false
                }),
            ),
            def(
                "delete_file",
                "Delete a file in the workspace. Reversible.",
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"],
                    "additionalProperties": false
                }),
            ),
            def(
                "list_dir",
                "List a workspace directory.",
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string", "description": "Defaults to the workspace root" } },
                    "additionalProperties": false
                }),
            ),
            def(
                "exec",
                "Run a shell command. Returns output, or a session id if it keeps running.",
                json!({
                    "type": "object",
                    "properties": {
                        "command": { "type": "string" },
                        "cwd": { "type": "string" },
                        "background": { "type": "boolean" },
                        "yield_ms": { "type": "integer" }
                    },
                    "required": ["command"],
                    "additionalProperties": false
                }),
            ),
            def(
                "process",
                "Manage exec sessions: list, poll, log, write, kill, clear, remove.",
                json!({
                    "type": "object",
                    "properties": {
                        "action": { "type": "string", "enum": ["list", "poll", "log", "write", "kill", "clear", "remove"] },
                        "session_id": { "type": "string" },
                        "offset": { "type": "integer" },
                        "data": { "type": "string" },
                        "eof": { "type": "boolean" }
                    },
                    "required": ["action"],
                    "additionalProperties": false
                }),
            ),
            def(
                "web_fetch",
                "Fetch a URL over HTTP.",
                json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string" },
                        "method": { "type": "string", "enum": ["GET", "HEAD"] }
                    },
                    "required": ["url"],
                    "additionalProperties": false
                }),
            ),
            def(
                "channel_send",
                "Send a message through a connected chat channel. Cannot be undone.",
                json!({
                    "type": "object",
                    "properties": {
                        "channel": { "type": "string", "enum": ["telegram", "discord", "slack", "whatsapp"] },
                        "to": { "type": "string" },
                        "text": { "type": "string" }
                    },
                    "required": ["channel", "to", "text"],
                    "additionalProperties": false
                }),
            ),
            def(
                "memory_get",
                "Read a value from persistent memory.",
                json!({
                    "type": "object",
                    "properties": { "key": { "type": "string" } },
                    "required": ["key"],
                    "additionalProperties": false
                }),
            ),
            def(
                "memory_set",
                "Store a value in persistent memory. Reversible.",
                json!({
                    "type": "object",
                    "properties": {
                        "key": { "type": "string" },
                        "value": {}
                    },
                    "required": ["key", "value"],
                    "additionalProperties": false
                }),
            ),
            def(
                "memory_delete",
                "Delete a key from persistent memory. Reversible.",
                json!({
                    "type": "object",
                    "properties": { "key": { "type": "string" } },
                    "required": ["key"],
                    "additionalProperties": false
                }),
            ),
            def(
                "schedule_job",
                "Create a scheduled job that fires an agent run.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "schedule": {
                            "type": "object",
                            "description": "Tagged schedule: {kind:'every',every_ms} | {kind:'at',at} | {kind:'cron',expr,tz?}"
                        },
                        "instruction": { "type": "string" },
                        "delete_after_run": { "type": "boolean" }
                    },
                    "required": ["name", "schedule", "instruction"],
                    "additionalProperties": false
                }),
            ),
        ]
    }

    // ── Dispatch ──────────────────────────────────────────────────────

    /// Run one tool call through the full interception pipeline.
    pub async fn dispatch(
        &self,
        run_id: Option<Uuid>,
        call: &ToolCall,
        emit: EventEmit<'_>,
    ) -> ToolOutcome {
        let args = match ToolArgs::parse(&call.tool_name, &call.arguments) {
            Ok(args) => args,
            Err(e) => return ToolOutcome::err(&e),
        };
        let category = args.category();
        let undoable = args.undoable();

        // ── Approval gate ─────────────────────────────────────────
        let approval = if self.approvals.requires_approval(category) {
            let (info, rx) = self.approvals.request(&call.tool_name, &args.describe());
            emit(RunEventKind::ToolApprovalRequested {
                approval_id: info.id,
                tool_name: info.tool_name.clone(),
                description: info.description.clone(),
            });
            self.approvals.wait(info.id, rx).await
        } else {
            ApprovalState::NotRequired
        };

        let mut record = self
            .actions
            .begin(run_id, &call.tool_name, category, call.arguments.clone());
        record.approval = approval;

        if approval == ApprovalState::Denied {
            record.error = Some("approval denied".into());
            self.actions.finish(record);
            return ToolOutcome::denied("approval denied");
        }

        // ── Execute ───────────────────────────────────────────────
        match self.execute(&args).await {
            Ok(executed) => {
                record.undoable = undoable;
                record.before_state = executed.before;
                record.after_state = executed.after;
                let sealed = self.actions.finish(record);
                if undoable {
                    self.undo.record(sealed.id);
                }
                ToolOutcome::ok(executed.value)
            }
            Err(e) => {
                record.error = Some(e.to_string());
                self.actions.finish(record);
                ToolOutcome::err(&e)
            }
        }
    }

    async fn execute(&self, args: &ToolArgs) -> Result<Executed> {
        match args {
            ToolArgs::ReadFile(a) => {
                let content = file_ops::read_file(&self.workspace_root, &a.path)?;
                Ok(Executed::plain(json!({ "content": content })))
            }

            ToolArgs::WriteFile(a) => {
                let m = file_ops::write_file(&self.workspace_root, &a.path, &a.content)?;
                Ok(file_mutation_result(m, json!({ "written": a.content.len() })))
            }

            ToolArgs::AppendFile(a) => {
                let m = file_ops::append_file(&self.workspace_root, &a.path, &a.content)?;
                Ok(file_mutation_result(m, json!({ "appended": a.content.len() })))
            }

            ToolArgs::DeleteFile(a) => {
                let m = file_ops::delete_file(&self.workspace_root, &a.path)?;
                Ok(file_mutation_result(m, json!({ "deleted": a.path })))
            }

            ToolArgs::ListDir(a) => {
                let entries = file_ops::list_dir(&self.workspace_root, &a.path)?;
                Ok(Executed::plain(json!({ "entries": entries })))
            }

            ToolArgs::Exec(a) => {
                let outcome = spawn(
                    &self.exec,
                    SpawnRequest {
                        command: a.command.clone(),
                        cwd: a.cwd.clone(),
                        background: a.background,
                        yield_ms: a.yield_ms,
                    },
                )
                .await?;
                let value = match outcome {
                    SpawnOutcome::Completed {
                        session_id,
                        exit_code,
                        output,
                    } => json!({
                        "sessionId": session_id,
                        "stdout": output,
                        "exitCode": exit_code,
                    }),
                    SpawnOutcome::Backgrounded { session_id, tail } => json!({
                        "sessionId": session_id,
                        "tail": tail,
                        "backgrounded": true,
                    }),
                };
                Ok(Executed::plain(value))
            }

            ToolArgs::Process(a) => self.execute_process(a).await,

            ToolArgs::WebFetch(a) => {
                let method = a.method.as_deref().unwrap_or("GET");
                let request = match method {
                    "GET" => self.http.get(&a.url),
                    "HEAD" => self.http.head(&a.url),
                    other => {
                        return Err(Error::Validation(format!(
                            "unsupported method '{other}'"
                        )))
                    }
                };
                let response = request
                    .timeout(std::time::Duration::from_secs(30))
                    .send()
                    .await
                    .map_err(|e| Error::Transient(format!("fetch failed: {e}")))?;
                let status = response.status().as_u16();
                let body = response
                    .text()
                    .await
                    .map_err(|e| Error::Transient(format!("body read failed: {e}")))?;
                const MAX_BODY: usize = 64 * 1024;
                let truncated = body.len() > MAX_BODY;
                let mut body = body;
                if truncated {
                    let mut end = MAX_BODY;
                    while !body.is_char_boundary(end) {
                        end -= 1;
                    }
                    body.truncate(end);
                }
                Ok(Executed::plain(json!({
                    "status": status,
                    "body": body,
                    "truncated": truncated,
                })))
            }

            ToolArgs::ChannelSend(a) => {
                let channel_id = ChannelId::parse(&a.channel)
                    .ok_or_else(|| Error::Validation(format!("unknown channel '{}'", a.channel)))?;
                let channels = self
                    .channels
                    .read()
                    .clone()
                    .ok_or_else(|| Error::Other("channel manager not wired".into()))?;
                channels.send(channel_id, &a.to, &a.text).await?;
                // Sent messages cannot be recalled; recorded, not undoable.
                Ok(Executed::plain(json!({ "sent": true, "to": a.to })))
            }

            ToolArgs::MemoryGet(a) => Ok(Executed::plain(json!({ "value": self.memory.get(&a.key) }))),

            ToolArgs::MemorySet(a) => {
                let prior = self.memory.set(&a.key, a.value.clone())?;
                Ok(Executed {
                    value: json!({ "stored": a.key }),
                    before: Some(StateSnapshot::Memory {
                        key: a.key.clone(),
                        value: prior,
                    }),
                    after: Some(StateSnapshot::Memory {
                        key: a.key.clone(),
                        value: Some(a.value.clone()),
                    }),
                })
            }

            ToolArgs::MemoryDelete(a) => {
                let prior = self.memory.delete(&a.key)?;
                if prior.is_none() {
                    return Err(Error::NotFound(format!("no memory key '{}'", a.key)));
                }
                Ok(Executed {
                    value: json!({ "deleted": a.key }),
                    before: Some(StateSnapshot::Memory {
                        key: a.key.clone(),
                        value: prior,
                    }),
                    after: Some(StateSnapshot::Memory {
                        key: a.key.clone(),
                        value: None,
                    }),
                })
            }

            ToolArgs::ScheduleJob(a) => {
                let creator = self
                    .job_creator
                    .read()
                    .clone()
                    .ok_or_else(|| Error::Other("scheduler not wired".into()))?;
                let job = creator.create_job(a).await?;
                Ok(Executed::plain(job))
            }
        }
    }

    async fn execute_process(&self, args: &ProcessArgs) -> Result<Executed> {
        let need_session = |id: &Option<String>| -> Result<String> {
            id.clone()
                .ok_or_else(|| Error::Validation("session_id required".into()))
        };
        match args.action {
            ProcessAction::List => Ok(Executed::plain(json!({
                "running": self.exec.list_running(),
                "finished": self.exec.list_finished(),
            }))),
            ProcessAction::Poll => {
                let id = need_session(&args.session_id)?;
                let record = self
                    .exec
                    .get(&id)
                    .ok_or_else(|| Error::NotFound(format!("session '{id}' not found")))?;
                let offset = args.offset.unwrap_or(0);
                Ok(Executed::plain(json!({
                    "status": record.status,
                    "exitCode": record.exit_code,
                    "newOutput": record.aggregated.read_from(offset, None),
                    "nextOffset": record.aggregated.len(),
                })))
            }
            ProcessAction::Log => {
                let id = need_session(&args.session_id)?;
                let tail = self
                    .exec
                    .tail(&id)
                    .ok_or_else(|| Error::NotFound(format!("session '{id}' not found")))?;
                Ok(Executed::plain(json!({ "log": tail })))
            }
            ProcessAction::Write => {
                let id = need_session(&args.session_id)?;
                let data = args.data.clone().unwrap_or_default().into_bytes();
                self.exec.write_stdin(&id, data, args.eof).await?;
                Ok(Executed::plain(json!({ "written": true })))
            }
            ProcessAction::Kill => {
                let id = need_session(&args.session_id)?;
                self.exec.kill_session(&id).await?;
                Ok(Executed::plain(json!({ "killed": true })))
            }
            ProcessAction::Clear => {
                let cleared = self.exec.clear_finished();
                Ok(Executed::plain(json!({ "cleared": cleared })))
            }
            ProcessAction::Remove => {
                let id = need_session(&args.session_id)?;
                self.exec.remove_session(&id).await?;
                Ok(Executed::plain(json!({ "removed": id })))
            }
        }
    }
}

fn file_mutation_result(m: file_ops::Mutation, value: Value) -> Executed {
    let path = m.path.to_string_lossy().into_owned();
    Executed {
        value,
        before: Some(StateSnapshot::File {
            path: path.clone(),
            content: m.before,
        }),
        after: Some(StateSnapshot::File {
            path,
            content: m.after,
        }),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
