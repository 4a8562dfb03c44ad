// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::{cell::RefCell, collections::HashSet, sync::Arc, time::Instant};

use boa_engine::{
    Context, JsError, JsNativeError, JsObject, JsResult, JsString, JsValue, NativeFunction,
    Source, js_string, object::ObjectInitializer, property::Attribute,
};
use serde_json::Value;

use super::{
    CacheScope, CacheStats, CloudBridge, ExecutionConsole, ExecutionResult, FunctionLookup,
    Invocation, LogArg, LogLevel, ModuleCache, ModuleKey,
};
use crate::{
    config::RuntimeConfig,
    error::{RuntimeError, RuntimeResult},
    function::{Function, content_hash},
};

const PRELUDE: &str = include_str!("prelude.js");

/// Frame id the global `console` writes to: whichever frame is on top.
/// Module code logs through its own `console` binding instead, see
/// [`IsolateState::module_frame_mut`].
const TOP_FRAME: i64 = -1;

thread_local! {
    static STATE: RefCell<Option<IsolateState>> = const { RefCell::new(None) };
}

/// One in-flight invocation on this thread. Nested `cloud.invoke` calls push
/// further frames, so logs and owner scope always belong to exactly one call.
struct Frame {
    id: i64,
    name: String,
    console: ExecutionConsole,
    bridge: CloudBridge,
    siblings: Arc<Vec<Function>>,
}

#[derive(Clone)]
struct Prelude {
    make_context: JsObject,
    make_console: JsObject,
    settle: JsObject,
    stringify: JsObject,
    require: JsObject,
}

struct IsolateState {
    cache: ModuleCache<JsObject>,
    frames: Vec<Frame>,
    next_frame: i64,
    loading: HashSet<ModuleKey>,
    prelude: Prelude,
    lookup: Arc<dyn FunctionLookup>,
    max_call_depth: usize,
}

impl IsolateState {
    fn frame(&self, id: i64) -> Option<&Frame> {
        if id == TOP_FRAME {
            self.frames.last()
        } else {
            self.frames.iter().rev().find(|frame| frame.id == id)
        }
    }

    fn frame_mut(&mut self, id: i64) -> Option<&mut Frame> {
        if id == TOP_FRAME {
            self.frames.last_mut()
        } else {
            self.frames.iter_mut().rev().find(|frame| frame.id == id)
        }
    }

    /// Newest frame running the function `name`, falling back to the top
    /// frame for modules that are only ever imported. A promise callback of
    /// an outer function that runs while a nested call is on top still logs
    /// into the outer call.
    fn module_frame_mut(&mut self, name: &str) -> Option<&mut Frame> {
        let position = self
            .frames
            .iter()
            .rposition(|frame| frame.name == name)
            .or_else(|| self.frames.len().checked_sub(1))?;
        self.frames.get_mut(position)
    }
}

/// Runs `f` against this thread's isolate state. The borrow never spans a
/// call back into the engine.
fn with_state<R>(f: impl FnOnce(&mut IsolateState) -> R) -> Option<R> {
    STATE.with(|cell| cell.borrow_mut().as_mut().map(f))
}

/// A JavaScript engine bound to the current thread, with its module cache
/// and frame stack.
///
/// At most one isolate exists per thread; the native hooks find their state
/// through a thread local.
pub struct Isolate {
    context: Context,
}

impl Isolate {
    pub fn new(config: &RuntimeConfig, lookup: Arc<dyn FunctionLookup>) -> anyhow::Result<Self> {
        if STATE.with(|cell| cell.borrow().is_some()) {
            anyhow::bail!("an isolate is already running on this thread");
        }

        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(config.loop_iteration_limit);
        context
            .runtime_limits_mut()
            .set_recursion_limit(config.recursion_limit);

        let natives: [(JsString, usize, NativeFunction); 3] = [
            (
                js_string!("__cloudfn_console_write"),
                2,
                NativeFunction::from_fn_ptr(console_write),
            ),
            (
                js_string!("__cloudfn_cloud_invoke"),
                3,
                NativeFunction::from_fn_ptr(cloud_invoke),
            ),
            (
                js_string!("__cloudfn_require"),
                1,
                NativeFunction::from_fn_ptr(require),
            ),
        ];
        for (name, length, body) in natives {
            context
                .register_global_builtin_callable(name, length, body)
                .map_err(|err| anyhow::anyhow!("failed to register native hook: {err}"))?;
        }

        let exports = context
            .eval(Source::from_bytes(PRELUDE))
            .map_err(|err| anyhow::anyhow!("failed to evaluate prelude: {err}"))?;
        let prelude = Prelude {
            make_context: prelude_member(&exports, "makeContext", &mut context)?,
            make_console: prelude_member(&exports, "makeConsole", &mut context)?,
            settle: prelude_member(&exports, "settle", &mut context)?,
            stringify: prelude_member(&exports, "stringify", &mut context)?,
            require: prelude_member(&exports, "require", &mut context)?,
        };

        STATE.with(|cell| {
            *cell.borrow_mut() = Some(IsolateState {
                cache: ModuleCache::new(config.cache_capacity),
                frames: Vec::new(),
                next_frame: 0,
                loading: HashSet::new(),
                prelude,
                lookup,
                max_call_depth: config.max_call_depth,
            })
        });

        Ok(Self { context })
    }

    /// Runs one invocation to completion. Never fails: every error ends up
    /// in [`ExecutionResult::error`].
    pub fn execute(&mut self, invocation: &Invocation) -> ExecutionResult {
        let max_depth = with_state(|state| state.max_call_depth).unwrap_or_default();
        let bridge = CloudBridge::new(
            invocation.owner_id.clone(),
            invocation.env.clone(),
            &invocation.name,
            max_depth,
        );
        execute_frame(&mut self.context, invocation, bridge)
    }

    /// Eagerly loads every published function of `owner_id`. Returns how
    /// many loaded successfully.
    pub fn preload(&mut self, owner_id: &str) -> usize {
        let siblings = sibling_functions(Some(owner_id));
        let bridge = CloudBridge::new(
            Some(owner_id.to_string()),
            Default::default(),
            "<preload>",
            0,
        );
        let Some(frame_id) = push_frame("<preload>", bridge, siblings) else {
            return 0;
        };
        let loaded = preload_siblings(&mut self.context, Some(owner_id), None);
        pop_frame(frame_id);
        loaded
    }

    pub fn clear_cache(&mut self, scope: &CacheScope) -> usize {
        with_state(|state| state.cache.invalidate(scope)).unwrap_or_default()
    }

    pub fn cache_stats(&self) -> CacheStats {
        with_state(|state| state.cache.stats()).unwrap_or_default()
    }

    /// Drops frames left behind by an aborted invocation.
    pub fn reset_frames(&mut self) {
        with_state(|state| {
            state.frames.clear();
            state.loading.clear();
        });
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        let state = STATE.with(|cell| cell.borrow_mut().take());
        drop(state);
    }
}

fn prelude_member(exports: &JsValue, name: &str, context: &mut Context) -> anyhow::Result<JsObject> {
    let object = exports
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("prelude did not return an object"))?;
    let member = object
        .get(JsString::from(name), context)
        .map_err(|err| anyhow::anyhow!("prelude member {name}: {err}"))?;
    member
        .as_callable()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("prelude member {name} is not callable"))
}

fn sibling_functions(owner_id: Option<&str>) -> Arc<Vec<Function>> {
    let Some(owner_id) = owner_id else {
        return Arc::new(Vec::new());
    };
    // Clone the lookup out so no borrow is held while it blocks.
    match with_state(|state| state.lookup.clone()) {
        Some(lookup) => Arc::new(
            lookup
                .published_functions(owner_id)
                .into_iter()
                .filter(|function| function.compiled.is_some())
                .collect(),
        ),
        None => Arc::new(Vec::new()),
    }
}

fn push_frame(name: &str, bridge: CloudBridge, siblings: Arc<Vec<Function>>) -> Option<i64> {
    with_state(|state| {
        state.next_frame += 1;
        let id = state.next_frame;
        state.frames.push(Frame {
            id,
            name: name.to_string(),
            console: ExecutionConsole::new(),
            bridge,
            siblings,
        });
        id
    })
}

/// Pops `id` and anything an aborted nested call left above it.
fn pop_frame(id: i64) -> ExecutionConsole {
    with_state(|state| match state.frames.iter().rposition(|frame| frame.id == id) {
        Some(position) => {
            let mut popped = state.frames.drain(position..);
            popped.next().map(|frame| frame.console).unwrap_or_default()
        }
        None => ExecutionConsole::new(),
    })
    .unwrap_or_default()
}

fn error_message(err: &JsError, context: &mut Context) -> String {
    match err.try_native(context) {
        Ok(native) => native.message().to_string(),
        Err(_) => err.to_string(),
    }
}

fn throw(message: impl Into<String>) -> JsError {
    JsNativeError::error().with_message(message.into()).into()
}

/// Executes `invocation` in a new frame on `context`. Shared by top-level
/// execution and synchronous `cloud.invoke` re-entry.
fn execute_frame(
    context: &mut Context,
    invocation: &Invocation,
    bridge: CloudBridge,
) -> ExecutionResult {
    let started = Instant::now();
    let siblings = sibling_functions(invocation.owner_id.as_deref());
    let Some(frame_id) = push_frame(&invocation.name, bridge, siblings) else {
        return ExecutionResult::failed(
            "execution engine is not initialised on this thread",
            Vec::new(),
            started.elapsed(),
        );
    };

    let outcome = run_frame(context, frame_id, invocation);
    let logs = pop_frame(frame_id).into_logs();

    match outcome {
        Ok(data) => ExecutionResult {
            data,
            logs,
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
        },
        Err(err) => ExecutionResult::failed(err.to_string(), logs, started.elapsed()),
    }
}

fn run_frame(
    context: &mut Context,
    frame_id: i64,
    invocation: &Invocation,
) -> RuntimeResult<Option<Value>> {
    let owner_id = invocation.owner_id.as_deref();
    preload_siblings(context, owner_id, Some(&invocation.name));

    let key = ModuleKey::new(owner_id, &invocation.name);
    let exports = load_module(
        context,
        &key,
        &invocation.name,
        &invocation.compiled,
        &invocation.hash,
    )?;

    let handler = exports
        .get(js_string!("default"), context)
        .map_err(|err| RuntimeError::Execution(error_message(&err, context)))?;
    let Some(handler) = handler.as_callable().cloned() else {
        return Err(RuntimeError::ExportShape(invocation.name.clone()));
    };

    let (prelude, env_json) = with_state(|state| {
        let env_json = state
            .frame(frame_id)
            .map(|frame| frame.bridge.env_json())
            .unwrap_or_else(|| "{}".to_string());
        (state.prelude.clone(), env_json)
    })
    .ok_or_else(|| RuntimeError::Execution("execution engine is not initialised".into()))?;

    let request_json = serde_json::to_string(&invocation.request)
        .map_err(|err| RuntimeError::Execution(err.to_string()))?;
    let ctx = prelude
        .make_context
        .call(
            &JsValue::undefined(),
            &[
                JsValue::from(frame_id as f64),
                JsString::from(request_json).into(),
                JsString::from(env_json).into(),
            ],
            context,
        )
        .map_err(|err| RuntimeError::Execution(error_message(&err, context)))?;

    let settled = prelude
        .settle
        .call(&JsValue::undefined(), &[handler.into(), ctx], context)
        .map_err(|err| RuntimeError::Execution(error_message(&err, context)))?;
    context.run_jobs();

    let settled = settled
        .as_object()
        .cloned()
        .ok_or_else(|| RuntimeError::Execution("settle returned no record".into()))?;
    let field = |name: &str, context: &mut Context| -> RuntimeResult<Option<String>> {
        let value = settled
            .get(JsString::from(name), context)
            .map_err(|err| RuntimeError::Execution(error_message(&err, context)))?;
        Ok(value.as_string().map(JsString::to_std_string_escaped))
    };

    match field("state", context)?.as_deref() {
        Some("fulfilled") => match field("json", context)? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|err| RuntimeError::Execution(err.to_string())),
            None => Ok(None),
        },
        Some("rejected") => Err(RuntimeError::Execution(
            field("error", context)?.unwrap_or_default(),
        )),
        _ => Err(RuntimeError::Execution(format!(
            "Function {} returned a promise that never settled",
            invocation.name
        ))),
    }
}

/// Loads every published sibling of the current frame except `skip`.
/// Failures are left for the importing function to surface.
fn preload_siblings(context: &mut Context, owner_id: Option<&str>, skip: Option<&str>) -> usize {
    let Some(siblings) = with_state(|state| state.frames.last().map(|f| f.siblings.clone())).flatten()
    else {
        return 0;
    };

    let mut loaded = 0;
    for sibling in siblings.iter() {
        if Some(sibling.name.as_str()) == skip {
            continue;
        }
        let Some(compiled) = sibling.compiled.as_deref() else {
            continue;
        };
        let key = ModuleKey::new(owner_id, &sibling.name);
        match load_module(context, &key, &sibling.name, compiled, &content_hash(compiled)) {
            Ok(_) => loaded += 1,
            Err(err) => {
                tracing::debug!(module = %key, error = %err, "Preload failed");
            }
        }
    }
    loaded
}

fn load_module(
    context: &mut Context,
    key: &ModuleKey,
    name: &str,
    compiled: &str,
    hash: &str,
) -> RuntimeResult<JsObject> {
    if let Some(module) = with_state(|state| state.cache.get(key, hash)).flatten() {
        return Ok(module);
    }

    let entered = with_state(|state| state.loading.insert(key.clone())).unwrap_or(false);
    if !entered {
        return Err(RuntimeError::Load {
            name: name.to_string(),
            message: "circular import detected".to_string(),
        });
    }

    let result = evaluate_module(context, name, compiled);
    with_state(|state| {
        state.loading.remove(key);
        if let Ok(module) = &result {
            state.cache.insert(key.clone(), hash, module.clone());
        }
    });
    if result.is_ok() {
        tracing::debug!(module = %key, "Module evaluated");
    }
    result
}

/// Evaluates compiled CommonJS in a fresh `(exports, require, module, console)`
/// scope and returns `module.exports`. The `console` binding logs into the
/// frame running this module.
fn evaluate_module(context: &mut Context, name: &str, compiled: &str) -> RuntimeResult<JsObject> {
    let load_error = |message: String| RuntimeError::Load {
        name: name.to_string(),
        message,
    };

    let (require, make_console) =
        with_state(|state| (state.prelude.require.clone(), state.prelude.make_console.clone()))
            .ok_or_else(|| load_error("execution engine is not initialised".into()))?;
    let console = make_console
        .call(&JsValue::undefined(), &[JsString::from(name).into()], context)
        .map_err(|err| load_error(error_message(&err, context)))?;
    let wrapped = format!("(function (exports, require, module, console) {{\n{compiled}\n}})");
    let factory = context
        .eval(Source::from_bytes(&wrapped))
        .map_err(|err| load_error(error_message(&err, context)))?;
    let factory = factory
        .as_callable()
        .cloned()
        .ok_or_else(|| load_error("module wrapper is not callable".into()))?;

    let exports = ObjectInitializer::new(context).build();
    let module = ObjectInitializer::new(context)
        .property(js_string!("exports"), exports.clone(), Attribute::all())
        .build();
    factory
        .call(
            &JsValue::undefined(),
            &[exports.into(), require.into(), module.clone().into(), console],
            context,
        )
        .map_err(|err| load_error(error_message(&err, context)))?;

    let exports = module
        .get(js_string!("exports"), context)
        .map_err(|err| load_error(error_message(&err, context)))?;
    exports
        .as_object()
        .cloned()
        .ok_or_else(|| load_error("module.exports is not an object".into()))
}

/// Which frame a console write belongs to: a frame id, or the name of the
/// module whose `console` binding made the call.
enum ConsoleTarget {
    Frame(i64),
    Module(String),
}

fn frame_arg(args: &[JsValue]) -> i64 {
    args.first()
        .and_then(JsValue::as_number)
        .map(|id| id as i64)
        .unwrap_or(TOP_FRAME)
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    match args.get(index) {
        Some(value) => Ok(value.to_string(context)?.to_std_string_escaped()),
        None => Ok(String::new()),
    }
}

fn log_arg(value: &JsValue, stringify: Option<&JsObject>, context: &mut Context) -> JsResult<LogArg> {
    if value.is_undefined() {
        return Ok(LogArg::Undefined);
    }
    if value.is_null() {
        return Ok(LogArg::Null);
    }
    if let Some(text) = value.as_string() {
        return Ok(LogArg::Text(text.to_std_string_escaped()));
    }
    if let (true, false, Some(stringify)) = (value.is_object(), value.is_callable(), stringify) {
        let json = stringify.call(&JsValue::undefined(), &[value.clone()], context)?;
        if let Some(parsed) = json
            .as_string()
            .and_then(|text| serde_json::from_str::<Value>(&text.to_std_string_escaped()).ok())
        {
            return Ok(LogArg::Json(parsed));
        }
    }
    Ok(LogArg::Text(value.to_string(context)?.to_std_string_escaped()))
}

/// `__cloudfn_console_write(frameOrModule, level, ...args)`
fn console_write(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let target = match args.first().and_then(JsValue::as_string) {
        Some(module) => ConsoleTarget::Module(module.to_std_string_escaped()),
        None => ConsoleTarget::Frame(frame_arg(args)),
    };
    let level = LogLevel::parse(&string_arg(args, 1, context)?).unwrap_or(LogLevel::Log);
    let stringify = with_state(|state| state.prelude.stringify.clone());

    let mut converted = Vec::with_capacity(args.len().saturating_sub(2));
    for value in args.iter().skip(2) {
        converted.push(log_arg(value, stringify.as_ref(), context)?);
    }

    let written = with_state(|state| {
        let frame = match &target {
            ConsoleTarget::Frame(id) => state.frame_mut(*id),
            ConsoleTarget::Module(name) => state.module_frame_mut(name),
        };
        match frame {
            Some(frame) => {
                frame.console.write(level, &converted);
                true
            }
            None => false,
        }
    })
    .unwrap_or(false);
    if !written {
        tracing::debug!(
            output = %ExecutionConsole::format(&converted),
            "Console output outside of an invocation"
        );
    }
    Ok(JsValue::undefined())
}

/// `__cloudfn_cloud_invoke(frame, name, payloadJson?)`: runs the callee
/// synchronously in a nested frame and returns its data as JSON text.
fn cloud_invoke(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let frame_id = frame_arg(args);
    let name = string_arg(args, 1, context)?;
    let payload = match args.get(2) {
        Some(value) if !value.is_undefined() => {
            Some(value.to_string(context)?.to_std_string_escaped())
        }
        _ => None,
    };

    let (bridge, lookup) = with_state(|state| {
        (
            state.frame(frame_id).map(|frame| frame.bridge.clone()),
            state.lookup.clone(),
        )
    })
    .ok_or_else(|| throw("execution engine is not initialised"))?;
    let bridge = bridge.ok_or_else(|| throw("cloud.invoke called outside of an invocation"))?;

    let data = match payload {
        Some(payload) => serde_json::from_str(&payload).map_err(|err| throw(err.to_string()))?,
        None => Value::Null,
    };
    let callee = bridge
        .resolve(lookup.as_ref(), &name)
        .map_err(|err| throw(err.to_string()))?;
    let child = bridge
        .enter(&callee.name)
        .map_err(|err| throw(err.to_string()))?;
    let invocation = child
        .invocation(&callee, data)
        .map_err(|err| throw(err.to_string()))?;

    tracing::debug!(
        callee = %callee.path,
        depth = child.depth(),
        "Nested invocation"
    );
    let result = execute_frame(context, &invocation, child);
    match (result.error, result.data) {
        (Some(message), _) => Err(throw(message)),
        (None, Some(data)) => Ok(JsString::from(data.to_string()).into()),
        (None, None) => Ok(JsValue::undefined()),
    }
}

fn normalize_specifier(specifier: &str) -> &str {
    let mut spec = specifier.trim();
    spec = spec.strip_prefix("@/").unwrap_or(spec);
    while let Some(rest) = spec.strip_prefix("./") {
        spec = rest;
    }
    for extension in [".ts", ".js"] {
        if let Some(rest) = spec.strip_suffix(extension) {
            spec = rest;
            break;
        }
    }
    spec.trim_matches('/')
}

/// `__cloudfn_require(specifier)`: resolves a sibling of the current frame by
/// path, then by name, and returns its exports.
fn require(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let specifier = string_arg(args, 0, context)?;
    let not_found = || throw(format!("Cannot find module '{specifier}'"));

    let (owner_id, siblings) = with_state(|state| {
        state.frames.last().map(|frame| {
            (
                frame.bridge.owner_id().map(str::to_string),
                frame.siblings.clone(),
            )
        })
    })
    .flatten()
    .ok_or_else(not_found)?;

    let wanted = normalize_specifier(&specifier);
    let target = siblings
        .iter()
        .find(|function| function.path == wanted)
        .or_else(|| siblings.iter().find(|function| function.name == wanted))
        .ok_or_else(not_found)?;
    let compiled = target.compiled.as_deref().ok_or_else(not_found)?;

    let key = ModuleKey::new(owner_id.as_deref(), &target.name);
    load_module(context, &key, &target.name, compiled, &content_hash(compiled))
        .map(JsValue::from)
        .map_err(|err| throw(err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::{function::content_hash, runtime::RequestContext};

    #[derive(Default)]
    struct Fixed(Vec<Function>);

    impl FunctionLookup for Fixed {
        fn find_function(&self, owner_id: &str, name: &str) -> Option<Function> {
            let owned = || self.0.iter().filter(|f| f.owner_id == owner_id);
            owned()
                .find(|f| f.name == name)
                .or_else(|| owned().find(|f| f.path == name))
                .cloned()
        }

        fn published_functions(&self, owner_id: &str) -> Vec<Function> {
            self.0
                .iter()
                .filter(|f| f.owner_id == owner_id && f.published)
                .cloned()
                .collect()
        }
    }

    fn published(name: &str, path: &str, compiled: &str) -> Function {
        let mut function = Function::new("u1", name, path, compiled);
        function.compiled = Some(compiled.to_string());
        function.published = true;
        function
    }

    fn isolate(functions: Vec<Function>) -> Isolate {
        isolate_with(functions, RuntimeConfig::default())
    }

    fn isolate_with(functions: Vec<Function>, config: RuntimeConfig) -> Isolate {
        Isolate::new(&config, Arc::new(Fixed(functions))).unwrap()
    }

    fn anonymous(name: &str, compiled: &str) -> Invocation {
        Invocation {
            function_id: name.to_string(),
            owner_id: None,
            name: name.to_string(),
            path: name.to_string(),
            compiled: compiled.to_string(),
            hash: content_hash(compiled),
            request: RequestContext::default(),
            env: Arc::new(HashMap::new()),
        }
    }

    fn owned(function: &Function) -> Invocation {
        Invocation::for_function(function, RequestContext::default(), Arc::new(HashMap::new()))
            .unwrap()
    }

    #[test]
    fn thrown_error_becomes_the_result_error() {
        let mut isolate = isolate(vec![]);
        let result = isolate.execute(&anonymous(
            "boom",
            "exports.default = function(){ throw new Error('boom') }",
        ));

        assert_eq!(result.data, None);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert!(result.logs.is_empty());
    }

    #[test]
    fn returns_data_and_captures_console_per_call() {
        let mut isolate = isolate(vec![]);
        let code = r#"
            exports.default = async function (ctx) {
                console.log("hello", { a: 1 });
                ctx.console.warn("careful", null, undefined, 3);
                return { echo: ctx.body, q: ctx.query.q };
            };
        "#;
        let mut invocation = anonymous("echo", code);
        invocation.request.body = json!({"x": true});
        invocation.request.query.insert("q".into(), "1".into());

        let result = isolate.execute(&invocation);
        assert_eq!(result.error, None);
        assert_eq!(result.data, Some(json!({"echo": {"x": true}, "q": "1"})));
        assert_eq!(
            result.logs,
            vec![
                "hello {\n  \"a\": 1\n}".to_string(),
                "[WARN] careful null undefined 3".to_string(),
            ]
        );

        let second = isolate.execute(&anonymous("quiet", "exports.default = () => 'ok'"));
        assert_eq!(second.data, Some(json!("ok")));
        assert!(second.logs.is_empty());
    }

    #[test]
    fn undefined_return_yields_no_data() {
        let mut isolate = isolate(vec![]);
        let result = isolate.execute(&anonymous("noop", "exports.default = () => {}"));
        assert!(result.is_success());
        assert_eq!(result.data, None);
    }

    #[test]
    fn missing_default_export_is_reported() {
        let mut isolate = isolate(vec![]);
        let result = isolate.execute(&anonymous("shape", "exports.handler = () => 1"));
        assert_eq!(
            result.error.as_deref(),
            Some("Function shape must export a default function")
        );
    }

    #[test]
    fn top_level_throw_is_a_load_error() {
        let mut isolate = isolate(vec![]);
        let result = isolate.execute(&anonymous("broken", "throw new Error('bad module')"));
        assert_eq!(
            result.error.as_deref(),
            Some("failed to load module broken: bad module")
        );
    }

    #[test]
    fn same_hash_is_served_from_cache() {
        let mut isolate = isolate(vec![]);
        let code = "globalThis.loads = (globalThis.loads || 0) + 1; exports.default = () => globalThis.loads;";
        let invocation = anonymous("counter", code);

        assert_eq!(isolate.execute(&invocation).data, Some(json!(1)));
        assert_eq!(isolate.execute(&invocation).data, Some(json!(1)));

        let mut changed = invocation.clone();
        changed.hash = "other".to_string();
        assert_eq!(isolate.execute(&changed).data, Some(json!(2)));

        let stats = isolate.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);

        assert_eq!(isolate.clear_cache(&CacheScope::All), 1);
        assert_eq!(isolate.execute(&changed).data, Some(json!(3)));
    }

    #[test]
    fn require_resolves_siblings_by_path_then_name() {
        let util = published("util", "lib/util", "exports.double = (n) => n * 2;");
        let main = published(
            "main",
            "main",
            r#"const a = require("@/lib/util"); const b = require("./util.ts");
               exports.default = () => a.double(2) + b.double(3);"#,
        );
        let mut isolate = isolate(vec![util, main.clone()]);

        let result = isolate.execute(&owned(&main));
        assert_eq!(result.error, None);
        assert_eq!(result.data, Some(json!(10)));
    }

    #[test]
    fn unknown_require_fails_to_load() {
        let main = published("main", "main", "require('missing'); exports.default = () => 1;");
        let mut isolate = isolate(vec![main.clone()]);

        let result = isolate.execute(&owned(&main));
        assert_eq!(
            result.error.as_deref(),
            Some("failed to load module main: Cannot find module 'missing'")
        );
    }

    #[test]
    fn circular_imports_fail() {
        let a = published("a", "a", "require('b'); exports.default = () => 1;");
        let b = published("b", "b", "require('a'); exports.value = 2;");
        let mut isolate = isolate(vec![a.clone(), b]);

        let error = isolate.execute(&owned(&a)).error.unwrap_or_default();
        assert!(error.contains("circular import detected"), "{error}");
    }

    #[test]
    fn preload_loads_published_functions() {
        let functions = vec![
            published("one", "one", "exports.default = () => 1;"),
            published("two", "two", "exports.default = () => 2;"),
            published("bad", "bad", "throw new Error('no');"),
        ];
        let mut isolate = isolate(functions);
        assert_eq!(isolate.preload("u1"), 2);
        assert_eq!(isolate.preload("nobody"), 0);
    }

    #[test]
    fn cloud_invoke_calls_a_sibling_with_data() {
        let users = published(
            "users",
            "api/users",
            r#"exports.default = (ctx) => { console.log("inner"); return { id: ctx.body.id, key: ctx.cloud.env.KEY }; };"#,
        );
        let main = published(
            "main",
            "main",
            r#"exports.default = async (ctx) => {
                   console.log("outer");
                   const user = await ctx.cloud.invoke("users", { id: 7 });
                   return user;
               };"#,
        );
        let mut isolate = isolate(vec![users, main.clone()]);
        let mut env = HashMap::new();
        env.insert("KEY".to_string(), "v".to_string());
        let invocation = Invocation::for_function(&main, RequestContext::default(), Arc::new(env))
            .unwrap();

        let result = isolate.execute(&invocation);
        assert_eq!(result.error, None);
        assert_eq!(result.data, Some(json!({"id": 7, "key": "v"})));
        assert_eq!(result.logs, vec!["outer".to_string()]);
    }

    #[test]
    fn caller_promise_callbacks_log_into_the_caller() {
        let callee = published("callee", "callee", r#"exports.default = () => { console.log("inner"); return 1; };"#);
        let main = published(
            "main",
            "main",
            r#"exports.default = async (ctx) => {
                   Promise.resolve().then(() => console.log("outer-microtask"));
                   return await ctx.cloud.invoke("callee");
               };"#,
        );
        let mut isolate = isolate(vec![callee, main.clone()]);

        let result = isolate.execute(&owned(&main));
        assert_eq!(result.error, None);
        assert_eq!(result.data, Some(json!(1)));
        assert_eq!(result.logs, vec!["outer-microtask".to_string()]);
    }

    #[test]
    fn cache_key_follows_the_compiled_code() {
        let mut function = published("version", "version", "exports.default = () => 'old';");
        let mut isolate = isolate(vec![]);
        assert_eq!(isolate.execute(&owned(&function)).data, Some(json!("old")));

        // Source hash left untouched, as for an edit that was never published.
        function.compiled = Some("exports.default = () => 'new';".to_string());
        let invocation = owned(&function);
        assert_eq!(invocation.hash, content_hash("exports.default = () => 'new';"));
        assert_eq!(isolate.execute(&invocation).data, Some(json!("new")));
    }

    #[test]
    fn enums_referencing_earlier_members_run() {
        let compiled = crate::runtime::compiler::compile(
            "enum E { A = 1, B = A * 2 }\nexport default () => E.B;",
        )
        .unwrap();
        let mut isolate = isolate(vec![]);
        let result = isolate.execute(&anonymous("e", &compiled));
        assert_eq!(result.error, None);
        assert_eq!(result.data, Some(json!(2)));
    }

    #[test]
    fn tenants_cannot_replace_host_globals() {
        let mut isolate = isolate(vec![]);
        let vandal = r#""use strict";
        exports.default = () => {
            const attempts = [
                () => { globalThis.console = { log() {} }; },
                () => { JSON.stringify = () => '"hijacked"'; },
                () => { Promise.prototype.then = function () {}; },
            ];
            return attempts.filter((attempt) => { try { attempt(); return true; } catch (e) { return false; } }).length;
        };"#;
        assert_eq!(isolate.execute(&anonymous("vandal", vandal)).data, Some(json!(0)));

        let victim = r#"exports.default = async () => {
            globalThis.console.log("still here");
            return await Promise.resolve({ ok: true });
        };"#;
        let result = isolate.execute(&anonymous("victim", victim));
        assert_eq!(result.data, Some(json!({ "ok": true })));
        assert_eq!(result.logs, vec!["still here".to_string()]);
    }

    #[test]
    fn cloud_invoke_rejects_unknown_functions() {
        let main = published(
            "main",
            "main",
            r#"exports.default = async (ctx) => {
                   try { await ctx.cloud.invoke("ghost"); } catch (err) { return err.message; }
               };"#,
        );
        let mut isolate = isolate(vec![main.clone()]);
        let result = isolate.execute(&owned(&main));
        assert_eq!(result.data, Some(json!("function not found: ghost")));
    }

    #[test]
    fn recursive_invoke_hits_the_depth_limit() {
        let looping = published(
            "loop",
            "loop",
            r#"exports.default = (ctx) => ctx.cloud.invoke("loop");"#,
        );
        let config = RuntimeConfig {
            max_call_depth: 3,
            ..RuntimeConfig::default()
        };
        let mut isolate = isolate_with(vec![looping.clone()], config);

        let error = isolate.execute(&owned(&looping)).error.unwrap_or_default();
        assert_eq!(
            error,
            "CallCycleError: maximum call depth of 3 exceeded (loop -> loop -> loop -> loop -> loop)"
        );
    }

    #[test]
    fn runaway_loops_are_aborted() {
        let config = RuntimeConfig {
            loop_iteration_limit: 10_000,
            ..RuntimeConfig::default()
        };
        let mut isolate = isolate_with(vec![], config);
        let result = isolate.execute(&anonymous("spin", "exports.default = () => { while (true) {} }"));
        assert!(result.error.is_some());

        let next = isolate.execute(&anonymous("fine", "exports.default = () => 'ok'"));
        assert_eq!(next.data, Some(json!("ok")));
    }

    #[test]
    fn one_isolate_per_thread() {
        let _first = isolate(vec![]);
        assert!(Isolate::new(&RuntimeConfig::default(), Arc::new(Fixed::default())).is_err());
    }
}
