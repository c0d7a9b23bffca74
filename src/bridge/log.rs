use std::sync::Arc;

use rquickjs::prelude::Opt;
use rquickjs::{Ctx, Function, Object, Result, Value};
use tracing::Level;

use super::value::{entries, is_nullish, lossy_string, raise, to_json, HostResult};
use crate::engine::vu::VuState;

/// Unknown levels log at INFO.
fn parse_level(level: &str) -> Level {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Non-object `fields` are ignored; a field that cannot be converted fails
/// the whole call.
fn collect_fields(fields: Option<&Value<'_>>) -> HostResult<serde_json::Map<String, serde_json::Value>> {
    let mut map = serde_json::Map::new();
    let Some(object) = fields.filter(|v| !is_nullish(Some(*v)) && !v.is_function()).and_then(|v| v.as_object()) else {
        return Ok(map);
    };
    for (key, value) in entries(object)? {
        map.insert(key, to_json(&value)?);
    }
    Ok(map)
}

macro_rules! script_event {
    ($level:expr, $($field:tt)*) => {{
        let level = $level;
        if level == Level::TRACE {
            tracing::trace!(target: "volley::script", $($field)*)
        } else if level == Level::DEBUG {
            tracing::debug!(target: "volley::script", $($field)*)
        } else if level == Level::WARN {
            tracing::warn!(target: "volley::script", $($field)*)
        } else if level == Level::ERROR {
            tracing::error!(target: "volley::script", $($field)*)
        } else {
            tracing::info!(target: "volley::script", $($field)*)
        }
    }};
}

fn log(state: &VuState, level: Option<&Value<'_>>, message: Option<&Value<'_>>, fields: Option<&Value<'_>>) -> HostResult<()> {
    let level = parse_level(&lossy_string(level));
    let message = lossy_string(message);
    let fields = serde_json::Value::Object(collect_fields(fields)?);
    script_event!(
        level,
        vu = state.identity.id(),
        iteration = state.identity.iteration(),
        script = %state.filename,
        fields = %fields,
        "{}",
        message
    );
    Ok(())
}

pub fn register<'js>(ctx: &Ctx<'js>, state: Arc<VuState>) -> Result<()> {
    let log_obj = Object::new(ctx.clone())?;
    log_obj.set(
        "log",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, level: Opt<Value<'js>>, message: Opt<Value<'js>>, fields: Opt<Value<'js>>| -> Result<()> {
                log(&state, level.0.as_ref(), message.0.as_ref(), fields.0.as_ref()).map_err(|e| raise(&ctx, e))
            },
        ),
    )?;
    ctx.globals().set("$log", log_obj)?;
    Ok(())
}
