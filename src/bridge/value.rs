//! Conversions between script values and host types, and the single adapter
//! that turns host failures into thrown script errors.

use rquickjs::function::Constructor;
use rquickjs::{Coerced, Ctx, Exception, Object, Type, Value};
use thiserror::Error;

use crate::error::HttpError;

/// Nesting limit for converting script objects into JSON.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub(crate) enum BridgeError {
    /// Structurally invalid arguments.
    #[error("{0}")]
    Type(String),
    #[error(transparent)]
    Http(#[from] HttpError),
    /// A script value could not be represented on the host side.
    #[error("{0}")]
    Conversion(String),
    #[error("test aborted")]
    Aborted,
    #[error("iteration cancelled")]
    Cancelled,
    #[error(transparent)]
    Js(#[from] rquickjs::Error),
}

impl BridgeError {
    /// The `name` the script sees on the thrown error.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            BridgeError::Type(_) => "TypeError",
            BridgeError::Http(_) => "HTTPError",
            BridgeError::Conversion(_) => "ConversionError",
            BridgeError::Aborted => "AbortError",
            BridgeError::Cancelled => "CancelledError",
            BridgeError::Js(_) => "Error",
        }
    }
}

pub(crate) type HostResult<T> = std::result::Result<T, BridgeError>;

/// Build an `Error` object with the given `name`.
pub(crate) fn error_value<'js>(ctx: &Ctx<'js>, kind: &str, message: &str) -> rquickjs::Result<Value<'js>> {
    let ctor: Constructor<'js> = ctx.globals().get("Error")?;
    let err: Object<'js> = ctor.construct((message,))?;
    err.set("name", kind)?;
    Ok(err.into_value())
}

/// Throw `err` into the script. Every host function funnels its failures
/// through here.
pub(crate) fn raise<'js>(ctx: &Ctx<'js>, err: BridgeError) -> rquickjs::Error {
    match err {
        BridgeError::Js(e) => e,
        BridgeError::Type(message) => Exception::throw_type(ctx, &message),
        other => match error_value(ctx, other.kind(), &other.to_string()) {
            Ok(value) => ctx.throw(value),
            Err(e) => e,
        },
    }
}

pub(crate) fn is_nullish(value: Option<&Value<'_>>) -> bool {
    value.map_or(true, |v| v.is_undefined() || v.is_null())
}

/// JS `String(value)`, with missing, nullish or unconvertible values becoming "".
pub(crate) fn lossy_string(value: Option<&Value<'_>>) -> String {
    let value = match value {
        Some(v) if !is_nullish(Some(v)) => v,
        _ => return String::new(),
    };
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    match value.get::<Coerced<String>>() {
        Ok(Coerced(s)) => s,
        Err(_) => {
            // toString() threw; drop the pending exception
            let _ = value.ctx().catch();
            String::new()
        }
    }
}

/// JS `Number(value)`, with anything non-finite becoming 0.
pub(crate) fn lossy_f64(value: Option<&Value<'_>>) -> f64 {
    let value = match value {
        Some(v) if !is_nullish(Some(v)) => v,
        _ => return 0.0,
    };
    let n = match value.get::<Coerced<f64>>() {
        Ok(Coerced(n)) => n,
        Err(_) => {
            let _ = value.ctx().catch();
            0.0
        }
    };
    if n.is_finite() {
        n
    } else {
        0.0
    }
}

/// JS truthiness.
pub(crate) fn truthy(value: &Value<'_>) -> bool {
    match value.type_of() {
        Type::Uninitialized | Type::Undefined | Type::Null => false,
        Type::Bool => value.as_bool().unwrap_or(false),
        Type::Int => value.as_int().unwrap_or(0) != 0,
        Type::Float => value.as_float().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Type::String => value
            .as_string()
            .and_then(|s| s.to_string().ok())
            .is_some_and(|s| !s.is_empty()),
        _ => true,
    }
}

/// Own enumerable properties of a plain object as (key, value) pairs.
pub(crate) fn entries<'js>(object: &Object<'js>) -> HostResult<Vec<(String, Value<'js>)>> {
    let mut out = Vec::new();
    for prop in object.props::<String, Value<'js>>() {
        out.push(prop?);
    }
    Ok(out)
}

/// A `{key: value}` object flattened to string pairs. `what` names the
/// argument in the TypeError raised for non-objects.
pub(crate) fn string_pairs(value: Option<&Value<'_>>, what: &str) -> HostResult<Vec<(String, String)>> {
    let object = match value {
        None => return Ok(Vec::new()),
        Some(v) if is_nullish(Some(v)) => return Ok(Vec::new()),
        Some(v) if v.is_function() => None,
        Some(v) => v.as_object(),
    }
    .ok_or_else(|| BridgeError::Type(format!("{} must be an object", what)))?;
    Ok(entries(object)?
        .into_iter()
        .map(|(k, v)| (k, lossy_string(Some(&v))))
        .collect())
}

/// Convert a script value into JSON. Functions, symbols and anything nested
/// deeper than [`MAX_DEPTH`] fail with a conversion error.
pub(crate) fn to_json(value: &Value<'_>) -> HostResult<serde_json::Value> {
    to_json_depth(value, 0)
}

fn to_json_depth(value: &Value<'_>, depth: usize) -> HostResult<serde_json::Value> {
    if depth > MAX_DEPTH {
        return Err(BridgeError::Conversion("value is nested too deeply".to_string()));
    }
    let json = match value.type_of() {
        Type::Uninitialized | Type::Undefined | Type::Null => serde_json::Value::Null,
        Type::Bool => serde_json::Value::Bool(value.as_bool().unwrap_or(false)),
        Type::Int => serde_json::Value::from(value.as_int().unwrap_or(0)),
        Type::Float => value
            .as_float()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Type::String => serde_json::Value::String(lossy_string(Some(value))),
        Type::BigInt => serde_json::Value::String(lossy_string(Some(value))),
        Type::Exception => serde_json::Value::String(lossy_string(Some(value))),
        Type::Array => {
            let mut items = Vec::new();
            if let Some(array) = value.as_array() {
                for item in array.iter::<Value>() {
                    items.push(to_json_depth(&item?, depth + 1)?);
                }
            }
            serde_json::Value::Array(items)
        }
        Type::Object => {
            let mut map = serde_json::Map::new();
            if let Some(object) = value.as_object() {
                for (key, item) in entries(object)? {
                    map.insert(key, to_json_depth(&item, depth + 1)?);
                }
            }
            serde_json::Value::Object(map)
        }
        _ => {
            return Err(BridgeError::Conversion(format!(
                "cannot convert a {} to a host value",
                value.type_name()
            )))
        }
    };
    Ok(json)
}
