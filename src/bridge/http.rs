use std::sync::Arc;

use rquickjs::function::Constructor;
use rquickjs::prelude::Opt;
use rquickjs::{Array, Ctx, Function, IntoJs, Object, Result, Value};

use super::value::{
    entries, error_value, is_nullish, lossy_f64, lossy_string, raise, string_pairs, truthy, BridgeError, HostResult,
};
use crate::engine::batch::run_batch;
use crate::engine::executor::{ActionRequest, Body, HttpParams, HttpResponse};
use crate::engine::vu::VuState;
use crate::utils::{parse_duration_str, secs_to_duration};

fn millis(d: std::time::Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl<'js> IntoJs<'js> for HttpResponse {
    fn into_js(self, ctx: &Ctx<'js>) -> Result<Value<'js>> {
        // `HTTPResponse` comes from the bootstrap and carries `json()`.
        let obj = match ctx.globals().get::<_, Constructor>("HTTPResponse") {
            Ok(ctor) => ctor.construct::<_, Object>(())?,
            Err(_) => Object::new(ctx.clone())?,
        };
        obj.set("status", self.status)?;
        obj.set("proto", self.proto.as_str())?;
        obj.set("url", self.url.as_str())?;
        obj.set("method", self.method.as_str())?;
        obj.set("redirects", self.redirects)?;
        obj.set("body", String::from_utf8_lossy(&self.body).as_ref())?;

        let headers = Object::new(ctx.clone())?;
        for (k, v) in &self.headers {
            headers.set(k.as_str(), v.as_str())?;
        }
        obj.set("headers", headers)?;

        let timings = Object::new(ctx.clone())?;
        timings.set("duration", millis(self.timings.duration))?;
        timings.set("sending", millis(self.timings.sending))?;
        timings.set("waiting", millis(self.timings.waiting))?;
        timings.set("receiving", millis(self.timings.receiving))?;
        obj.set("timings", timings)?;

        Ok(obj.into_value())
    }
}

/// Strings are sent verbatim; objects become URL-encoded form pairs.
fn body_from_value(value: Option<&Value<'_>>) -> HostResult<Body> {
    let Some(value) = value.filter(|v| !is_nullish(Some(*v))) else {
        return Ok(Body::Empty);
    };
    if value.is_string() {
        return Ok(Body::Text(lossy_string(Some(value))));
    }
    if value.is_function() || value.is_symbol() {
        return Err(BridgeError::Conversion(format!("cannot send a {} as a request body", value.type_name())));
    }
    match value.as_object() {
        Some(object) => Ok(Body::Form(
            entries(object)?
                .into_iter()
                .map(|(k, v)| (k, lossy_string(Some(&v))))
                .collect(),
        )),
        None => Ok(Body::Text(lossy_string(Some(value)))),
    }
}

fn params_from_value(value: Option<&Value<'_>>) -> HostResult<HttpParams> {
    let Some(value) = value.filter(|v| !is_nullish(Some(*v))) else {
        return Ok(HttpParams::default());
    };
    let object = value
        .as_object()
        .filter(|_| !value.is_function())
        .ok_or_else(|| BridgeError::Type("request params must be an object".to_string()))?;

    let mut params = HttpParams::default();
    for (key, item) in entries(object)? {
        match key.as_str() {
            "headers" => params.headers = string_pairs(Some(&item), "params.headers")?,
            "cookies" => params.cookies = string_pairs(Some(&item), "params.cookies")?,
            "tags" => params.tags = string_pairs(Some(&item), "params.tags")?.into_iter().collect(),
            "followRedirects" if !item.is_undefined() => params.follow_redirects = Some(truthy(&item)),
            "maxRedirects" if !item.is_undefined() => {
                params.max_redirects = Some(lossy_f64(Some(&item)).clamp(0.0, u32::MAX as f64) as u32)
            }
            "timeout" => {
                params.timeout = if item.is_string() {
                    parse_duration_str(&lossy_string(Some(&item)))
                } else if is_nullish(Some(&item)) {
                    None
                } else {
                    // Milliseconds; non-positive or unrepresentable values disable the timeout.
                    Some(secs_to_duration(lossy_f64(Some(&item)) / 1000.0).unwrap_or_default())
                }
            }
            "name" if !is_nullish(Some(&item)) => params.name = Some(lossy_string(Some(&item))),
            _ => {}
        }
    }
    Ok(params)
}

fn request<'js>(
    ctx: &Ctx<'js>,
    state: &VuState,
    method: Option<Value<'js>>,
    url: Option<Value<'js>>,
    body: Option<Value<'js>>,
    params: Option<Value<'js>>,
) -> HostResult<Value<'js>> {
    let method = match lossy_string(method.as_ref()) {
        m if m.is_empty() => "GET".to_string(),
        m => m,
    };
    let action = ActionRequest {
        method,
        url: lossy_string(url.as_ref()),
        body: body_from_value(body.as_ref())?,
        params: params_from_value(params.as_ref())?,
    };
    let cancel = state.cancel_token();
    let response = state.block_on(state.executor.execute(action, &cancel))?;
    Ok(response.into_js(ctx)?)
}

/// One batch entry, read from either `[method, url, body, params]` or
/// `{method, url, body, params}`.
#[derive(Default)]
struct BatchRequest<'js> {
    method: Option<Value<'js>>,
    url: Option<Value<'js>>,
    body: Option<Value<'js>>,
    params: Option<Value<'js>>,
}

impl<'js> BatchRequest<'js> {
    fn read(entry: &Value<'js>) -> HostResult<Self> {
        if entry.is_string() {
            return Ok(Self {
                url: Some(entry.clone()),
                ..Default::default()
            });
        }
        let object = entry
            .as_object()
            .filter(|_| !entry.is_function())
            .ok_or_else(|| BridgeError::Type("batch entries must be strings or objects".to_string()))?;

        let fields = entries(object)?;
        // A lone entry is the URL of a GET, whatever its key.
        if let [(_, value)] = fields.as_slice() {
            return Ok(Self {
                url: Some(value.clone()),
                ..Default::default()
            });
        }

        let mut request = Self::default();
        for (key, value) in fields {
            let slot = match key.as_str() {
                "0" | "method" => &mut request.method,
                "1" | "url" => &mut request.url,
                "2" | "body" => &mut request.body,
                "3" | "params" => &mut request.params,
                other => return Err(BridgeError::Type(format!("unknown batch request field '{}'", other))),
            };
            *slot = Some(value);
        }
        Ok(request)
    }

    /// Params are validated here so a bad params value fails the whole batch;
    /// body problems stay with the entry.
    fn into_action(self) -> HostResult<HostResult<ActionRequest>> {
        let params = params_from_value(self.params.as_ref())?;
        let method = match lossy_string(self.method.as_ref()) {
            m if m.is_empty() => "GET".to_string(),
            m => m,
        };
        let url = lossy_string(self.url.as_ref());
        Ok(body_from_value(self.body.as_ref()).map(|body| ActionRequest {
            method,
            url,
            body,
            params,
        }))
    }
}

fn batch<'js>(ctx: &Ctx<'js>, state: &VuState, collection: Option<Value<'js>>) -> HostResult<Value<'js>> {
    let collection = collection
        .filter(|v| v.as_object().is_some() && !v.is_function())
        .ok_or_else(|| BridgeError::Type("$http.batch expects an array or object".to_string()))?;
    let is_array = collection.is_array();
    let Some(object) = collection.as_object() else {
        return Err(BridgeError::Type("$http.batch expects an array or object".to_string()));
    };

    let mut keys = Vec::new();
    let mut outcomes: Vec<Option<HostResult<HttpResponse>>> = Vec::new();
    let mut requests = Vec::new();
    let mut pending = Vec::new();
    for (key, entry) in entries(object)? {
        match BatchRequest::read(&entry)?.into_action()? {
            Ok(action) => {
                pending.push(outcomes.len());
                requests.push(action);
                outcomes.push(None);
            }
            Err(err) => outcomes.push(Some(Err(err))),
        }
        keys.push(key);
    }

    let cancel = state.cancel_token();
    let results = state.block_on(run_batch(state.executor.clone(), requests, cancel));
    for (index, result) in pending.into_iter().zip(results) {
        outcomes[index] = Some(result.map_err(BridgeError::from));
    }

    let out = if is_array {
        Array::new(ctx.clone())?.into_object()
    } else {
        Object::new(ctx.clone())?
    };
    for (key, outcome) in keys.into_iter().zip(outcomes) {
        let value = match outcome {
            Some(Ok(response)) => response.into_js(ctx)?,
            Some(Err(err)) => error_value(ctx, err.kind(), &err.to_string())?,
            None => Value::new_undefined(ctx.clone()),
        };
        match key.parse::<u32>() {
            Ok(index) if is_array => out.set(index, value)?,
            _ => out.set(key, value)?,
        }
    }
    Ok(out.into_value())
}

pub fn register<'js>(ctx: &Ctx<'js>, state: Arc<VuState>) -> Result<()> {
    let http = Object::new(ctx.clone())?;

    let request_state = state.clone();
    http.set(
        "request",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  method: Opt<Value<'js>>,
                  url: Opt<Value<'js>>,
                  body: Opt<Value<'js>>,
                  params: Opt<Value<'js>>|
                  -> Result<Value<'js>> {
                request(&ctx, &request_state, method.0, url.0, body.0, params.0).map_err(|e| raise(&ctx, e))
            },
        ),
    )?;

    http.set(
        "batch",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, collection: Opt<Value<'js>>| -> Result<Value<'js>> {
            batch(&ctx, &state, collection.0).map_err(|e| raise(&ctx, e))
        }),
    )?;

    ctx.globals().set("$http", http)?;
    Ok(())
}
