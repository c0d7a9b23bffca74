//! Host bindings installed into every VU context: `$http`, `$vu`, `$test`
//! and `$log`.

mod http;
mod log;
mod value;
mod vu;

use rquickjs::{Ctx, Result};
use std::sync::Arc;

use crate::engine::vu::VuState;

/// Evaluated once per VU after the native bindings are registered. Adds the
/// verb shorthands, level shorthands and the response prototype.
pub(crate) const BOOTSTRAP: &str = r#"
function HTTPResponse() {}
HTTPResponse.prototype.json = function () { return JSON.parse(this.body); };

['get', 'head', 'post', 'put', 'patch', 'delete', 'options'].forEach(function (verb) {
    var method = verb.toUpperCase();
    $http[verb] = function (url, data, params) { return $http.request(method, url, data, params); };
});

['debug', 'info', 'warn', 'error'].forEach(function (level) {
    $log[level] = function (msg, fields) { $log.log(level, msg, fields); };
});
"#;

pub(crate) fn register_globals<'js>(ctx: &Ctx<'js>, state: Arc<VuState>) -> Result<()> {
    http::register(ctx, state.clone())?;
    vu::register(ctx, state.clone())?;
    test::register(ctx, state.clone())?;
    log::register(ctx, state)?;
    Ok(())
}
