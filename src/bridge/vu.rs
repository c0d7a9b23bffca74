use std::sync::Arc;

use rquickjs::prelude::Opt;
use rquickjs::{Ctx, Function, Object, Result, Value};

use super::value::{lossy_f64, raise, BridgeError, HostResult};
use crate::engine::vu::VuState;
use crate::utils::secs_to_duration;

/// Pause the script thread. Durations that are not positive or do not fit a
/// `Duration` return at once. Wakes early with a `CancelledError` when the
/// iteration is cancelled.
fn sleep(state: &VuState, secs: Option<&Value<'_>>) -> HostResult<()> {
    let Some(duration) = secs_to_duration(lossy_f64(secs)).filter(|d| !d.is_zero()) else {
        return Ok(());
    };
    let cancel = state.cancel_token();
    state.block_on(async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    })
}

pub fn register<'js>(ctx: &Ctx<'js>, state: Arc<VuState>) -> Result<()> {
    let vu = Object::new(ctx.clone())?;

    let sleep_state = state.clone();
    vu.set(
        "sleep",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, secs: Opt<Value<'js>>| -> Result<()> {
            sleep(&sleep_state, secs.0.as_ref()).map_err(|e| raise(&ctx, e))
        }),
    )?;

    let id_state = state.clone();
    vu.set("id", Function::new(ctx.clone(), move || id_state.identity.id()))?;

    vu.set(
        "iteration",
        Function::new(ctx.clone(), move || state.identity.iteration()),
    )?;

    ctx.globals().set("$vu", vu)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::engine::Runner;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    fn run(source: &str) -> String {
        let runner = Runner::new("vu_test.js", source).unwrap();
        let mut vu = runner.new_vu().unwrap();
        vu.reconfigure(9).unwrap();
        vu.run_once(&CancellationToken::new()).unwrap();
        vu.global_string("out")
    }

    #[test]
    fn test_sleep_waits() {
        let start = Instant::now();
        run("$vu.sleep(0.2); globalThis.out = 'done';");
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_sleep_ignores_bad_input() {
        let start = Instant::now();
        let out = run(
            "$vu.sleep(-1); $vu.sleep('soon'); $vu.sleep(); $vu.sleep(1e300); $vu.sleep(NaN); $vu.sleep(Infinity); \
             globalThis.out = 'done';",
        );
        assert_eq!(out, "done");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_identity_accessors() {
        let out = run("globalThis.out = `${$vu.id()}:${$vu.iteration()}`;");
        assert_eq!(out, "9:1");
    }
}
