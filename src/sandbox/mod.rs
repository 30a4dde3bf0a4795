//! Sandboxed execution of JavaScript fragments against a fixed capability table.
//!
//! A fragment assigns its answer to [`RESULT_NAME`]. Whatever happens inside the
//! fragment, the caller gets a string back: the result, the no-result sentinel,
//! or a message starting with `Error: `.

pub mod capabilities;
pub mod guard;
pub mod toolkits;

pub use capabilities::{Capability, CapabilityGroup, CapabilitySet, HostContext};

use boa_engine::{Context, JsValue, Source};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use capabilities::Binding;

/// Name the fragment binds its final answer to.
pub const RESULT_NAME: &str = "result";

/// Returned when a fragment runs to completion without binding [`RESULT_NAME`].
pub const NO_RESULT_SENTINEL: &str =
    "No result produced: assign the final answer to `result`";

/// Removes reflection and dynamic code generation from the global namespace.
const PRELUDE: &str = r#"
(function () {
  var blocked = function () { throw new TypeError('dynamic code generation is not available'); };
  try { delete globalThis.eval; } catch (e) {}
  try { delete globalThis.Reflect; } catch (e) {}
  try { delete globalThis.Proxy; } catch (e) {}
  var kinds = [function () {}, async function () {}, function* () {}, async function* () {}];
  for (var i = 0; i < kinds.length; i++) {
    try {
      Object.defineProperty(Object.getPrototypeOf(kinds[i]), 'constructor', { value: blocked });
    } catch (e) {}
  }
  try { delete globalThis.Function; } catch (e) {}
})();
"#;

/// Bounds applied to every execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            loop_iteration_limit: 10_000_000,
            recursion_limit: 512,
        }
    }
}

/// Run `code` with the default limits. Never panics and never returns an error:
/// failures are rendered into the returned string.
pub fn execute(code: &str, capabilities: &Arc<CapabilitySet>) -> String {
    execute_with_limits(code, capabilities, &ExecutionLimits::default())
}

pub fn execute_with_limits(
    code: &str,
    capabilities: &Arc<CapabilitySet>,
    limits: &ExecutionLimits,
) -> String {
    if let Err(rejection) = guard::check_fragment(code, &capabilities.names()) {
        debug!("fragment rejected by static guard");
        return rejection;
    }

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let _binding = Binding::bind(capabilities);
        run_fragment(code, capabilities, limits)
    }));

    match outcome {
        Ok(Ok(output)) => output,
        Ok(Err(message)) => format!("Error: {}", message),
        Err(_) => {
            warn!("sandbox engine panicked while executing a fragment");
            "Error: the execution engine failed unexpectedly".to_string()
        }
    }
}

fn run_fragment(
    code: &str,
    capabilities: &CapabilitySet,
    limits: &ExecutionLimits,
) -> Result<String, String> {
    let mut context = Context::default();
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(limits.loop_iteration_limit);
    context
        .runtime_limits_mut()
        .set_recursion_limit(limits.recursion_limit);

    capabilities::install(&mut context, capabilities).map_err(|e| e.to_string())?;
    context
        .eval(Source::from_bytes(PRELUDE))
        .map_err(|e| format!("sandbox prelude failed: {}", e))?;

    context
        .eval(Source::from_bytes(code))
        .map_err(|e| e.to_string())?;

    let read_result = format!(
        "typeof {name} === 'undefined' ? undefined : {name}",
        name = RESULT_NAME
    );
    let value = context
        .eval(Source::from_bytes(&read_result))
        .map_err(|e| e.to_string())?;

    render(&value, &mut context)
}

fn render(value: &JsValue, context: &mut Context) -> Result<String, String> {
    if value.is_undefined() {
        return Ok(NO_RESULT_SENTINEL.to_string());
    }
    if value.is_object() && !value.is_callable() {
        if let Ok(json) = value.to_json(context) {
            return serde_json::to_string(&json).map_err(|e| e.to_string());
        }
    }
    value
        .to_string(context)
        .map(|s| s.to_std_string_escaped())
        .map_err(|e| e.to_string())
}

/// A capability table plus limits, executed off the async runtime.
#[derive(Debug, Clone)]
pub struct Sandbox {
    capabilities: Arc<CapabilitySet>,
    limits: ExecutionLimits,
}

impl Sandbox {
    pub fn new(capabilities: Arc<CapabilitySet>, limits: ExecutionLimits) -> Self {
        Self {
            capabilities,
            limits,
        }
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Execute on a blocking thread, bounded by the wall-clock timeout.
    pub async fn run(&self, code: &str) -> String {
        let capabilities = Arc::clone(&self.capabilities);
        let limits = self.limits;
        let code = code.to_string();
        let task = tokio::task::spawn_blocking(move || {
            execute_with_limits(&code, &capabilities, &limits)
        });

        match tokio::time::timeout(self.limits.timeout, task).await {
            Ok(Ok(output)) => output,
            Ok(Err(join_error)) => format!("Error: execution task failed: {}", join_error),
            Err(_) => format!(
                "Error: execution timed out after {}s",
                self.limits.timeout.as_secs_f64()
            ),
        }
    }
}
