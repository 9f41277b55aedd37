//! In-process evaluation of a Rego-compiled WASM module via `wasmtime`. The
//! teacher's own WASM probe loader (`mcp/security/wasm.rs`) is an
//! acknowledged placeholder; this is the real evaluation path spec.md §4.6
//! requires, added as a genuine dependency rather than carried forward as a
//! stub (see DESIGN.md).

use sidecar_core::AtomicOption;

use crate::model::{PolicyDecision, PolicyInput};
use crate::policy::loader::CompiledPolicy;
use crate::policy::{RawResult, interpret};

pub struct EmbeddedBackend {
	current: AtomicOption<CompiledPolicy>,
}

impl EmbeddedBackend {
	pub fn new(current: AtomicOption<CompiledPolicy>) -> Self {
		Self { current }
	}

	/// Evaluates `input` against whichever module is current at the moment
	/// this call dereferences the pointer; a concurrent hot-reload either
	/// lands before or after this load, never mid-evaluation. The actual
	/// WASM execution is synchronous CPU work, so it runs on the blocking
	/// pool rather than the async task running the pipeline, per spec.md
	/// §5's "no step may block the scheduler" rule.
	pub async fn evaluate_once(&self, input: &PolicyInput) -> Result<PolicyDecision, String> {
		let Some(module) = self.current.load_full() else {
			return Ok(PolicyDecision::deny("Policy module not initialized"));
		};
		let input = input.clone();
		let raw = tokio::task::spawn_blocking(move || module.evaluate(&input))
			.await
			.map_err(|e| format!("policy evaluation task panicked: {e}"))?
			.map_err(|e| e.to_string())?;
		match serde_json::from_value::<RawResult>(raw) {
			Ok(parsed) => Ok(interpret(parsed)),
			Err(_) => Ok(PolicyDecision::deny("Unexpected evaluation result")),
		}
	}
}
