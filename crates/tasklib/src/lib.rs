#![forbid(unsafe_code)]

//! Built-in sample task library.
//!
//! Linked into the stock worker and executor binaries; it doubles as the
//! fixture set for the integration tests and shows the registration
//! pattern user task libraries follow.

use std::time::Duration;

use spider_client::{DataRef, FunctionRegistry, TaskError};
use spider_core::envelope::unpack_value;

/// Registers every sample function.
pub fn register(registry: &mut FunctionRegistry) {
    registry.register("sum", |_ctx, (a, b): (i64, i64)| async move {
        Ok::<_, TaskError>(a + b)
    });

    registry.register("mix", |_ctx, (x, y): (f64, i64)| async move {
        Ok::<_, TaskError>(x + y as f64)
    });

    registry.register("join", |_ctx, (a, b): (String, String)| async move {
        Ok::<_, TaskError>(format!("{a}{b}"))
    });

    registry.register("swap", |_ctx, (a, b): (i64, i64)| async move {
        Ok::<_, TaskError>((b, a))
    });

    // Sleeps for the given milliseconds, then returns the value; used to
    // exercise timeouts and speculative re-dispatch.
    registry.register("sleepy", |_ctx, (millis, value): (i64, i64)| async move {
        tokio::time::sleep(Duration::from_millis(millis.max(0) as u64)).await;
        Ok::<_, TaskError>(value)
    });

    registry.register("error_test", |_ctx, (_v,): (i64,)| async move {
        Err::<i64, _>(TaskError::execution("Simulated error"))
    });

    registry.register("abort_test", |_ctx, (_v,): (i64,)| async move {
        Err::<i64, _>(TaskError::abort("Abort test"))
    });

    // Loads a datum and decodes it as an integer.
    registry.register("data_echo", |ctx, (data,): (DataRef,)| async move {
        let bytes = ctx
            .load_data(data)
            .await
            .map_err(|err| TaskError::execution(err.to_string()))?;
        unpack_value::<i64>(&bytes).map_err(|err| TaskError::execution(err.to_string()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_the_sample_roster() {
        let mut registry = FunctionRegistry::new();
        register(&mut registry);
        for name in ["sum", "mix", "join", "swap", "sleepy", "error_test", "abort_test"] {
            assert!(registry.contains(name), "{name} missing");
        }
        let sum = registry.get("sum").unwrap();
        assert_eq!(sum.input_tags(), ["int", "int"]);
        assert_eq!(sum.output_tags(), ["int"]);
        let mix = registry.get("mix").unwrap();
        assert_eq!(mix.input_tags(), ["float", "int"]);
        let data_echo = registry.get("data_echo").unwrap();
        assert_eq!(data_echo.input_tags(), ["data"]);
    }
}
