use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Runs one pipeline stage, turning a panic into the stage's own error type.
pub(crate) fn guarded<T, E>(
    stage: impl FnOnce() -> Result<T, E>,
    on_panic: impl FnOnce(String) -> E,
) -> Result<T, E> {
    match catch_unwind(AssertUnwindSafe(stage)) {
        Ok(result) => result,
        Err(payload) => Err(on_panic(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_becomes_error() {
        let result: Result<(), String> = guarded(|| panic!("boom {}", 7), |msg| msg);
        assert_eq!(result.unwrap_err(), "boom 7");
    }

    #[test]
    fn test_passes_through_results() {
        let ok: Result<u32, String> = guarded(|| Ok(3), |msg| msg);
        assert_eq!(ok.unwrap(), 3);
        let err: Result<u32, String> = guarded(|| Err("no".to_string()), |msg| msg);
        assert_eq!(err.unwrap_err(), "no");
    }
}
