//! Ember virtual machine: opcode dispatch loop, native-function registry,
//! and the tracing mark-sweep collector.
//!
//! # Modules
//!
//! - [`vm`]: [`vm::Vm`], the call-frame stack and opcode interpreter.
//! - [`gc`]: the mark-sweep collector [`vm::Vm`] drives.
//! - [`natives`]: the builtin globals every fresh [`vm::Vm`] registers.
//! - [`error`]: [`error::RuntimeError`], the interpreter's error type.
//! - [`config`]: [`config::Config`], the VM's tuning knobs.

pub mod config;
pub mod error;
pub mod gc;
pub mod natives;
pub mod vm;

pub use config::Config;
pub use error::{RuntimeError, StackFrame};
pub use vm::{InterpretError, Vm};

/// Compiles and runs `source` as a top-level program under a fresh [`Vm`],
/// returning the value of its last bare expression statement.
pub fn interpret(source: &str, module_name: &str, config: Config) -> Result<ember_core::value::Value, InterpretError> {
    let mut vm = Vm::new(config);
    vm.interpret(source, module_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_and_print_round_trip() {
        let result = interpret("1 + 2 * 3;", "test", Config::default());
        assert!(result.is_ok());
    }

    #[test]
    fn undefined_variable_is_a_runtime_error() {
        let result = interpret("print undefinedThing;", "test", Config::default());
        match result {
            Err(InterpretError::Runtime(e)) => assert!(e.message.contains("Undefined")),
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn fiber_round_trip() {
        let source = r#"
            def makeFiber() {
                return Fiber.new(def(x) {
                    var y = Fiber.yield(x + 1);
                    return y * 2;
                });
            }
            var f = makeFiber();
            var first = f.call(10);
            var second = f.call(first);
            print second;
        "#;
        let result = interpret(source, "test", Config::stress());
        assert!(result.is_ok(), "fiber round trip failed: {result:?}");
    }

    #[test]
    fn stress_gc_does_not_corrupt_live_values() {
        let source = r#"
            var total = 0;
            for (var i = 0; i < 64; i = i + 1) {
                var label = "item " + str(i);
                var items = [label, i, i * 2];
                total = total + items[2];
            }
            print total;
        "#;
        let result = interpret(source, "test", Config::stress());
        assert!(result.is_ok(), "stress GC run failed: {result:?}");
    }
}
