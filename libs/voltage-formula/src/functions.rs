//! Pure named functions
//!
//! Registered functions are side-effect free and receive resolved argument
//! values only. They are installed into the evaluator context of every
//! execution; evalexpr's own built-ins (`if`, `floor`, ...) stay reachable
//! for any name not registered here.

use crate::error::{FormulaError, Result};
use crate::value::FormulaValue;
use evalexpr::{ContextWithMutableFunctions, EvalexprError, Function, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Signature of a registered function
pub type PureFunction = Arc<dyn Fn(&[FormulaValue]) -> Result<FormulaValue> + Send + Sync>;

/// Registry of pure functions callable by name
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, PureFunction>,
}

impl FunctionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `scale`, `clamp`, `abs`, `min`, `max`, `round`
    /// and `sign`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("scale", |args| {
            let [value, factor] = numbers::<2>("scale", args)?;
            Ok(scale(value, factor).into())
        });
        registry.register("clamp", |args| {
            let [value, min, max] = numbers::<3>("clamp", args)?;
            if min > max {
                return Err(FormulaError::function(format!(
                    "clamp(): lower bound {} exceeds upper bound {}",
                    min, max
                )));
            }
            Ok(clamp(value, min, max).into())
        });
        registry.register("abs", |args| {
            let [value] = numbers::<1>("abs", args)?;
            Ok(value.abs().into())
        });
        registry.register("min", |args| {
            variadic("min", args, f64::min).map(FormulaValue::from)
        });
        registry.register("max", |args| {
            variadic("max", args, f64::max).map(FormulaValue::from)
        });
        registry.register("round", |args| match args.len() {
            1 => {
                let [value] = numbers::<1>("round", args)?;
                Ok(round(value, 0).into())
            },
            _ => {
                let [value, decimals] = numbers::<2>("round", args)?;
                Ok(round(value, decimals as i32).into())
            },
        });
        registry.register("sign", |args| {
            let [value] = numbers::<1>("sign", args)?;
            Ok(sign(value).into())
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[FormulaValue]) -> Result<FormulaValue> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Call a function directly
    pub fn call(&self, name: &str, args: &[FormulaValue]) -> Result<FormulaValue> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| FormulaError::function(format!("Unknown function: {}", name)))?;
        function(args)
    }

    /// Install every registered function into an evaluator context
    pub fn install(&self, context: &mut evalexpr::HashMapContext) -> Result<()> {
        for (name, function) in &self.functions {
            let function = function.clone();
            context
                .set_function(
                    name.clone(),
                    Function::new(move |argument| {
                        let args = unpack_arguments(argument)?;
                        let result =
                            function(&args).map_err(|e| EvalexprError::CustomMessage(e.to_string()))?;
                        Ok(result.to_evalexpr())
                    }),
                )
                .map_err(|e| {
                    FormulaError::function(format!("Failed to register {}: {}", name, e))
                })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.functions.keys()).finish()
    }
}

/// evalexpr passes several arguments as one tuple, one argument as itself and
/// no argument as `Empty`
fn unpack_arguments(argument: &Value) -> std::result::Result<Vec<FormulaValue>, EvalexprError> {
    let values = match argument {
        Value::Tuple(values) => values.clone(),
        Value::Empty => Vec::new(),
        other => vec![other.clone()],
    };
    values
        .into_iter()
        .map(|v| {
            FormulaValue::from_evalexpr(v).map_err(|e| EvalexprError::CustomMessage(e.to_string()))
        })
        .collect()
}

/// Exactly `N` numeric arguments
fn numbers<const N: usize>(name: &str, args: &[FormulaValue]) -> Result<[f64; N]> {
    if args.len() != N {
        return Err(FormulaError::function(format!(
            "{}() expects {} argument(s), got {}",
            name,
            N,
            args.len()
        )));
    }
    let mut out = [0.0; N];
    for (slot, arg) in out.iter_mut().zip(args) {
        *slot = arg.as_number().ok_or_else(|| {
            FormulaError::function(format!("{}() expects numbers, got '{}'", name, arg))
        })?;
    }
    Ok(out)
}

fn variadic(name: &str, args: &[FormulaValue], fold: fn(f64, f64) -> f64) -> Result<f64> {
    let mut iter = args.iter().map(|arg| {
        arg.as_number().ok_or_else(|| {
            FormulaError::function(format!("{}() expects numbers, got '{}'", name, arg))
        })
    });
    let first = iter
        .next()
        .ok_or_else(|| FormulaError::function(format!("{}() needs at least one argument", name)))??;
    iter.try_fold(first, |acc, next| next.map(|n| fold(acc, n)))
}

// === Stateless functions (pure, no state needed) ===

/// Scale a value by a factor
pub fn scale(value: f64, factor: f64) -> f64 {
    value * factor
}

/// Clamp a value to a range
pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.clamp(min, max)
}

/// Round to specified decimal places
pub fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

/// Sign function: returns -1, 0, or 1
pub fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}
