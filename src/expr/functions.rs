//! Built-in function library.

use crate::model::Type;

/// Element-wise functions of one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryFn {
    Abs, Acos, Acosh, Asin, Asinh, Atan, Atanh, Cbrt, Ceil, Cos, Cosh,
    Exp, Exp2, Floor, HzToMidi, Log, Log10, Log2, Logb, MidiToHz, Round,
    Sin, Sinh, Sqrt, Tan, Tanh, Trunc,
}

/// Element-wise functions of two arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFn {
    Atan2, Hypot, Max, Min, Pow,
}

/// Vector-to-scalar reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    All, Any, Sum, Mean,
}

/// A resolved function name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Function {
    Unary(UnaryFn),
    Binary(BinaryFn),
    Reduce(Reducer),
    /// `pi()` and `e()`
    Constant(f64),
    /// `linear(x, in_min, in_max, out_min, out_max)`
    Linear,
    /// `uniform(x)`: a fresh pseudo-random number in `[0, x)`
    Uniform,
}

impl Function {
    pub fn lookup(name: &str) -> Option<Function> {
        use BinaryFn as B;
        use UnaryFn as U;
        Some(match name {
            "abs" => Function::Unary(U::Abs),
            "acos" => Function::Unary(U::Acos),
            "acosh" => Function::Unary(U::Acosh),
            "asin" => Function::Unary(U::Asin),
            "asinh" => Function::Unary(U::Asinh),
            "atan" => Function::Unary(U::Atan),
            "atanh" => Function::Unary(U::Atanh),
            "cbrt" => Function::Unary(U::Cbrt),
            "ceil" => Function::Unary(U::Ceil),
            "cos" => Function::Unary(U::Cos),
            "cosh" => Function::Unary(U::Cosh),
            "exp" => Function::Unary(U::Exp),
            "exp2" => Function::Unary(U::Exp2),
            "floor" => Function::Unary(U::Floor),
            "hzToMidi" => Function::Unary(U::HzToMidi),
            "log" => Function::Unary(U::Log),
            "log10" => Function::Unary(U::Log10),
            "log2" => Function::Unary(U::Log2),
            "logb" => Function::Unary(U::Logb),
            "midiToHz" => Function::Unary(U::MidiToHz),
            "round" => Function::Unary(U::Round),
            "sin" => Function::Unary(U::Sin),
            "sinh" => Function::Unary(U::Sinh),
            "sqrt" => Function::Unary(U::Sqrt),
            "tan" => Function::Unary(U::Tan),
            "tanh" => Function::Unary(U::Tanh),
            "trunc" => Function::Unary(U::Trunc),
            "atan2" => Function::Binary(B::Atan2),
            "hypot" => Function::Binary(B::Hypot),
            "max" => Function::Binary(B::Max),
            "min" => Function::Binary(B::Min),
            "pow" => Function::Binary(B::Pow),
            "all" => Function::Reduce(Reducer::All),
            "any" => Function::Reduce(Reducer::Any),
            "sum" => Function::Reduce(Reducer::Sum),
            "mean" => Function::Reduce(Reducer::Mean),
            "pi" => Function::Constant(std::f64::consts::PI),
            "e" => Function::Constant(std::f64::consts::E),
            "linear" => Function::Linear,
            "uniform" => Function::Uniform,
            _ => return None,
        })
    }

    pub fn arity(self) -> usize {
        match self {
            Function::Unary(_) | Function::Reduce(_) | Function::Uniform => 1,
            Function::Binary(_) => 2,
            Function::Constant(_) => 0,
            Function::Linear => 5,
        }
    }
}

impl UnaryFn {
    pub fn apply(self, v: f64) -> f64 {
        match self {
            UnaryFn::Abs => v.abs(),
            UnaryFn::Acos => v.acos(),
            UnaryFn::Acosh => v.acosh(),
            UnaryFn::Asin => v.asin(),
            UnaryFn::Asinh => v.asinh(),
            UnaryFn::Atan => v.atan(),
            UnaryFn::Atanh => v.atanh(),
            UnaryFn::Cbrt => v.cbrt(),
            UnaryFn::Ceil => v.ceil(),
            UnaryFn::Cos => v.cos(),
            UnaryFn::Cosh => v.cosh(),
            UnaryFn::Exp => v.exp(),
            UnaryFn::Exp2 => v.exp2(),
            UnaryFn::Floor => v.floor(),
            UnaryFn::HzToMidi => 69.0 + 12.0 * (v / 440.0).log2(),
            UnaryFn::Log => v.ln(),
            UnaryFn::Log10 => v.log10(),
            UnaryFn::Log2 => v.log2(),
            // Binary exponent, as C's logb
            UnaryFn::Logb => v.abs().log2().floor(),
            UnaryFn::MidiToHz => 440.0 * ((v - 69.0) / 12.0).exp2(),
            UnaryFn::Round => v.round(),
            UnaryFn::Sin => v.sin(),
            UnaryFn::Sinh => v.sinh(),
            UnaryFn::Sqrt => v.sqrt(),
            UnaryFn::Tan => v.tan(),
            UnaryFn::Tanh => v.tanh(),
            UnaryFn::Trunc => v.trunc(),
        }
    }

    /// Result kind for an argument of kind `arg`. Integer-preserving
    /// functions keep int32; the rest compute in floating point.
    pub fn result_type(self, arg: Type) -> Type {
        match self {
            UnaryFn::Abs | UnaryFn::Ceil | UnaryFn::Floor | UnaryFn::Round | UnaryFn::Trunc => arg,
            _ => arg.promote(Type::Float32),
        }
    }
}

impl BinaryFn {
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryFn::Atan2 => a.atan2(b),
            BinaryFn::Hypot => a.hypot(b),
            BinaryFn::Max => a.max(b),
            BinaryFn::Min => a.min(b),
            BinaryFn::Pow => a.powf(b),
        }
    }

    pub fn result_type(self, a: Type, b: Type) -> Type {
        match self {
            BinaryFn::Max | BinaryFn::Min => a.promote(b),
            _ => a.promote(b).promote(Type::Float32),
        }
    }
}

impl Reducer {
    pub fn apply(self, values: &[f64]) -> f64 {
        match self {
            Reducer::All => values.iter().all(|v| *v != 0.0) as i32 as f64,
            Reducer::Any => values.iter().any(|v| *v != 0.0) as i32 as f64,
            Reducer::Sum => values.iter().sum(),
            Reducer::Mean => {
                if values.is_empty() {
                    0.0
                } else {
                    values.iter().sum::<f64>() / values.len() as f64
                }
            }
        }
    }

    pub fn result_type(self, arg: Type) -> Type {
        match self {
            Reducer::All | Reducer::Any => Type::Int32,
            Reducer::Sum => arg,
            Reducer::Mean => arg.promote(Type::Float32),
        }
    }
}
