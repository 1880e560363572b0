//! The `math` module: a small numeric surface over the value model.

use crate::{
    builtins::{ArgList, Builtin, minmax, take1, take2},
    error::{RunError, RunResult},
    heap::Heap,
    intern::Interns,
    modules::ModuleFunction,
    resource::ResourceTracker,
    value::Value,
};

pub(super) const MEMBER_COUNT: usize = 9;

/// Member lookup for the `math` module value.
pub(super) fn member(name: &str) -> Option<Value> {
    let value = match name {
        "abs" => Value::Builtin(Builtin::Module(ModuleFunction::MathAbs)),
        "floor" => Value::Builtin(Builtin::Module(ModuleFunction::MathFloor)),
        "ceil" => Value::Builtin(Builtin::Module(ModuleFunction::MathCeil)),
        "sqrt" => Value::Builtin(Builtin::Module(ModuleFunction::MathSqrt)),
        "pow" => Value::Builtin(Builtin::Module(ModuleFunction::MathPow)),
        "min" => Value::Builtin(Builtin::Module(ModuleFunction::MathMin)),
        "max" => Value::Builtin(Builtin::Module(ModuleFunction::MathMax)),
        "pi" => Value::Float(std::f64::consts::PI),
        "e" => Value::Float(std::f64::consts::E),
        _ => return None,
    };
    Some(value)
}

fn numeric<T: ResourceTracker>(heap: &mut Heap<T>, value: Value, name: &str) -> RunResult<f64> {
    match value {
        Value::Int(i) => Ok(i as f64),
        Value::Float(f) => Ok(f),
        other => {
            let type_name = other.type_of(heap);
            other.drop_with_heap(heap);
            Err(RunError::type_error(format!("{name} expects a number, not {type_name}")))
        }
    }
}

pub(super) fn abs<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let value = take1(args, "math.abs", heap)?;
    match value {
        Value::Int(i) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| RunError::value("math.abs overflows on i64 minimum")),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => {
            let type_name = other.type_of(heap);
            other.drop_with_heap(heap);
            Err(RunError::type_error(format!("math.abs expects a number, not {type_name}")))
        }
    }
}

pub(super) fn floor<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let value = take1(args, "math.floor", heap)?;
    if let Value::Int(i) = value {
        return Ok(Value::Int(i));
    }
    numeric(heap, value, "math.floor").map(|f| Value::Float(f.floor()))
}

pub(super) fn ceil<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let value = take1(args, "math.ceil", heap)?;
    if let Value::Int(i) = value {
        return Ok(Value::Int(i));
    }
    numeric(heap, value, "math.ceil").map(|f| Value::Float(f.ceil()))
}

pub(super) fn sqrt<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let value = take1(args, "math.sqrt", heap)?;
    numeric(heap, value, "math.sqrt").map(|f| Value::Float(f.sqrt()))
}

pub(super) fn pow<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let (base, exponent) = take2(args, "math.pow", heap)?;
    let base = numeric(heap, base, "math.pow")?;
    let exponent = numeric(heap, exponent, "math.pow")?;
    Ok(Value::Float(base.powf(exponent)))
}

/// Same selection semantics as the universe `min`: arguments, or a single
/// array's elements.
pub(super) fn min<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    minmax::min(heap, args, interns)
}

pub(super) fn max<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    minmax::max(heap, args, interns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn abs_and_sqrt() {
        let mut heap = Heap::new(NoLimitTracker);
        assert_eq!(abs(&mut heap, [Value::Int(-4)].into_iter().collect()).unwrap(), Value::Int(4));
        assert_eq!(
            sqrt(&mut heap, [Value::Float(9.0)].into_iter().collect()).unwrap(),
            Value::Float(3.0)
        );
    }

    #[test]
    fn floor_keeps_ints() {
        let mut heap = Heap::new(NoLimitTracker);
        assert_eq!(floor(&mut heap, [Value::Int(7)].into_iter().collect()).unwrap(), Value::Int(7));
        assert_eq!(
            floor(&mut heap, [Value::Float(1.9)].into_iter().collect()).unwrap(),
            Value::Float(1.0)
        );
    }

    #[test]
    fn min_and_max_are_members() {
        assert!(member("min").is_some());
        assert!(member("max").is_some());
        let mut heap = Heap::new(NoLimitTracker);
        let interns = Interns::default();
        let args: ArgList = [Value::Int(4), Value::Int(2), Value::Int(9)].into_iter().collect();
        assert_eq!(min(&mut heap, args, &interns).unwrap(), Value::Int(2));
        let args: ArgList = [Value::Int(4), Value::Int(2), Value::Int(9)].into_iter().collect();
        assert_eq!(max(&mut heap, args, &interns).unwrap(), Value::Int(9));
    }
}
