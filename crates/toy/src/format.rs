//! The printf-style formatter behind `format` and `fmt.printf`.
//!
//! Verbs: `%s` (display), `%d` (int), `%f` (float), `%x`/`%X` (int or
//! bytes as hex), `%q` (quoted), `%v` (repr), `%%` (literal percent).
//! Flags `+` and space sign positive numbers; `#` selects the alternate
//! form (`0x` prefix for `%x`, a decimal point kept on `%f` even at zero
//! precision). Width is digits or `*`, which consumes the next int
//! argument; `.precision` follows the width.
//!
//! The formatter never panics: a bad template, a missing or superfluous
//! argument, or a type mismatch produces a descriptive error.

use std::fmt::Write as _;

use crate::{
    builtins::ArgList,
    error::{RunError, RunResult},
    heap::{DropWithHeap, Heap, HeapData},
    intern::Interns,
    resource::ResourceTracker,
    value::{self, Value},
};

/// Formats `args[0]` as a template against the remaining arguments.
/// Consumes (and releases) every argument.
pub(crate) fn format_args<T: ResourceTracker>(
    heap: &mut Heap<T>,
    args: ArgList,
    interns: &Interns,
) -> RunResult<String> {
    if args.is_empty() {
        return Err(RunError::arity("format takes at least 1 argument, got 0"));
    }
    let Some(template) = args[0].as_str(heap, interns).map(str::to_owned) else {
        let type_name = args[0].type_of(heap);
        args.drop_with_heap(heap);
        return Err(RunError::type_error(format!(
            "format template must be a string, not {type_name}"
        )));
    };
    let result = run_template(&template, &args[1..], heap, interns);
    args.drop_with_heap(heap);
    result
}

/// Formats a template against borrowed values.
pub(crate) fn run_template<T: ResourceTracker>(
    template: &str,
    values: &[Value],
    heap: &Heap<T>,
    interns: &Interns,
) -> RunResult<String> {
    fn take_arg<'v>(values: &'v [Value], next_arg: &mut usize) -> RunResult<&'v Value> {
        let value = values
            .get(*next_arg)
            .ok_or_else(|| RunError::value(format!("format: missing argument for verb %{}", *next_arg + 1)))?;
        *next_arg += 1;
        Ok(value)
    }

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_arg = 0_usize;

    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }

        // Flags.
        let mut spec = Spec::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '#' => spec.alt = true,
                _ => break,
            }
            chars.next();
        }

        // Width: digits or `*` consuming the next int argument.
        if chars.peek() == Some(&'*') {
            chars.next();
            let width_value = take_arg(values, &mut next_arg)?;
            let Some(width) = width_value.as_int() else {
                return Err(RunError::type_error(format!(
                    "format: * width must be an int, not {}",
                    width_value.type_of(heap)
                )));
            };
            spec.width = usize::try_from(width).ok();
        } else {
            let mut width = None;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                width = Some(width.unwrap_or(0) * 10 + d as usize);
                chars.next();
            }
            spec.width = width;
        }

        // Precision.
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut precision = 0_usize;
            let mut any = false;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                precision = precision * 10 + d as usize;
                any = true;
                chars.next();
            }
            spec.precision = any.then_some(precision);
        }

        let Some(verb) = chars.next() else {
            return Err(RunError::value("format: template ends inside a verb"));
        };

        match verb {
            '%' => out.push('%'),
            's' => {
                let value = take_arg(values, &mut next_arg)?;
                let mut text = value::fmt_display(value, heap, interns);
                if let Some(precision) = spec.precision {
                    text = text.chars().take(precision).collect();
                }
                spec.pad_into(&mut out, &text);
            }
            'd' => {
                let value = take_arg(values, &mut next_arg)?;
                let Some(i) = value.as_int() else {
                    return Err(RunError::type_error(format!(
                        "format: %d expects an int, not {}",
                        value.type_of(heap)
                    )));
                };
                let text = spec.signed_int(i);
                spec.pad_into(&mut out, &text);
            }
            'f' => {
                let value = take_arg(values, &mut next_arg)?;
                let f = match value {
                    Value::Float(f) => *f,
                    Value::Int(i) => *i as f64,
                    other => {
                        return Err(RunError::type_error(format!(
                            "format: %f expects a float, not {}",
                            other.type_of(heap)
                        )));
                    }
                };
                let precision = spec.precision.unwrap_or(6);
                let mut text = format!("{f:.precision$}");
                // Alternate form keeps the decimal point when a zero
                // precision would otherwise drop it.
                if spec.alt && f.is_finite() && !text.contains('.') {
                    text.push('.');
                }
                if f >= 0.0 {
                    if spec.plus {
                        text.insert(0, '+');
                    } else if spec.space {
                        text.insert(0, ' ');
                    }
                }
                spec.pad_into(&mut out, &text);
            }
            'x' | 'X' => {
                let value = take_arg(values, &mut next_arg)?;
                let text = hex_value(value, heap, verb == 'X', spec.alt)?;
                spec.pad_into(&mut out, &text);
            }
            'q' => {
                let value = take_arg(values, &mut next_arg)?;
                let text = value::fmt_repr(value, heap, interns);
                // Repr already quotes strings and chars; quote the rest so
                // %q output is always delimited.
                let quoted = match value {
                    Value::InternString(_) | Value::Char(_) => text,
                    Value::Ref(id) if matches!(heap.get(*id), HeapData::Str(_)) => text,
                    _ => format!("{text:?}"),
                };
                spec.pad_into(&mut out, &quoted);
            }
            'v' => {
                let value = take_arg(values, &mut next_arg)?;
                let text = value::fmt_repr(value, heap, interns);
                spec.pad_into(&mut out, &text);
            }
            other => {
                return Err(RunError::value(format!("format: unknown verb %{other}")));
            }
        }
    }

    if next_arg < values.len() {
        return Err(RunError::value(format!(
            "format: {} superfluous argument(s)",
            values.len() - next_arg
        )));
    }
    Ok(out)
}

fn hex_value<T: ResourceTracker>(value: &Value, heap: &Heap<T>, upper: bool, alt: bool) -> RunResult<String> {
    let mut text = String::new();
    match value {
        Value::Int(i) => {
            let magnitude = i.unsigned_abs();
            if *i < 0 {
                text.push('-');
            }
            if alt {
                text.push_str("0x");
            }
            if upper {
                let _ = write!(text, "{magnitude:X}");
            } else {
                let _ = write!(text, "{magnitude:x}");
            }
            Ok(text)
        }
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Bytes(bytes) => {
                if alt {
                    text.push_str("0x");
                }
                for byte in bytes.as_slice() {
                    if upper {
                        let _ = write!(text, "{byte:02X}");
                    } else {
                        let _ = write!(text, "{byte:02x}");
                    }
                }
                Ok(text)
            }
            other => Err(RunError::type_error(format!(
                "format: %x expects an int or bytes, not {}",
                other.type_of()
            ))),
        },
        other => Err(RunError::type_error(format!(
            "format: %x expects an int or bytes, not {}",
            other.type_of(heap)
        ))),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Spec {
    plus: bool,
    space: bool,
    alt: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

impl Spec {
    /// Right-aligns `text` to the width, space-padded.
    fn pad_into(self, out: &mut String, text: &str) {
        let len = text.chars().count();
        if let Some(width) = self.width
            && width > len
        {
            for _ in 0..width - len {
                out.push(' ');
            }
        }
        out.push_str(text);
    }

    fn signed_int(self, i: i64) -> String {
        if i >= 0 {
            if self.plus {
                return format!("+{i}");
            }
            if self.space {
                return format!(" {i}");
            }
        }
        format!("{i}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn fmt(template: &str, values: &[Value]) -> RunResult<String> {
        let heap = Heap::new(NoLimitTracker);
        let interns = Interns::default();
        run_template(template, values, &heap, &interns)
    }

    #[test]
    fn basic_verbs() {
        assert_eq!(fmt("%d items", &[Value::Int(3)]).unwrap(), "3 items");
        assert_eq!(fmt("%f", &[Value::Float(1.5)]).unwrap(), "1.500000");
        assert_eq!(fmt("%.2f", &[Value::Float(1.567)]).unwrap(), "1.57");
        assert_eq!(fmt("%x", &[Value::Int(255)]).unwrap(), "ff");
        assert_eq!(fmt("%X", &[Value::Int(255)]).unwrap(), "FF");
        assert_eq!(fmt("%#x", &[Value::Int(255)]).unwrap(), "0xff");
        assert_eq!(fmt("100%%", &[]).unwrap(), "100%");
    }

    #[test]
    fn width_and_star_width() {
        assert_eq!(fmt("%5d", &[Value::Int(42)]).unwrap(), "   42");
        assert_eq!(fmt("%*d", &[Value::Int(4), Value::Int(7)]).unwrap(), "   7");
    }

    #[test]
    fn sign_flags() {
        assert_eq!(fmt("%+d", &[Value::Int(5)]).unwrap(), "+5");
        assert_eq!(fmt("% d", &[Value::Int(5)]).unwrap(), " 5");
        assert_eq!(fmt("%+d", &[Value::Int(-5)]).unwrap(), "-5");
    }

    #[test]
    fn alternate_form_keeps_the_float_point() {
        assert_eq!(fmt("%.0f", &[Value::Float(3.0)]).unwrap(), "3");
        assert_eq!(fmt("%#.0f", &[Value::Float(3.0)]).unwrap(), "3.");
        // With a non-zero precision the point is already there.
        assert_eq!(fmt("%#.2f", &[Value::Float(3.0)]).unwrap(), "3.00");
    }

    #[test]
    fn type_mismatch_is_an_error_not_a_panic() {
        let err = fmt("%d", &[Value::Float(1.0)]).unwrap_err();
        assert!(err.error.message.contains("%d expects an int"));
    }

    #[test]
    fn missing_and_extra_arguments_error() {
        assert!(fmt("%d %d", &[Value::Int(1)]).is_err());
        assert!(fmt("%d", &[Value::Int(1), Value::Int(2)]).is_err());
    }

    #[test]
    fn unknown_verb_errors() {
        assert!(fmt("%z", &[]).is_err());
    }

    #[test]
    fn string_precision_truncates() {
        let heap = Heap::new(NoLimitTracker);
        let mut builder = crate::intern::InternerBuilder::new();
        let s = builder.intern("hello");
        let interns = builder.build();
        let out = run_template("%.3s", &[Value::InternString(s)], &heap, &interns).unwrap();
        assert_eq!(out, "hel");
    }
}
