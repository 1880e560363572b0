//! Runtime types: the type tag enum and the heap-resident containers.

pub(crate) mod array;
pub(crate) mod bytes;
pub(crate) mod iter;
pub(crate) mod range;
pub(crate) mod str;
pub(crate) mod table;
pub(crate) mod tuple;

pub(crate) use array::Array;
pub(crate) use bytes::Bytes;
pub(crate) use iter::ToyIter;
pub(crate) use range::Range;
pub(crate) use str::Str;
pub(crate) use table::Table;
pub(crate) use tuple::Tuple;

use strum::{Display, EnumString, IntoStaticStr};

/// The closed set of runtime type tags.
///
/// Every value reports exactly one of these; the names appear in error
/// messages and are what `type(x)` returns. The conversion tags (`int`,
/// `float`, `bool`, `char`, `string`, `bytes`, `tuple`) double as callable
/// constructor values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Type {
    Nil,
    Bool,
    Int,
    Float,
    Char,
    String,
    Bytes,
    Array,
    Table,
    Tuple,
    Range,
    Function,
    #[strum(serialize = "builtin-function")]
    BuiltinFunction,
    #[strum(serialize = "bound-method")]
    BoundMethod,
    Error,
    Iterator,
    Module,
    /// The type of type values themselves.
    Type,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_are_lowercase() {
        assert_eq!(Type::Array.to_string(), "array");
        assert_eq!(Type::BuiltinFunction.to_string(), "builtin-function");
        assert_eq!(Type::BoundMethod.to_string(), "bound-method");
    }
}
