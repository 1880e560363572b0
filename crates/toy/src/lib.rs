#![doc = include_str!("../../../README.md")]
#![allow(clippy::cast_possible_truncation, reason = "numeric narrowing is checked at call sites")]
#![allow(clippy::cast_sign_loss, reason = "sign-changing casts are intentional")]
#![allow(clippy::cast_possible_wrap, reason = "wrap behavior is part of the int semantics")]
#![allow(clippy::needless_pass_by_value, reason = "runtime call APIs pass values by ownership")]

mod ast;
mod builtins;
mod bytecode;
mod error;
mod format;
mod function;
mod hash;
mod heap;
mod intern;
mod io;
mod lexer;
mod modules;
mod object;
mod parser;
mod repl;
mod resource;
mod run;
mod source;
mod symbol;
mod token;
mod types;
mod value;

pub use crate::{
    error::{CompileError, CompileErrors, ErrorKind, ErrorValue, Exception, StackFrame},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    object::Object,
    repl::{ReplError, ReplProgress, ReplSession},
    resource::{
        DEFAULT_MAX_FRAMES, DEFAULT_MAX_STACK, InterruptHandle, LimitedTracker, NoLimitTracker, ResourceError,
        ResourceTracker,
    },
    run::{CompiledScript, Script},
    source::Position,
};
