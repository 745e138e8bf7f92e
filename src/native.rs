//! Native functions: the part of the standard library written in Rust.

use std::fmt::Write;
use std::time::Duration;

use chrono::{Local, Utc};

use crate::fault;
use crate::value::Value;
use crate::vm::{Fallible, VM};

/// The signature of every native function.
///
/// Natives called as methods receive the receiver as `args[0]`, followed by the call's arguments.
/// Returning [Value::Null] is the same as returning `None`.
pub type NativeFn = fn(&mut VM, &[Value]) -> Fallible<Value>;

/// How many arguments a native accepts, not counting a method's receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(u8),
    Variadic,
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => n as usize == count,
            Arity::Variadic => true,
        }
    }
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::Variadic => write!(f, "any number of"),
        }
    }
}

/// Defines every global native function.
pub(crate) fn install(vm: &mut VM) {
    vm.define_native("clock", Arity::Exact(0), clock);
    vm.define_native("time", Arity::Exact(0), time);
    vm.define_native("now", Arity::Exact(0), now);
    vm.define_native("sleep", Arity::Exact(1), sleep);
    vm.define_native("date", Arity::Exact(0), date);
    vm.define_native("type_of", Arity::Exact(1), type_of);
    vm.define_native("print", Arity::Variadic, print);
    vm.define_native("println", Arity::Variadic, println);
}

////////////////////////////////////////////// Time ///////////////////////////////////////////////

/// Seconds since the VM started.
fn clock(vm: &mut VM, _args: &[Value]) -> Fallible<Value> {
    Ok(Value::F64(vm.uptime().as_secs_f64()))
}

/// Seconds since the Unix epoch.
fn time(_vm: &mut VM, _args: &[Value]) -> Fallible<Value> {
    Ok(Value::F64(Utc::now().timestamp() as f64))
}

/// Milliseconds since the Unix epoch.
fn now(_vm: &mut VM, _args: &[Value]) -> Fallible<Value> {
    Ok(Value::I64(Utc::now().timestamp_millis()))
}

fn sleep(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    match args[0] {
        Value::I32(seconds) if seconds >= 0 => {
            std::thread::sleep(Duration::from_secs(seconds as u64));
            Ok(Value::None)
        }
        other => fault!(
            "sleep() expects a non-negative i32, found '{}'.",
            vm.heap.type_name(other)
        ),
    }
}

/// The local date and time, as `YYYY-MM-DD HH:MM:SS`.
fn date(vm: &mut VM, _args: &[Value]) -> Fallible<Value> {
    let formatted = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    Ok(vm.intern(&formatted).into())
}

////////////////////////////////////////////// Types //////////////////////////////////////////////

fn type_of(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    let name = vm.heap.type_name(args[0]);
    Ok(vm.type_marker(name).into())
}

///////////////////////////////////////////// Output //////////////////////////////////////////////

fn print(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    let text = format_arguments(vm, args)?;
    vm.write_output(&text)?;
    Ok(Value::None)
}

fn println(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    let mut text = format_arguments(vm, args)?;
    text.push('\n');
    vm.write_output(&text)?;
    Ok(Value::None)
}

/// With a string first, the arguments are a format string and its parameters. Otherwise they are
/// displayed one after the other, separated by spaces.
fn format_arguments(vm: &VM, args: &[Value]) -> Fallible<String> {
    let Some(&first) = args.first() else {
        return Ok(String::new());
    };

    match vm.heap.value_as_str(first) {
        Some(format) => interpolate(vm, format, &args[1..]),
        None => {
            let mut text = String::new();
            for (i, &arg) in args.iter().enumerate() {
                if i > 0 {
                    text.push(' ');
                }
                let _ = write!(text, "{}", vm.heap.display(arg));
            }
            Ok(text)
        }
    }
}

/// Expands `%d %f %s %b %%` and backslash escapes.
fn interpolate(vm: &VM, format: &str, args: &[Value]) -> Fallible<String> {
    let mut text = String::with_capacity(format.len());
    let mut args = args.iter().copied();
    let mut chars = format.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => text.push(unescape(escaped)),
                None => fault!("Incomplete escape sequence in format string."),
            },
            '%' => {
                let Some(specifier) = chars.next() else {
                    fault!("Incomplete format specifier in format string.");
                };
                if specifier == '%' {
                    text.push('%');
                    continue;
                }

                let Some(arg) = args.next() else {
                    fault!("Missing argument for '%{specifier}'.");
                };
                let accepted = match specifier {
                    'd' => arg.is_integer(),
                    'f' => matches!(arg, Value::F32(_) | Value::F64(_)),
                    'b' => arg.is_bool(),
                    's' => true,
                    _ => fault!("Unsupported format specifier '%{specifier}'."),
                };
                if !accepted {
                    fault!(
                        "Format specifier '%{specifier}' does not accept '{}'.",
                        vm.heap.type_name(arg)
                    );
                }
                let _ = write!(text, "{}", vm.heap.display(arg));
            }
            c => text.push(c),
        }
    }

    let unused = args.count();
    if unused > 0 {
        fault!("Too many arguments for format string ({unused} unused).");
    }
    Ok(text)
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        other => other,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn format(vm: &mut VM, format: &str, args: &[Value]) -> Fallible<String> {
        let format: Value = vm.intern(format).into();
        let mut all = vec![format];
        all.extend_from_slice(args);
        format_arguments(vm, &all)
    }

    #[test]
    fn plain_arguments_are_space_separated() {
        let vm = VM::default();
        let text = format_arguments(&vm, &[Value::I32(1), Value::F64(2.0), Value::None]);
        assert_eq!(Ok("1 2.0 None".to_owned()), text);
    }

    #[test]
    fn format_specifiers() {
        let mut vm = VM::default();
        assert_eq!(
            Ok("x=1 y=2.5 ok=true 100%\n".to_owned()),
            format(
                &mut vm,
                "x=%d y=%f ok=%b 100%%\\n",
                &[Value::I32(1), Value::F64(2.5), Value::Bool(true)]
            )
        );
    }

    #[test]
    fn format_mismatches_are_errors() {
        let mut vm = VM::default();
        assert!(format(&mut vm, "%d", &[Value::F64(1.0)]).is_err());
        assert!(format(&mut vm, "%d", &[]).is_err());
        assert!(format(&mut vm, "no holes", &[Value::I32(1)]).is_err());
        assert!(format(&mut vm, "%q", &[Value::I32(1)]).is_err());
    }

    #[test]
    fn arity() {
        assert!(Arity::Exact(2).accepts(2));
        assert!(!Arity::Exact(2).accepts(1));
        assert!(Arity::Variadic.accepts(0));
        assert_eq!("2", Arity::Exact(2).to_string());
    }
}
