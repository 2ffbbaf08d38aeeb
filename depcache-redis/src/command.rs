//! Typed command builder.
//!
//! Commands carry heterogeneous arguments; each [`Arg`] is converted to a
//! wire bulk string when the command is packed.

use std::borrow::Cow;
use std::fmt;

/// A single command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// UTF-8 text.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Integer literal, sent in decimal.
    Int(i64),
}

impl Arg {
    /// Wire representation of the argument.
    pub fn as_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Arg::Str(s) => Cow::Borrowed(s.as_bytes()),
            Arg::Bytes(b) => Cow::Borrowed(b.as_slice()),
            Arg::Int(i) => Cow::Owned(i.to_string().into_bytes()),
        }
    }

    /// Lossy text view, used for logging and by the in-memory store.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.as_bytes()).into_owned()
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Str(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Str(value)
    }
}

impl From<&String> for Arg {
    fn from(value: &String) -> Self {
        Arg::Str(value.clone())
    }
}

impl From<&[u8]> for Arg {
    fn from(value: &[u8]) -> Self {
        Arg::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Arg::Bytes(value)
    }
}

impl From<&Vec<u8>> for Arg {
    fn from(value: &Vec<u8>) -> Self {
        Arg::Bytes(value.clone())
    }
}

macro_rules! int_arg {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Arg {
            fn from(value: $ty) -> Self {
                Arg::Int(value as i64)
            }
        })*
    };
}

int_arg!(i8, i16, i32, i64, u8, u16, u32, isize);

impl From<u64> for Arg {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(v) => Arg::Int(v),
            Err(_) => Arg::Str(value.to_string()),
        }
    }
}

impl From<usize> for Arg {
    fn from(value: usize) -> Self {
        Arg::from(value as u64)
    }
}

/// A command name plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Arg>,
}

impl Command {
    /// Start a command.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append every argument of an iterator.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Command name as given.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments, excluding the name.
    pub fn arguments(&self) -> &[Arg] {
        &self.args
    }

    /// Convert to a `redis` command for the real transport.
    pub fn to_redis(&self) -> redis::Cmd {
        let mut cmd = redis::cmd(&self.name);
        for arg in &self.args {
            match arg {
                Arg::Str(s) => cmd.arg(s.as_str()),
                Arg::Bytes(b) => cmd.arg(b.as_slice()),
                Arg::Int(i) => cmd.arg(*i),
            };
        }
        cmd
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_text())?;
        }
        Ok(())
    }
}
