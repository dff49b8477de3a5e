//! Nack error codes and message formatting.

use std::fmt;

use crate::value::Value;

/// Error codes carried in a Nack.
///
/// Codes in the 1000 range are protocol errors, 2000 are implementation
/// limits and 2100 are subscription expression errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NackCode {
    /// Incompatible protocol version.
    ProtocolIncompatible,
    /// Generic protocol error.
    ProtocolError,
    /// Subscription id not known to the router.
    NoSuchSubscription,
    /// Quench id not known to the router.
    NoSuchQuench,
    /// Unsupported key scheme.
    BadKeyScheme,
    /// Key set index outside the scheme's range.
    BadKeysetIndex,
    /// String was not valid UTF-8.
    BadUtf8,
    /// A router resource limit was exceeded.
    ImplementationLimit,
    /// The request is not implemented by the router.
    NotImplemented,
    /// Subscription expression failed to parse.
    ParseError,
    /// Subscription expression is constant.
    ExpressionIsTrivial,
    /// Any code this library does not name.
    Other(i32),
}

impl NackCode {
    /// Numeric wire code.
    pub fn code(self) -> i32 {
        match self {
            Self::ProtocolIncompatible => 1,
            Self::ProtocolError => 1001,
            Self::NoSuchSubscription => 1002,
            Self::NoSuchQuench => 1003,
            Self::BadKeyScheme => 1004,
            Self::BadKeysetIndex => 1005,
            Self::BadUtf8 => 1006,
            Self::ImplementationLimit => 2006,
            Self::NotImplemented => 2007,
            Self::ParseError => 2101,
            Self::ExpressionIsTrivial => 2110,
            Self::Other(code) => code,
        }
    }

    /// Map a wire code back to a named variant.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::ProtocolIncompatible,
            1001 => Self::ProtocolError,
            1002 => Self::NoSuchSubscription,
            1003 => Self::NoSuchQuench,
            1004 => Self::BadKeyScheme,
            1005 => Self::BadKeysetIndex,
            1006 => Self::BadUtf8,
            2006 => Self::ImplementationLimit,
            2007 => Self::NotImplemented,
            2101 => Self::ParseError,
            2110 => Self::ExpressionIsTrivial,
            other => Self::Other(other),
        }
    }

    /// Default message template. `%1`, `%2`, ... refer to Nack arguments.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::ProtocolIncompatible => "Incompatible protocol version",
            Self::ProtocolError => "Protocol error: %1",
            Self::NoSuchSubscription => "Unknown subscription ID %1",
            Self::NoSuchQuench => "Unknown quench ID %1",
            Self::BadKeyScheme => "Unsupported key scheme %1",
            Self::BadKeysetIndex => "Key set index %2 out of range for scheme %1",
            Self::BadUtf8 => "Invalid UTF-8 string",
            Self::ImplementationLimit => "Router limit exceeded: %1",
            Self::NotImplemented => "Not implemented",
            Self::ParseError => "Parse error at %1",
            Self::ExpressionIsTrivial => "Expression is trivial",
            Self::Other(_) => "Error %1",
        }
    }
}

impl fmt::Display for NackCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Substitute `%N` placeholders in a Nack message with its arguments.
///
/// Placeholders are 1-based. A placeholder with no matching argument is left
/// as written; `%%` is a literal percent sign.
pub fn expand_message(template: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
            digits.push(d);
            chars.next();
        }
        let arg = digits.parse::<usize>().ok().and_then(|n| n.checked_sub(1)).and_then(|i| args.get(i));
        match arg {
            Some(Value::String(text)) => out.push_str(text),
            Some(value) => out.push_str(&value.to_string()),
            None => {
                out.push('%');
                out.push_str(&digits);
            },
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in [1, 1001, 1002, 1003, 1004, 1005, 1006, 2006, 2007, 2101, 2110, 4242] {
            assert_eq!(NackCode::from_code(code).code(), code);
        }
        assert_eq!(NackCode::from_code(1002), NackCode::NoSuchSubscription);
    }

    #[test]
    fn placeholders_are_substituted() {
        let args = [Value::Int64(0x1234), Value::from("name")];
        assert_eq!(expand_message("id %1 named %2", &args), "id 4660L named name");
        assert_eq!(expand_message("100%% of %3", &args), "100% of %3");
        assert_eq!(expand_message("trailing %", &args), "trailing %");
    }
}
