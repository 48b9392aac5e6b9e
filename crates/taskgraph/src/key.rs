use std::borrow::Cow;
use std::fmt;

use serde::Serialize;

use crate::error::TaskError;

/// Deduplication identity of a unit of work.
///
/// Built from the originating function and its fully-bound arguments,
/// serialized canonically to JSON. Two invocations of the same function
/// with equal arguments produce equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    origin: Cow<'static, str>,
    args: String,
}

impl CacheKey {
    /// Build a key, failing if the arguments have no canonical form
    /// (e.g. maps keyed by non-strings).
    pub fn new<A>(origin: impl Into<Cow<'static, str>>, args: &A) -> Result<Self, TaskError>
    where
        A: Serialize + ?Sized,
    {
        let origin = origin.into();
        let value = serde_json::to_value(args).map_err(|e| TaskError::UnhashableArguments {
            origin: origin.to_string(),
            reason: e.to_string(),
        })?;
        // `serde_json::Map` is ordered, so rendering is canonical.
        Ok(Self {
            origin,
            args: value.to_string(),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn args(&self) -> &str {
        &self.args
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.origin, self.args)
    }
}
