//! Cache key construction.
//!
//! ## Key Format
//!
//! `{prefix}:{namespace}:{dynamic}`, e.g. `app:user:42`
//!
//! The dynamic part comes from a [`KeyExpr`] resolved against the
//! [`InvocationContext`] of the call being cached. Resolution is a plain
//! function of the context; no expression language is involved.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Separator between key segments.
pub const KEY_SEPARATOR: &str = ":";

/// The call a cache policy is applied to: its name and its arguments.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    pub target: String,
    pub args: Vec<Value>,
}

impl InvocationContext {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Argument rendered as a key fragment: strings verbatim, anything else as JSON.
    pub fn arg_fragment(&self, index: usize) -> Option<String> {
        self.args.get(index).map(value_fragment)
    }
}

fn value_fragment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Caller-supplied key resolver.
pub type KeyResolver = Arc<dyn Fn(&InvocationContext) -> String + Send + Sync>;

/// How the dynamic part of a key is derived from a call.
#[derive(Clone, Default)]
pub enum KeyExpr {
    /// `target` followed by every argument.
    #[default]
    Signature,
    /// A fixed fragment.
    Static(String),
    /// The n-th argument.
    Arg(usize),
    /// Arbitrary function of the context.
    Resolver(KeyResolver),
}

impl KeyExpr {
    pub fn fixed(fragment: impl Into<String>) -> Self {
        Self::Static(fragment.into())
    }

    pub fn resolver<F>(f: F) -> Self
    where
        F: Fn(&InvocationContext) -> String + Send + Sync + 'static,
    {
        Self::Resolver(Arc::new(f))
    }

    /// Resolve against a call. A missing argument resolves to an empty fragment.
    pub fn resolve(&self, ctx: &InvocationContext) -> String {
        match self {
            KeyExpr::Signature => {
                let mut parts = Vec::with_capacity(ctx.args.len() + 1);
                parts.push(ctx.target.clone());
                parts.extend(ctx.args.iter().map(value_fragment));
                parts.join(KEY_SEPARATOR)
            }
            KeyExpr::Static(fragment) => fragment.clone(),
            KeyExpr::Arg(index) => ctx.arg_fragment(*index).unwrap_or_default(),
            KeyExpr::Resolver(f) => f(ctx),
        }
    }
}

impl fmt::Debug for KeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyExpr::Signature => write!(f, "Signature"),
            KeyExpr::Static(s) => f.debug_tuple("Static").field(s).finish(),
            KeyExpr::Arg(i) => f.debug_tuple("Arg").field(i).finish(),
            KeyExpr::Resolver(_) => write!(f, "Resolver(..)"),
        }
    }
}

impl From<&str> for KeyExpr {
    fn from(s: &str) -> Self {
        KeyExpr::Static(s.to_string())
    }
}

impl From<String> for KeyExpr {
    fn from(s: String) -> Self {
        KeyExpr::Static(s)
    }
}

/// A fully resolved cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    full: String,
}

impl CacheKey {
    /// `{prefix}:{namespace}`, shared by every key of the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Full key as stored.
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// Builds keys under a global prefix.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    prefix: String,
}

impl KeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}:{namespace}`, or just the namespace when the prefix is empty.
    pub fn namespace_key(&self, namespace: &str) -> String {
        if self.prefix.is_empty() {
            namespace.to_string()
        } else {
            format!("{}{KEY_SEPARATOR}{namespace}", self.prefix)
        }
    }

    /// Glob matching every key of a namespace.
    pub fn namespace_pattern(&self, namespace: &str) -> String {
        format!("{}{KEY_SEPARATOR}*", self.namespace_key(namespace))
    }

    /// Key for an already-resolved dynamic fragment.
    pub fn key(&self, namespace: &str, dynamic: &str) -> CacheKey {
        let namespace = self.namespace_key(namespace);
        let full = format!("{namespace}{KEY_SEPARATOR}{dynamic}");
        CacheKey { namespace, full }
    }

    /// Resolve `expr` against `ctx` and build the key.
    pub fn resolve(&self, namespace: &str, expr: &KeyExpr, ctx: &InvocationContext) -> CacheKey {
        self.key(namespace, &expr.resolve(ctx))
    }

    /// Channel used for cross-instance invalidation messages.
    pub fn invalidation_channel(&self) -> String {
        self.namespace_key("invalidate")
    }
}
