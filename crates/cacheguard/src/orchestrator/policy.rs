//! Caching policies attached to a unit of work.

use std::time::Duration;

use cacheguard_core::KeyExpr;

use crate::tier::TierKind;

/// Lifetime of an entry written by a policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Ttl {
    /// Store without expiry.
    Never,
    /// Use `cache.default_ttl_secs`.
    #[default]
    Default,
    After(Duration),
}

impl Ttl {
    /// Signed seconds: negative never expires, zero uses the default.
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            s if s < 0 => Ttl::Never,
            0 => Ttl::Default,
            s => Ttl::After(Duration::from_secs(s.unsigned_abs())),
        }
    }
}

/// Return the cached value when present, otherwise compute and store it.
#[derive(Debug, Clone)]
pub struct ReadThrough {
    pub namespace: String,
    pub key: KeyExpr,
    pub ttl: Ttl,
    pub refresh_on_read: bool,
    pub tier: Option<TierKind>,
}

impl ReadThrough {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: KeyExpr::default(),
            ttl: Ttl::Default,
            refresh_on_read: false,
            tier: None,
        }
    }

    pub fn key(mut self, key: impl Into<KeyExpr>) -> Self {
        self.key = key.into();
        self
    }

    pub fn ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl_secs(self, secs: i64) -> Self {
        self.ttl(Ttl::from_secs(secs))
    }

    pub fn refresh_on_read(mut self) -> Self {
        self.refresh_on_read = true;
        self
    }

    pub fn tier(mut self, tier: TierKind) -> Self {
        self.tier = Some(tier);
        self
    }
}

/// Always compute, then overwrite the cached entry with the result.
#[derive(Debug, Clone)]
pub struct WriteThrough {
    pub namespace: String,
    pub key: KeyExpr,
    pub ttl: Ttl,
    pub refresh_on_read: bool,
    pub tier: Option<TierKind>,
}

impl WriteThrough {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: KeyExpr::default(),
            ttl: Ttl::Default,
            refresh_on_read: false,
            tier: None,
        }
    }

    pub fn key(mut self, key: impl Into<KeyExpr>) -> Self {
        self.key = key.into();
        self
    }

    pub fn ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn refresh_on_read(mut self) -> Self {
        self.refresh_on_read = true;
        self
    }

    pub fn tier(mut self, tier: TierKind) -> Self {
        self.tier = Some(tier);
        self
    }
}

/// Compute, then delete one entry.
#[derive(Debug, Clone)]
pub struct InvalidateOne {
    pub namespace: String,
    pub key: KeyExpr,
    pub tier: Option<TierKind>,
}

impl InvalidateOne {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: KeyExpr::default(),
            tier: None,
        }
    }

    pub fn key(mut self, key: impl Into<KeyExpr>) -> Self {
        self.key = key.into();
        self
    }

    pub fn tier(mut self, tier: TierKind) -> Self {
        self.tier = Some(tier);
        self
    }
}

/// Entries removed by [`InvalidateMany`].
#[derive(Debug, Clone)]
pub enum Selection {
    Keys(Vec<KeyExpr>),
    /// Every entry of the namespace.
    AllEntries,
}

/// Compute, then delete several entries or a whole namespace.
#[derive(Debug, Clone)]
pub struct InvalidateMany {
    pub namespace: String,
    pub selection: Selection,
    pub tier: Option<TierKind>,
}

impl InvalidateMany {
    pub fn keys(namespace: impl Into<String>, keys: Vec<KeyExpr>) -> Self {
        Self {
            namespace: namespace.into(),
            selection: Selection::Keys(keys),
            tier: None,
        }
    }

    pub fn all_entries(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            selection: Selection::AllEntries,
            tier: None,
        }
    }

    pub fn tier(mut self, tier: TierKind) -> Self {
        self.tier = Some(tier);
        self
    }
}

/// Any policy, for [`CacheOrchestrator::invoke`](super::CacheOrchestrator::invoke).
#[derive(Debug, Clone)]
pub enum CachePolicy {
    ReadThrough(ReadThrough),
    WriteThrough(WriteThrough),
    InvalidateOne(InvalidateOne),
    InvalidateMany(InvalidateMany),
}

impl From<ReadThrough> for CachePolicy {
    fn from(policy: ReadThrough) -> Self {
        CachePolicy::ReadThrough(policy)
    }
}

impl From<WriteThrough> for CachePolicy {
    fn from(policy: WriteThrough) -> Self {
        CachePolicy::WriteThrough(policy)
    }
}

impl From<InvalidateOne> for CachePolicy {
    fn from(policy: InvalidateOne) -> Self {
        CachePolicy::InvalidateOne(policy)
    }
}

impl From<InvalidateMany> for CachePolicy {
    fn from(policy: InvalidateMany) -> Self {
        CachePolicy::InvalidateMany(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_from_signed_secs() {
        assert_eq!(Ttl::from_secs(-1), Ttl::Never);
        assert_eq!(Ttl::from_secs(0), Ttl::Default);
        assert_eq!(Ttl::from_secs(90), Ttl::After(Duration::from_secs(90)));
    }

    #[test]
    fn test_builders() {
        let policy = ReadThrough::new("user")
            .key(KeyExpr::Arg(0))
            .ttl_secs(60)
            .tier(TierKind::Remote);
        assert_eq!(policy.ttl, Ttl::After(Duration::from_secs(60)));
        assert_eq!(policy.tier, Some(TierKind::Remote));
        assert!(!policy.refresh_on_read);

        let many = InvalidateMany::all_entries("user");
        assert!(matches!(
            CachePolicy::from(many),
            CachePolicy::InvalidateMany(InvalidateMany {
                selection: Selection::AllEntries,
                ..
            })
        ));
    }
}
