//! Domain types for the Steward agent platform
//!
//! Strongly-typed domain values to prevent primitive obsession and keep
//! validation at the boundaries.

use nutype::nutype;

/// Identifier of an agent within a registry (e.g. `mail-agent`)
#[nutype(
    validate(predicate = |id: &str| {
        !id.is_empty()
            && id.len() <= 64
            && id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct AgentId(String);

impl AgentId {
    /// Borrow the inner identifier
    pub fn as_str(&self) -> &str {
        self
    }
}

/// Capability verb of the form `domain.action` (e.g. `mail.search`)
#[nutype(
    validate(predicate = |verb: &str| {
        match verb.split_once('.') {
            Some((domain, action)) => {
                !domain.is_empty()
                    && !action.is_empty()
                    && domain.chars().all(|c| c.is_ascii_lowercase())
                    && action.chars().all(|c| c.is_ascii_lowercase() || c == '_')
            }
            None => false,
        }
    }),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct CapabilityVerb(String);

impl CapabilityVerb {
    /// Borrow the inner verb
    pub fn as_str(&self) -> &str {
        self
    }

    /// The `domain` part of `domain.action`
    pub fn domain(&self) -> &str {
        self.as_str().split_once('.').map(|(d, _)| d).unwrap_or("")
    }
}

/// Interpreter self-reported trust in its plan, in `[0, 1]`
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0.0
)]
pub struct Confidence(f64);

impl Confidence {
    /// Zero confidence (interpreter failure sentinel)
    pub fn zero() -> Self {
        Self::default()
    }

    /// Full confidence (fresh L1 hit)
    ///
    /// # Panics
    /// Never panics: 1.0 is within the validated range.
    pub fn full() -> Self {
        Self::try_new(1.0).expect("1.0 is a valid confidence")
    }

    /// The raw value
    pub fn value(self) -> f64 {
        self.into_inner()
    }

    /// Clamp this confidence to at most `ceiling`
    ///
    /// Used when the interpreter names a capability outside the agent's
    /// advertised set: the verdict survives, clamped low.
    pub fn clamped_to(self, ceiling: f64) -> Self {
        let v = self.into_inner().min(ceiling).max(0.0);
        Self::try_new(v).unwrap_or_else(|_| Self::zero())
    }
}

/// Natural-language query text (non-empty after trimming)
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 4096),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct QueryText(String);

impl QueryText {
    /// Borrow the inner text
    pub fn as_str(&self) -> &str {
        self
    }
}

/// Cache time-to-live in seconds
#[nutype(
    validate(greater = 0, less_or_equal = 604_800),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct TtlSeconds(u64);

impl TtlSeconds {
    /// The TTL as a `Duration`
    pub fn as_duration(self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }

    /// The raw seconds value
    pub fn as_u64(self) -> u64 {
        self.into_inner()
    }
}

/// Deadline for an external call, in milliseconds
#[nutype(
    validate(greater = 0, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct TimeoutMs(u64);

impl TimeoutMs {
    /// The timeout as a `Duration`
    pub fn as_duration(self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }

    /// The raw milliseconds value
    pub fn as_u64(self) -> u64 {
        self.into_inner()
    }
}

/// Bounded capacity of the in-process cache tier
#[nutype(
    validate(greater = 0, less_or_equal = 100_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct L1Capacity(usize);

impl L1Capacity {
    /// The capacity as `usize`
    pub fn as_usize(self) -> usize {
        self.into_inner()
    }
}

/// Bounded length of the performance sample ring
#[nutype(
    validate(greater = 0, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct RingCapacity(usize);

impl RingCapacity {
    /// The capacity as `usize`
    pub fn as_usize(self) -> usize {
        self.into_inner()
    }
}

/// Maximum concurrent dependency calls per agent
#[nutype(
    validate(greater = 0, less_or_equal = 1024),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct MaxInFlightCalls(usize);

impl MaxInFlightCalls {
    /// The bound as `usize`
    pub fn as_usize(self) -> usize {
        self.into_inner()
    }
}
