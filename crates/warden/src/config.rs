// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use jiff::SignedDuration;
use jiff::fmt::friendly::{SpanParser, SpanPrinter};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, IdempotencyOptions, LockOptions, Result};

static PARSER: SpanParser = SpanParser::new();
static PRINTER: SpanPrinter = SpanPrinter::new();

const DEFAULT_CONNECTION_STRING: &str = "redis://127.0.0.1:6379";
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// A non-negative duration written for humans.
///
/// Parses the friendly format (`"1 minute"`, `"30 seconds"`, `"100ms"`, `"1h 30m"`). A bare
/// integer is read as milliseconds. Formats back to the compact friendly form.
///
/// # Serialization
///
/// Serializes as a string in the friendly format. Deserializes from such a string or from an
/// integer number of milliseconds.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use warden::HumanDuration;
///
/// let ttl: HumanDuration = "1 minute".parse()?;
/// assert_eq!(Duration::from(ttl), Duration::from_secs(60));
///
/// let delay: HumanDuration = "250".parse()?;
/// assert_eq!(Duration::from(delay), Duration::from_millis(250));
/// assert_eq!(delay.to_string(), "250ms");
/// # Ok::<(), warden::Error>(())
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HumanDuration(Duration);

impl HumanDuration {
    /// Wraps a duration.
    #[must_use]
    pub const fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// The wrapped duration.
    #[must_use]
    pub const fn get(self) -> Duration {
        self.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl From<HumanDuration> for Duration {
    fn from(value: HumanDuration) -> Self {
        value.0
    }
}

impl FromStr for HumanDuration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let input = s.trim();
        let invalid = |reason: String| Error::InvalidDuration {
            input: s.to_string(),
            reason,
        };

        if !input.is_empty() && input.bytes().all(|b| b.is_ascii_digit()) {
            let millis: u64 = input.parse().map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?;
            return Ok(Self(Duration::from_millis(millis)));
        }

        let signed = PARSER.parse_duration(input).map_err(|e| invalid(e.to_string()))?;
        if signed.is_negative() {
            return Err(invalid("negative durations are not allowed".to_string()));
        }

        Ok(Self(signed.unsigned_abs()))
    }
}

#[expect(
    clippy::map_err_ignore,
    reason = "std::fmt::Error does not contain any data, so we ignore the inner error"
)]
impl Display for HumanDuration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let signed = SignedDuration::try_from(self.0).map_err(|_| fmt::Error)?;
        PRINTER.print_duration(&signed, jiff::fmt::StdFmtWrite(f)).map_err(|_| fmt::Error)
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct HumanDurationVisitor;

        impl Visitor<'_> for HumanDurationVisitor {
            type Value = HumanDuration;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("a duration such as \"1 minute\" or a number of milliseconds")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Self::Value, E> {
                value.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<Self::Value, E> {
                Ok(HumanDuration(Duration::from_millis(value)))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<Self::Value, E> {
                u64::try_from(value)
                    .map(|millis| HumanDuration(Duration::from_millis(millis)))
                    .map_err(|_| E::custom("negative durations are not allowed"))
            }
        }

        deserializer.deserialize_any(HumanDurationVisitor)
    }
}

/// `#[serde(with = "...")]` adapter storing a [`Duration`] as a [`HumanDuration`].
pub(crate) mod human_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::HumanDuration;

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        HumanDuration(*value).serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        HumanDuration::deserialize(deserializer).map(HumanDuration::get)
    }
}

/// Options for a [`Warden`](crate::Warden).
///
/// Every field has a default, so partial documents deserialize:
///
/// ```
/// use std::time::Duration;
/// use warden::WardenOptions;
///
/// let options: WardenOptions = serde_json::from_str(r#"{
///     "prefix": "tickets",
///     "defaultTtl": "10 minutes",
///     "lock": { "ttl": "5 seconds", "retry": { "count": 10 } }
/// }"#)?;
///
/// assert_eq!(options.default_ttl, Duration::from_secs(600));
/// assert_eq!(options.lock.retry.count, 10);
/// assert_eq!(options.lock.retry.delay, Duration::from_millis(100));
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct WardenOptions {
    /// Store connection string, for example `redis://127.0.0.1:6379`.
    pub connection_string: String,
    /// Prefix applied to every key; `None` or empty for no prefix.
    pub prefix: Option<String>,
    /// TTL of cache entries written without an explicit TTL.
    #[serde(with = "human_duration")]
    pub default_ttl: Duration,
    /// Lock defaults.
    pub lock: LockOptions,
    /// Idempotency defaults.
    pub idempotency: IdempotencyOptions,
}

impl Default for WardenOptions {
    fn default() -> Self {
        Self {
            connection_string: DEFAULT_CONNECTION_STRING.to_string(),
            prefix: None,
            default_ttl: DEFAULT_TTL,
            lock: LockOptions::default(),
            idempotency: IdempotencyOptions::default(),
        }
    }
}

impl WardenOptions {
    /// Sets the connection string.
    #[must_use]
    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = connection_string.into();
        self
    }

    /// Sets the key prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Sets the default cache entry TTL.
    #[must_use]
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the lock defaults.
    #[must_use]
    pub fn lock(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the idempotency defaults.
    #[must_use]
    pub fn idempotency(mut self, idempotency: IdempotencyOptions) -> Self {
        self.idempotency = idempotency;
        self
    }

    /// Reads options from the process environment, starting from the defaults.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `WARDEN_CONNECTION_STRING` | `connection_string` |
    /// | `WARDEN_PREFIX` | `prefix` |
    /// | `WARDEN_DEFAULT_TTL` | `default_ttl` |
    /// | `WARDEN_LOCK_TTL` | `lock.ttl` |
    /// | `WARDEN_LOCK_RETRY_COUNT` | `lock.retry.count` |
    /// | `WARDEN_LOCK_RETRY_DELAY` | `lock.retry.delay` |
    /// | `WARDEN_LOCK_RETRY_JITTER` | `lock.retry.jitter` |
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDuration`] or [`Error::Config`] when a variable is set to a
    /// value that does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads options through `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::default();

        if let Some(value) = lookup("WARDEN_CONNECTION_STRING") {
            options.connection_string = value;
        }
        if let Some(value) = lookup("WARDEN_PREFIX") {
            options.prefix = Some(value).filter(|prefix| !prefix.is_empty());
        }
        if let Some(value) = lookup("WARDEN_DEFAULT_TTL") {
            options.default_ttl = value.parse::<HumanDuration>()?.get();
        }
        if let Some(value) = lookup("WARDEN_LOCK_TTL") {
            options.lock.ttl = value.parse::<HumanDuration>()?.get();
        }
        if let Some(value) = lookup("WARDEN_LOCK_RETRY_COUNT") {
            options.lock.retry.count = value
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("WARDEN_LOCK_RETRY_COUNT '{value}': {e}")))?;
        }
        if let Some(value) = lookup("WARDEN_LOCK_RETRY_DELAY") {
            options.lock.retry.delay = value.parse::<HumanDuration>()?.get();
        }
        if let Some(value) = lookup("WARDEN_LOCK_RETRY_JITTER") {
            options.lock.retry.jitter = value.parse::<HumanDuration>()?.get();
        }

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn parse(input: &str) -> Duration {
        input.parse::<HumanDuration>().unwrap().get()
    }

    #[test]
    fn parses_friendly_durations() {
        assert_eq!(parse("1 minute"), Duration::from_secs(60));
        assert_eq!(parse("30 seconds"), Duration::from_secs(30));
        assert_eq!(parse("100ms"), Duration::from_millis(100));
        assert_eq!(parse("1h 30m"), Duration::from_secs(5400));
        assert_eq!(parse("2 hours"), Duration::from_secs(7200));
    }

    #[test]
    fn bare_integer_is_milliseconds() {
        assert_eq!(parse("1500"), Duration::from_millis(1500));
        assert_eq!(parse(" 0 "), Duration::ZERO);
    }

    #[test]
    fn rejects_garbage_and_negative_input() {
        assert!(matches!("soon".parse::<HumanDuration>(), Err(Error::InvalidDuration { .. })));
        assert!(matches!("".parse::<HumanDuration>(), Err(Error::InvalidDuration { .. })));
        assert!(matches!("-5s".parse::<HumanDuration>(), Err(Error::InvalidDuration { .. })));
    }

    #[test]
    fn display_parses_back() {
        for duration in [Duration::from_millis(100), Duration::from_secs(90), Duration::from_secs(3600), Duration::ZERO] {
            let text = HumanDuration::from(duration).to_string();
            assert_eq!(parse(&text), duration, "'{text}' did not round-trip");
        }
    }

    #[test]
    fn deserializes_strings_and_integers() {
        let from_string: HumanDuration = serde_json::from_str("\"5 seconds\"").unwrap();
        let from_integer: HumanDuration = serde_json::from_str("250").unwrap();

        assert_eq!(from_string.get(), Duration::from_secs(5));
        assert_eq!(from_integer.get(), Duration::from_millis(250));
        assert!(serde_json::from_str::<HumanDuration>("-1").is_err());
    }

    #[test]
    fn defaults() {
        let options = WardenOptions::default();

        assert_eq!(options.connection_string, "redis://127.0.0.1:6379");
        assert_eq!(options.prefix, None);
        assert_eq!(options.default_ttl, Duration::from_secs(3600));
        assert_eq!(options.lock.ttl, Duration::from_secs(30));
        assert_eq!(options.lock.retry.count, 3);
        assert_eq!(options.lock.retry.delay, Duration::from_millis(100));
        assert_eq!(options.lock.retry.jitter, Duration::from_millis(50));
        assert_eq!(options.idempotency.result_ttl, Duration::from_secs(60));
        assert_eq!(options.idempotency.lock_ttl, Duration::from_secs(5));
    }

    #[test]
    fn serializes_durations_as_text() {
        let json = serde_json::to_value(WardenOptions::default()).unwrap();

        assert_eq!(json["defaultTtl"], "1h");
        assert_eq!(json["lock"]["retry"]["delay"], "100ms");
    }

    #[test]
    fn reads_environment_through_lookup() {
        let env = HashMap::from([
            ("WARDEN_CONNECTION_STRING", "redis://cache:6380"),
            ("WARDEN_PREFIX", "svc"),
            ("WARDEN_DEFAULT_TTL", "10 minutes"),
            ("WARDEN_LOCK_TTL", "10s"),
            ("WARDEN_LOCK_RETRY_COUNT", "7"),
            ("WARDEN_LOCK_RETRY_DELAY", "250"),
            ("WARDEN_LOCK_RETRY_JITTER", "0ms"),
        ]);

        let options = WardenOptions::from_lookup(|name| env.get(name).map(ToString::to_string)).unwrap();

        assert_eq!(options.connection_string, "redis://cache:6380");
        assert_eq!(options.prefix.as_deref(), Some("svc"));
        assert_eq!(options.default_ttl, Duration::from_secs(600));
        assert_eq!(options.lock.ttl, Duration::from_secs(10));
        assert_eq!(options.lock.retry.count, 7);
        assert_eq!(options.lock.retry.delay, Duration::from_millis(250));
        assert_eq!(options.lock.retry.jitter, Duration::ZERO);
    }

    #[test]
    fn invalid_retry_count_is_a_config_error() {
        let result = WardenOptions::from_lookup(|name| (name == "WARDEN_LOCK_RETRY_COUNT").then(|| "many".to_string()));

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn empty_prefix_variable_means_no_prefix() {
        let options = WardenOptions::from_lookup(|name| (name == "WARDEN_PREFIX").then(String::new)).unwrap();

        assert_eq!(options.prefix, None);
    }
}
