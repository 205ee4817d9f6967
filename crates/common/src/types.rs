//! Core identifier and wire types shared across the pipeline.

use std::{
    fmt,
    str::FromStr,
};

use anyhow::Context as _;
use rand::RngCore;
use serde::{
    Deserialize,
    Serialize,
};

/// Identifies one simulation invocation. Opaque to the pipeline apart from
/// being usable as a storage prefix and a schema-name seed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The storage prefix under which this run's batch files live.
    pub fn storage_prefix(&self) -> String {
        format!("{}/", self.0)
    }

    /// Fixed-format transformation from run id to coordinator schema name:
    /// `run_` followed by the lowercased id with every character outside
    /// `[a-z0-9]` replaced by `_`.
    pub fn schema_name(&self) -> String {
        let mut name = String::with_capacity(self.0.len() + 4);
        name.push_str("run_");
        for c in self.0.chars() {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                name.push(c);
            } else {
                name.push('_');
            }
        }
        name
    }
}

impl FromStr for RunId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(!s.is_empty(), "run id must be non-empty");
        anyhow::ensure!(
            !s.contains('/') && !s.contains(char::is_whitespace),
            "run id {s:?} may not contain '/' or whitespace"
        );
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for RunId {
    type Error = anyhow::Error;

    fn try_from(s: String) -> anyhow::Result<Self> {
        s.parse()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The logical kind of downstream processing (e.g. `environment`,
/// `organism`). Two different classes process the same batch files
/// independently; instances of the same class compete for them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub struct IndexerClass(String);

impl IndexerClass {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for IndexerClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
            "indexer class {s:?} must be non-empty [A-Za-z0-9_]"
        );
        Ok(Self(s.to_owned()))
    }
}

/// Identifies one indexer instance within a class, for claim attribution.
#[derive(Clone, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub struct IndexerInstanceId(String);

impl IndexerInstanceId {
    pub fn generate(class: &IndexerClass, rng: &mut dyn RngCore) -> Self {
        let mut suffix = [0u8; 4];
        rng.fill_bytes(&mut suffix);
        Self(format!(
            "{}-{:02x}{:02x}{:02x}{:02x}",
            class, suffix[0], suffix[1], suffix[2], suffix[3]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for IndexerInstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An inclusive range of tick numbers. Endpoints are multiples of the run's
/// sampling interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TickRange {
    pub start: i64,
    pub end: i64,
}

impl TickRange {
    pub fn new(start: i64, end: i64) -> anyhow::Result<Self> {
        anyhow::ensure!(
            0 <= start && start <= end,
            "invalid tick range [{start}, {end}]"
        );
        Ok(Self { start, end })
    }

    pub fn intersects(&self, other: &TickRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, other: &TickRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for TickRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

const BATCH_PREFIX: &str = "batch_";
const BATCH_SUFFIX: &str = ".pb";
const TICK_DIGITS: usize = 19;

/// The name of one immutable batch file: `batch_<start>_<end>.pb` with both
/// tick numbers zero-padded to 19 digits, so that lexicographic order over
/// names equals chronological order over tick ranges.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BatchFileName {
    name: String,
    range: TickRange,
}

impl BatchFileName {
    pub fn from_range(range: TickRange) -> Self {
        Self {
            name: format!(
                "{BATCH_PREFIX}{:019}_{:019}{BATCH_SUFFIX}",
                range.start, range.end
            ),
            range,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn range(&self) -> TickRange {
        self.range
    }

    pub fn tick_start(&self) -> i64 {
        self.range.start
    }

    pub fn tick_end(&self) -> i64 {
        self.range.end
    }
}

impl FromStr for BatchFileName {
    type Err = anyhow::Error;

    fn from_str(name: &str) -> anyhow::Result<Self> {
        let grammar =
            || format!("{name:?} does not match {BATCH_PREFIX}<start>_<end>{BATCH_SUFFIX}");
        let inner = name
            .strip_prefix(BATCH_PREFIX)
            .and_then(|s| s.strip_suffix(BATCH_SUFFIX))
            .with_context(grammar)?;
        anyhow::ensure!(inner.len() == 2 * TICK_DIGITS + 1, grammar());
        let (start_digits, rest) = inner.split_at(TICK_DIGITS);
        let end_digits = rest.strip_prefix('_').with_context(grammar)?;
        let parse = |digits: &str| -> anyhow::Result<i64> {
            anyhow::ensure!(digits.bytes().all(|b| b.is_ascii_digit()), grammar());
            Ok(digits.parse()?)
        };
        let range = TickRange::new(parse(start_digits)?, parse(end_digits)?)?;
        Ok(Self {
            name: name.to_owned(),
            range,
        })
    }
}

impl PartialOrd for BatchFileName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BatchFileName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

impl fmt::Display for BatchFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)
    }
}

/// One sampled simulation state record as stored inside a batch file. Batch
/// files hold a length-delimited sequence of these.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TickRecord {
    #[prost(int64, tag = "1")]
    pub tick_number: i64,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_batch_file_name_round_trip() -> anyhow::Result<()> {
        let name = BatchFileName::from_range(TickRange::new(0, 990)?);
        assert_eq!(name.as_str(), "batch_0000000000000000000_0000000000000000990.pb");
        let parsed: BatchFileName = name.as_str().parse()?;
        assert_eq!(parsed, name);
        assert_eq!(parsed.tick_start(), 0);
        assert_eq!(parsed.tick_end(), 990);
        Ok(())
    }

    #[test]
    fn test_batch_file_name_rejects_garbage() {
        for bad in [
            "",
            "batch_.pb",
            "batch_0000000000000000000_0000000000000000990",
            "snapshot_0000000000000000000_0000000000000000990.pb",
            "batch_00000000000000000x0_0000000000000000990.pb",
            "batch_0000000000000000990_0000000000000000000.pb",
            "batch_000_000.pb",
        ] {
            assert!(bad.parse::<BatchFileName>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_schema_name_derivation() -> anyhow::Result<()> {
        let run: RunId = "Run-2024.03_A".parse()?;
        assert_eq!(run.schema_name(), "run_run_2024_03_a");
        Ok(())
    }

    #[test]
    fn test_run_id_rejects_separators() {
        assert!("".parse::<RunId>().is_err());
        assert!("a/b".parse::<RunId>().is_err());
        assert!("a b".parse::<RunId>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn proptest_lexicographic_order_matches_tick_order(
            a in 0i64..1_000_000_000,
            b in 0i64..1_000_000_000,
            len in 0i64..10_000,
        ) {
            let fa = BatchFileName::from_range(TickRange::new(a, a + len).unwrap());
            let fb = BatchFileName::from_range(TickRange::new(b, b + len).unwrap());
            prop_assert_eq!(fa.as_str().cmp(fb.as_str()), a.cmp(&b));
        }
    }
}
