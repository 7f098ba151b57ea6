//! # Versioned Field Policy
//!
//! Every wire-format rule that depends on the protocol version lives in this
//! file. Encoders and decoders never compare raw version numbers; they ask a
//! [`ProtocolVersion`] whether a [`Feature`] is enabled.
//!
//! | Feature                      | Since | Effect                                          |
//! |------------------------------|-------|-------------------------------------------------|
//! | `GetDataOptionArgument`      | 14    | GetData carries its option argument             |
//! | `OpResultPath`               | 14    | GetData op result carries a path                |
//! | `Batch`                      | 15    | Batch requests are accepted                     |
//! | `CheckChildAndAclVersion`    | 16    | Check carries cversion and aversion             |
//! | `ExecutionQueue`             | 17    | request preamble carries execution queue data   |
//! | `DeleteMode`                 | 18    | Delete carries a u16 mode instead of a bool     |
//! | `Move`                       | 19    | Move requests are accepted                      |
//! | `ScheduledName`              | 20    | Multi carries an optional scheduled name        |
//! | `TimeStreamId`               | 21    | request preamble carries a time stream id       |
//! | `NullableCreateResultPath`   | 22    | Create op result path is a nullable string      |
//! | `WatcherKindByte`            | 23    | WatcherCall carries the kind byte verbatim      |
//! | `WatchedEventPayload`        | 23    | WatchedEvent carries data and stat              |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Oldest wire-format version this crate reads and writes.
pub const MINIMUM_SUPPORTED_VERSION: u32 = 13;

/// Newest wire-format version this crate reads and writes.
pub const MAXIMUM_SUPPORTED_VERSION: u32 = 25;

/// A version-gated wire feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    GetDataOptionArgument,
    OpResultPath,
    Batch,
    CheckChildAndAclVersion,
    ExecutionQueue,
    DeleteMode,
    Move,
    ScheduledName,
    TimeStreamId,
    NullableCreateResultPath,
    WatcherKindByte,
    WatchedEventPayload,
}

impl Feature {
    pub const ALL: [Feature; 12] = [
        Feature::GetDataOptionArgument,
        Feature::OpResultPath,
        Feature::Batch,
        Feature::CheckChildAndAclVersion,
        Feature::ExecutionQueue,
        Feature::DeleteMode,
        Feature::Move,
        Feature::ScheduledName,
        Feature::TimeStreamId,
        Feature::NullableCreateResultPath,
        Feature::WatcherKindByte,
        Feature::WatchedEventPayload,
    ];

    /// The first version in which this feature is present on the wire.
    pub const fn introduced_in(self) -> u32 {
        match self {
            Feature::GetDataOptionArgument | Feature::OpResultPath => 14,
            Feature::Batch => 15,
            Feature::CheckChildAndAclVersion => 16,
            Feature::ExecutionQueue => 17,
            Feature::DeleteMode => 18,
            Feature::Move => 19,
            Feature::ScheduledName => 20,
            Feature::TimeStreamId => 21,
            Feature::NullableCreateResultPath => 22,
            Feature::WatcherKindByte | Feature::WatchedEventPayload => 23,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Feature::GetDataOptionArgument => "GetData option argument",
            Feature::OpResultPath => "GetData op result path",
            Feature::Batch => "Batch request",
            Feature::CheckChildAndAclVersion => "Check cversion/aversion",
            Feature::ExecutionQueue => "execution queue",
            Feature::DeleteMode => "Delete mode",
            Feature::Move => "Move request",
            Feature::ScheduledName => "Multi scheduled name",
            Feature::TimeStreamId => "time stream id",
            Feature::NullableCreateResultPath => "nullable Create result path",
            Feature::WatcherKindByte => "watcher kind byte",
            Feature::WatchedEventPayload => "watched event data and stat",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A validated wire-format version in
/// [`MINIMUM_SUPPORTED_VERSION`]..=[`MAXIMUM_SUPPORTED_VERSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ProtocolVersion(u32);

impl ProtocolVersion {
    pub const OLDEST: ProtocolVersion = ProtocolVersion(MINIMUM_SUPPORTED_VERSION);
    pub const LATEST: ProtocolVersion = ProtocolVersion(MAXIMUM_SUPPORTED_VERSION);

    /// Validate a raw version number.
    pub fn new(version: u32) -> Result<Self> {
        if (MINIMUM_SUPPORTED_VERSION..=MAXIMUM_SUPPORTED_VERSION).contains(&version) {
            Ok(ProtocolVersion(version))
        } else {
            Err(ProtocolError::VersionOutOfRange(version))
        }
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn supports(self, feature: Feature) -> bool {
        self.0 >= feature.introduced_in()
    }

    /// Fail with `UnsupportedFeature` unless `feature` is enabled.
    pub fn require(self, feature: Feature) -> Result<()> {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(ProtocolError::UnsupportedFeature {
                feature: feature.name(),
                version: self.0,
            })
        }
    }

    /// Features enabled at this version.
    pub fn features(self) -> impl Iterator<Item = Feature> {
        Feature::ALL.into_iter().filter(move |f| self.supports(*f))
    }

    /// Every supported version, oldest first.
    pub fn all() -> impl Iterator<Item = ProtocolVersion> {
        (MINIMUM_SUPPORTED_VERSION..=MAXIMUM_SUPPORTED_VERSION).map(ProtocolVersion)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl TryFrom<u32> for ProtocolVersion {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ProtocolVersion> for u32 {
    fn from(v: ProtocolVersion) -> u32 {
        v.0
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
