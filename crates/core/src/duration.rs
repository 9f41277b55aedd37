//! Serde (de)serialization of [`Duration`] as a Go-style duration string
//! (`"500ms"`, `"30s"`, `"10m"`), matching the format operators expect in
//! configuration files.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub mod serde_dur {
	use super::*;

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&durationfmt::to_string(*d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(d)?;
		go_parse_duration::parse_duration(&raw)
			.map_err(|e| serde::de::Error::custom(format!("invalid duration {raw:?}: {e:?}")))
			.map(|nanos| Duration::from_nanos(nanos.max(0) as u64))
	}
}

pub mod serde_dur_option {
	use super::*;

	pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
		match d {
			Some(d) => s.serialize_some(&durationfmt::to_string(*d)),
			None => s.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
		let raw: Option<String> = Option::deserialize(d)?;
		match raw {
			None => Ok(None),
			Some(raw) => go_parse_duration::parse_duration(&raw)
				.map_err(|e| serde::de::Error::custom(format!("invalid duration {raw:?}: {e:?}")))
				.map(|nanos| Some(Duration::from_nanos(nanos.max(0) as u64))),
		}
	}
}
