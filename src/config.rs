//! Configuration types for flow subscribers and polling publishers

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult};

/// Default upper bound on items whose processing is outstanding at once
pub const MAX_PROCESSING_CONCURRENCY: usize = 1000;
/// Default number of items demanded from the producer per request
pub const BACK_PRESSURE_CHUNK_SIZE: usize = 1;

/// Back-pressure and concurrency limits for a [`crate::subscriber::CompletionSubscriber`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Maximum number of items that can have their processing outstanding at any given time
    pub max_concurrency: usize,
    /// Number of items demanded in one request from the upstream publisher
    pub chunk_size: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            max_concurrency: MAX_PROCESSING_CONCURRENCY,
            chunk_size: BACK_PRESSURE_CHUNK_SIZE,
        }
    }
}

impl SubscriberConfig {
    pub fn new(max_concurrency: usize, chunk_size: usize) -> Self {
        Self {
            max_concurrency,
            chunk_size,
        }
    }

    /// `chunk_size` may not exceed `max_concurrency`, otherwise a single
    /// request could overrun the concurrency ceiling.
    pub fn validate(&self) -> FlowResult<()> {
        if self.max_concurrency == 0 {
            return Err(FlowError::InvalidConfiguration(
                "max_concurrency must be positive".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(FlowError::InvalidConfiguration(
                "chunk_size must be positive".to_string(),
            ));
        }
        if self.chunk_size > self.max_concurrency {
            return Err(FlowError::InvalidConfiguration(format!(
                "chunk_size {} exceeds max_concurrency {}",
                self.chunk_size, self.max_concurrency
            )));
        }
        Ok(())
    }

    pub fn from_json(body: &str) -> FlowResult<Self> {
        let config: Self = serde_json::from_str(body)?;
        config.validate()?;
        Ok(config)
    }
}

/// Polling parameters for a [`crate::polling::PollingPublisher`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Maximum number of outstanding polls a single polling loop may have
    pub max_polls_per_thread: usize,
    /// Number of independent polling loops
    pub polling_threads: usize,
    /// Items buffered between the pollers and the subscriber
    pub buffer_capacity: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            max_polls_per_thread: 100,
            polling_threads: 1,
            buffer_capacity: 256,
        }
    }
}

impl PollingConfig {
    pub fn validate(&self) -> FlowResult<()> {
        let checks = [
            (self.max_polls_per_thread, "max_polls_per_thread"),
            (self.polling_threads, "polling_threads"),
            (self.buffer_capacity, "buffer_capacity"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(FlowError::InvalidConfiguration(format!(
                    "{} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn from_json(body: &str) -> FlowResult<Self> {
        let config: Self = serde_json::from_str(body)?;
        config.validate()?;
        Ok(config)
    }
}

/// Character set used to decode lines from raw byte chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Charset {
    /// Malformed sequences decode to U+FFFD
    #[default]
    Utf8,
    /// ISO-8859-1, one character per byte
    Latin1,
}

impl Charset {
    pub(crate) fn decode(self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }

    pub(crate) fn encode(self, text: &str) -> FlowResult<Vec<u8>> {
        match self {
            Charset::Utf8 => Ok(text.as_bytes().to_vec()),
            Charset::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(c).map_err(|_| {
                        FlowError::InvalidConfiguration(format!("{:?} is not representable in latin1", c))
                    })
                })
                .collect(),
        }
    }
}

/// How a [`crate::lines::LineSubscriber`] cuts byte chunks into text lines
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfig {
    pub charset: Charset,
    /// Line separator. `None` accepts any of `\n`, `\r\n` and `\r`.
    pub separator: Option<String>,
}

impl LineConfig {
    pub fn with_separator(separator: impl Into<String>) -> Self {
        Self {
            separator: Some(separator.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> FlowResult<()> {
        if let Some(separator) = &self.separator {
            if separator.is_empty() {
                return Err(FlowError::InvalidConfiguration(
                    "line separator must not be empty".to_string(),
                ));
            }
            self.charset.encode(separator)?;
        }
        Ok(())
    }

    pub fn from_json(body: &str) -> FlowResult<Self> {
        let config: Self = serde_json::from_str(body)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SubscriberConfig::default().validate().is_ok());
        assert!(PollingConfig::default().validate().is_ok());
    }

    #[test]
    fn chunk_larger_than_concurrency_is_rejected() {
        let err = SubscriberConfig::new(1, 2).validate().unwrap_err();
        assert!(matches!(err, FlowError::InvalidConfiguration(_)));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = PollingConfig::from_json(r#"{"polling_threads": 4}"#).unwrap();
        assert_eq!(config.polling_threads, 4);
        assert_eq!(config.max_polls_per_thread, 100);
        assert_eq!(config.buffer_capacity, 256);
    }

    #[test]
    fn line_separator_must_fit_the_charset() {
        assert!(LineConfig::with_separator("").validate().is_err());
        let config = LineConfig {
            charset: Charset::Latin1,
            separator: Some("\u{2028}".to_string()),
        };
        assert!(config.validate().is_err());
        let config = LineConfig::from_json(r#"{"charset": "latin1", "separator": ";"}"#).unwrap();
        assert_eq!(config.charset, Charset::Latin1);
    }

    #[test]
    fn zero_values_are_rejected_from_json() {
        assert!(SubscriberConfig::from_json(r#"{"max_concurrency": 0}"#).is_err());
    }
}
