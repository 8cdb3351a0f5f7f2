//! Error type shared by the seda crates.
use std::borrow::Cow;
use std::error::Error;
use std::fmt;

pub type Result<T, E = SedaError> = std::result::Result<T, E>;

/// General error for the pipeline runtime.
///
/// Carries a message, an optional source error, and any number of key/value
/// fields describing where the error happened (stage name, pool name, etc).
#[derive(Debug)]
pub struct SedaError {
    inner: Box<SedaErrorInner>,
}

#[derive(Debug)]
struct SedaErrorInner {
    msg: String,
    source: Option<Box<dyn Error + Send + Sync>>,
    fields: Vec<ErrorField>,
}

#[derive(Debug)]
struct ErrorField {
    key: Cow<'static, str>,
    value: String,
}

impl SedaError {
    pub fn new(msg: impl Into<String>) -> Self {
        SedaError {
            inner: Box::new(SedaErrorInner {
                msg: msg.into(),
                source: None,
                fields: Vec::new(),
            }),
        }
    }

    pub fn with_source(msg: impl Into<String>, source: Box<dyn Error + Send + Sync>) -> Self {
        SedaError {
            inner: Box::new(SedaErrorInner {
                msg: msg.into(),
                source: Some(source),
                fields: Vec::new(),
            }),
        }
    }

    /// Attach an additional field to the error.
    ///
    /// Fields are printed alongside the message.
    pub fn with_field<V>(mut self, key: impl Into<Cow<'static, str>>, value: V) -> Self
    where
        V: fmt::Display,
    {
        self.inner.fields.push(ErrorField {
            key: key.into(),
            value: value.to_string(),
        });
        self
    }

    pub fn message(&self) -> &str {
        &self.inner.msg
    }

    /// Get the value of the first field with the given key.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.inner
            .fields
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }
}

impl fmt::Display for SedaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;

        if !self.inner.fields.is_empty() {
            write!(f, " [")?;
            for (idx, field) in self.inner.fields.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", field.key, field.value)?;
            }
            write!(f, "]")?;
        }

        if let Some(source) = &self.inner.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl Error for SedaError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

impl From<std::io::Error> for SedaError {
    fn from(value: std::io::Error) -> Self {
        SedaError::with_source("IO error", Box::new(value))
    }
}

/// Wrap arbitrary errors with additional context.
pub trait ResultExt<T, E> {
    fn context(self, msg: &'static str) -> Result<T>;

    /// Like `context`, but the message is only built on error.
    fn context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T, E> for std::result::Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    fn context(self, msg: &'static str) -> Result<T> {
        self.map_err(|e| SedaError::with_source(msg, Box::new(e)))
    }

    fn context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| SedaError::with_source(f(), Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_fields() {
        let err = SedaError::new("Unknown next stage")
            .with_field("stage", "SessionStage")
            .with_field("next", "Missing");

        assert_eq!(
            "Unknown next stage [stage: SessionStage, next: Missing]",
            err.to_string()
        );
        assert_eq!(Some("Missing"), err.field("next"));
        assert_eq!(None, err.field("pool"));
    }

    #[test]
    fn context_keeps_source() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::other("disk on fire"));
        let err = res.context("Failed to read pipeline config").unwrap_err();

        assert_eq!("Failed to read pipeline config", err.message());
        assert!(err.source().is_some());
        assert_eq!(
            "Failed to read pipeline config: disk on fire",
            err.to_string()
        );
    }

    #[test]
    fn context_nests_seda_errors() {
        let res: Result<()> = Err(SedaError::new("inner"));
        let err = res
            .context_fn(|| format!("outer {}", 1))
            .unwrap_err();

        assert_eq!("outer 1: inner", err.to_string());
    }
}
