//! Payload schemas.
//!
//! A schema turns the raw JSON value of a delivery into the payload type a
//! handler expects, or rejects it. A rejection takes the same path as a handler
//! error.

use crate::error::ValidationError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use validator::Validate;

/// Validates and converts a raw payload.
pub trait Schema<P>: Send + Sync {
    fn validate(&self, raw: Value) -> Result<P, ValidationError>;
}

impl<P, F> Schema<P> for F
where
    F: Fn(Value) -> Result<P, ValidationError> + Send + Sync,
{
    fn validate(&self, raw: Value) -> Result<P, ValidationError> {
        (self)(raw)
    }
}

/// Deserializes the payload with serde.
///
/// Unknown fields are dropped unless the payload type denies them. This is
/// what a consumer uses when no schema is given.
pub struct JsonSchema<P>(PhantomData<fn() -> P>);

impl<P> JsonSchema<P> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<P> Default for JsonSchema<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: DeserializeOwned> Schema<P> for JsonSchema<P> {
    fn validate(&self, raw: Value) -> Result<P, ValidationError> {
        Ok(serde_json::from_value(raw)?)
    }
}

/// Deserializes with serde, then runs the `validator` rules of the type.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Deserialize, Validate)]
/// struct Signup {
///     #[validate(email)]
///     email: String,
/// }
///
/// worker.set_consumer_with_schema(handler, ValidatedSchema::<Signup>::new()).await?;
/// ```
pub struct ValidatedSchema<P>(PhantomData<fn() -> P>);

impl<P> ValidatedSchema<P> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<P> Default for ValidatedSchema<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: DeserializeOwned + Validate> Schema<P> for ValidatedSchema<P> {
    fn validate(&self, raw: Value) -> Result<P, ValidationError> {
        let payload: P = serde_json::from_value(raw)?;
        payload.validate()?;
        Ok(payload)
    }
}
